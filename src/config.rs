// src/config.rs
// Engine configuration, loadable from TOML

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Samples per pooled buffer. Every audio channel chunk has this size.
    pub buffer_size: usize,
    /// Number of buffers the background worker keeps ready.
    pub target_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: 48000,
            target_count: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandQueueConfig {
    pub capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub exec_timeout_ms: u64,
}

impl CommandQueueConfig {
    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_millis(self.exec_timeout_ms)
    }

    /// Defaults used by channels, which see far fewer commands than loops.
    pub fn for_channels() -> Self {
        Self {
            capacity: 10,
            ..Self::default()
        }
    }
}

impl Default for CommandQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 100,
            enqueue_timeout_ms: 1000,
            exec_timeout_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MidiConfig {
    /// Byte capacity of each MIDI channel's storage arena.
    pub storage_bytes: usize,
    /// Events reserved up front in MIDI buffers created by the engine.
    pub buffer_events: usize,
}

impl Default for MidiConfig {
    fn default() -> Self {
        Self {
            storage_bytes: 64 * 1024,
            buffer_events: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub loop_commands: CommandQueueConfig,
    pub channel_commands: CommandQueueConfig,
    pub midi: MidiConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            loop_commands: CommandQueueConfig::default(),
            channel_commands: CommandQueueConfig::for_channels(),
            midi: MidiConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).context("invalid engine configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self).context("failed to serialize engine configuration")
    }

    fn validate(&self) -> Result<()> {
        if self.pool.buffer_size == 0 {
            anyhow::bail!("pool.buffer_size must be at least 1");
        }
        if self.loop_commands.capacity == 0 || self.channel_commands.capacity == 0 {
            anyhow::bail!("command queue capacity must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_queue_sizes() {
        let config = EngineConfig::default();
        assert_eq!(config.loop_commands.capacity, 100);
        assert_eq!(config.channel_commands.capacity, 10);
        assert_eq!(config.channel_commands.exec_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml_str(
            r#"
            [pool]
            buffer_size = 256

            [midi]
            storage_bytes = 4096
            "#,
        )
        .unwrap();
        assert_eq!(config.pool.buffer_size, 256);
        assert_eq!(config.pool.target_count, 100);
        assert_eq!(config.midi.storage_bytes, 4096);
        assert_eq!(config.loop_commands, CommandQueueConfig::default());
    }

    #[test]
    fn test_rejects_zero_buffer_size() {
        let err = EngineConfig::from_toml_str("[pool]\nbuffer_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("buffer_size"));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_toml_string().unwrap();
        assert_eq!(EngineConfig::from_toml_str(&text).unwrap(), config);
    }
}
