// src/looper/process.rs
// Drives a set of loops through one cycle, split at their points of interest

use super::basic_loop::BasicLoop;
use crate::error::{EngineError, Result};

/// Process `n_samples` on every loop.
///
/// Channel buffers must already be bound. The cycle is cut into sub-cycles
/// that end at the earliest POI of any loop. Commands are drained before
/// each sub-cycle's step is chosen, so a command arriving mid-cycle waits
/// for the next sub-cycle instead of moving a POI under a running step.
/// After each sub-cycle all loops handle their POIs first, then their sync
/// sources. Sync is repeated until nothing new triggers so that chains of
/// synced loops settle regardless of their order in `loops`.
pub fn process_loops(loops: &mut [&mut BasicLoop], n_samples: u32) -> Result<()> {
    for lp in loops.iter_mut() {
        lp.proc_update_poi();
    }

    let mut processed = 0;
    while processed < n_samples {
        for lp in loops.iter_mut() {
            lp.proc_handle_command_queue();
            lp.proc_handle_poi();
        }
        let remaining = n_samples - processed;
        let step = loops
            .iter()
            .filter_map(|lp| lp.proc_get_next_poi())
            .fold(remaining, u32::min);
        if step == 0 {
            return Err(EngineError::ProcessPastPoi {
                requested: remaining,
                allowed: 0,
            });
        }

        for lp in loops.iter_mut() {
            lp.proc_process_drained(step)?;
        }
        for lp in loops.iter_mut() {
            lp.proc_handle_poi();
        }
        for _ in 0..loops.len() {
            let mut triggered = false;
            for lp in loops.iter_mut() {
                triggered |= lp.proc_handle_sync();
            }
            if !triggered {
                break;
            }
        }
        processed += step;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioChannel, BufferPool};
    use crate::config::EngineConfig;
    use crate::looper::{Channel, ChannelMode, LoopChannel, LoopMode};
    use crate::midi::{MidiBuffer, MidiChannel, MidiWireEvent};
    use std::sync::Arc;

    fn new_loop() -> BasicLoop {
        let _ = env_logger::builder().is_test(true).try_init();
        BasicLoop::from_config(&EngineConfig::default())
    }

    #[test]
    fn test_cycle_split_at_loop_end() {
        let mut short = new_loop();
        short.set_length(10);
        short.set_mode(LoopMode::Playing);
        let mut long = new_loop();
        long.set_length(100);
        long.set_mode(LoopMode::Playing);

        process_loops(&mut [&mut short, &mut long], 25).unwrap();
        // Short wrapped twice, long kept going.
        assert_eq!(short.position(), 5);
        assert_eq!(long.position(), 25);
        assert_eq!(short.proc_get_next_poi(), Some(5));
        assert_eq!(long.proc_get_next_poi(), Some(75));
    }

    #[test]
    fn test_chained_sync_settles_in_any_order() {
        let mut master = new_loop();
        master.set_length(8);
        master.set_mode(LoopMode::Playing);
        let mut middle = new_loop();
        middle.set_sync_source(Some(&master.handle()));
        let mut last = new_loop();
        last.set_sync_source(Some(&middle.handle()));
        middle.plan_transition(LoopMode::Recording, 0, true);
        last.plan_transition(LoopMode::Recording, 0, true);

        process_loops(&mut [&mut last, &mut middle, &mut master], 8).unwrap();
        assert_eq!(middle.mode(), LoopMode::Recording);
        assert_eq!(last.mode(), LoopMode::Recording);
    }

    #[test]
    fn test_records_into_channels_across_sub_cycles() {
        let config = EngineConfig::from_toml_str("[pool]\nbuffer_size = 16\ntarget_count = 4\n").unwrap();
        let pool = Arc::new(BufferPool::from_config(&config.pool).unwrap());
        let mut lp = BasicLoop::from_config(&config);
        lp.add_channel(AudioChannel::from_config(pool, ChannelMode::Direct, &config));
        lp.add_channel(MidiChannel::from_config(ChannelMode::Direct, &config));
        lp.set_mode(LoopMode::Recording);

        let input: Vec<f32> = (0..24).map(|i| i as f32).collect();
        lp.channel_mut(0)
            .and_then(Channel::as_audio_mut)
            .unwrap()
            .proc_set_recording_buffer(input.clone());
        let mut midi_in = MidiBuffer::from_config(24, &config.midi);
        midi_in.push(12, &[0x90, 60, 100]);
        lp.channel_mut(1)
            .and_then(Channel::as_midi_mut)
            .unwrap()
            .proc_set_recording_buffer(midi_in);

        // A second loop ends every 10 samples, splitting the cycle.
        let mut other = new_loop();
        other.set_length(10);
        other.set_mode(LoopMode::Playing);

        process_loops(&mut [&mut lp, &mut other], 24).unwrap();
        assert_eq!(lp.length(), 24);
        assert_eq!(other.position(), 4);
        let data = lp.channel_mut(0).and_then(Channel::as_audio_mut).unwrap().get_data();
        assert_eq!(data, input);
        let midi = lp.channel_mut(1).and_then(Channel::as_midi_mut).unwrap();
        assert_eq!(midi.retrieve_contents(), vec![MidiWireEvent::new(12, &[0x90, 60, 100])]);
        assert_eq!(midi.length(), 24);
    }
}
