// src/audio/buffer_pool.rs
// Pre-allocated audio buffers with background replenishment

use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::PoolConfig;
use crate::error::{EngineError, Result};

/// A fixed-size sample buffer. Shared by reference count; the last owner
/// to drop it frees it.
pub type AudioBuffer = Arc<Box<[f32]>>;

// Bounds how long the worker can sleep through a missed wakeup.
const REPLENISH_POLL: Duration = Duration::from_millis(50);

struct PoolInner {
    queue: ArrayQueue<AudioBuffer>,
    // Buffers handed back by their owners, recycled or freed by the worker.
    returned: ArrayQueue<AudioBuffer>,
    buffer_size: usize,
    target_count: usize,
    finish: AtomicBool,
    none_available: AtomicBool,
    signal: Mutex<()>,
    wakeup: Condvar,
}

impl PoolInner {
    fn new_buffer(&self) -> AudioBuffer {
        Arc::new(vec![0.0; self.buffer_size].into_boxed_slice())
    }

    /// Zero returned buffers and put them back in the pool. Buffers that
    /// are still shared, or that do not fit, are dropped here.
    fn recycle(&self) {
        while let Some(mut buffer) = self.returned.pop() {
            if let Some(samples) = Arc::get_mut(&mut buffer) {
                samples.fill(0.0);
                let _ = self.queue.push(buffer);
            }
        }
    }

    fn fill(&self) {
        while self.queue.len() < self.target_count && !self.finish.load(Ordering::Relaxed) {
            if self.queue.push(self.new_buffer()).is_err() {
                break;
            }
        }
    }

    fn notify(&self) {
        // Never wait for the worker: if it holds the lock it is awake anyway.
        if let Ok(_guard) = self.signal.try_lock() {
            self.wakeup.notify_one();
        }
    }
}

/// Lock-free source of audio buffers for the processing thread.
///
/// `acquire()` pops from a queue that a background thread keeps topped up.
/// An empty queue falls back to allocating in the caller's thread.
pub struct BufferPool {
    inner: Arc<PoolInner>,
    worker: Option<JoinHandle<()>>,
}

impl BufferPool {
    /// Start a pool of `target_count` buffers of `buffer_size` samples.
    /// A buffer size of 0 is rejected.
    pub fn new(buffer_size: usize, target_count: usize) -> Result<Self> {
        if buffer_size == 0 {
            return Err(EngineError::ZeroBufferSize);
        }
        let inner = Arc::new(PoolInner {
            queue: ArrayQueue::new(target_count.max(1)),
            returned: ArrayQueue::new(target_count.max(1)),
            buffer_size,
            target_count,
            finish: AtomicBool::new(false),
            none_available: AtomicBool::new(false),
            signal: Mutex::new(()),
            wakeup: Condvar::new(),
        });
        inner.fill();

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("buffer-pool".into())
            .spawn(move || Self::replenish(worker_inner))
            .map_err(|e| log::error!("failed to spawn buffer pool worker: {}", e))
            .ok();

        Ok(Self { inner, worker })
    }

    pub fn from_config(config: &PoolConfig) -> Result<Self> {
        Self::new(config.buffer_size, config.target_count)
    }

    fn replenish(inner: Arc<PoolInner>) {
        log::debug!(
            "buffer pool worker started ({} x {} samples)",
            inner.target_count,
            inner.buffer_size
        );
        loop {
            if inner.none_available.swap(false, Ordering::Relaxed) {
                log::warn!("buffer pool ran empty, buffers were allocated on the processing thread");
            }
            inner.recycle();
            inner.fill();

            let Ok(guard) = inner.signal.lock() else {
                break;
            };
            if inner.finish.load(Ordering::Relaxed) {
                break;
            }
            let _ = inner.wakeup.wait_timeout(guard, REPLENISH_POLL);
            if inner.finish.load(Ordering::Relaxed) {
                break;
            }
        }
        log::debug!("buffer pool worker stopped");
    }

    /// Take a buffer. Real-time safe unless the pool is exhausted.
    pub fn acquire(&self) -> AudioBuffer {
        let buffer = match self.inner.queue.pop() {
            Some(buffer) => buffer,
            None => {
                self.inner.none_available.store(true, Ordering::Relaxed);
                self.inner.new_buffer()
            }
        };
        self.inner.notify();
        buffer
    }

    /// Hand a buffer back from the processing thread. The worker frees or
    /// recycles it; only when the return queue is full is it dropped here.
    pub fn release(&self, buffer: AudioBuffer) {
        if let Err(buffer) = self.inner.returned.push(buffer) {
            log::warn!("buffer pool return queue full, freeing on the caller");
            drop(buffer);
        }
        self.inner.notify();
    }

    /// Allocate a buffer of this pool's size without touching the pool.
    /// Used off the processing thread.
    pub fn allocate(&self) -> AudioBuffer {
        self.inner.new_buffer()
    }

    /// Samples per buffer.
    pub fn object_size(&self) -> usize {
        self.inner.buffer_size
    }

    pub fn target_count(&self) -> usize {
        self.inner.target_count
    }

    pub fn n_available(&self) -> usize {
        self.inner.queue.len()
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.inner.finish.store(true, Ordering::Relaxed);
        if let Ok(_guard) = self.inner.signal.lock() {
            self.inner.wakeup.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        while self.inner.queue.pop().is_some() {}
        while self.inner.returned.pop().is_some() {}
    }
}
