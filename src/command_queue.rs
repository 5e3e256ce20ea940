// src/command_queue.rs
// Bounded queue of deferred calls executed on the processing thread

use crossbeam::channel::{self, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;

use crate::config::CommandQueueConfig;
use crate::error::CommandError;

pub type Command<T> = Box<dyn FnOnce(&mut T) + Send>;

/// Commands are closures over the object that owns the queue. Any thread may
/// push; only the processing thread drains, once per cycle, so every change
/// lands at the start of a cycle.
pub struct CommandQueue<T> {
    sender: Sender<Command<T>>,
    receiver: Receiver<Command<T>>,
    enqueue_timeout: Duration,
    exec_timeout: Duration,
}

impl<T> CommandQueue<T> {
    pub fn new(config: &CommandQueueConfig) -> Self {
        let (sender, receiver) = channel::bounded(config.capacity.max(1));
        Self {
            sender,
            receiver,
            enqueue_timeout: config.enqueue_timeout(),
            exec_timeout: config.exec_timeout(),
        }
    }

    /// Push a command without waiting for it to run.
    pub fn queue<F>(&self, f: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        match self.sender.send_timeout(Box::new(f), self.enqueue_timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => {
                log::warn!("command queue full for {:?}", self.enqueue_timeout);
                Err(CommandError::EnqueueTimeout(self.enqueue_timeout))
            }
            Err(SendTimeoutError::Disconnected(_)) => Err(CommandError::Disconnected),
        }
    }

    /// Push a command and block until the processing thread has run it,
    /// returning whatever the command produced.
    pub fn exec<R, F>(&self, f: F) -> Result<R, CommandError>
    where
        R: Send + 'static,
        F: FnOnce(&mut T) -> R + Send + 'static,
    {
        let (done_tx, done_rx) = channel::bounded(1);
        self.queue(move |target: &mut T| {
            // The waiter may have timed out already.
            let _ = done_tx.send(f(target));
        })?;
        match done_rx.recv_timeout(self.exec_timeout) {
            Ok(result) => Ok(result),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("queued command not executed within {:?}", self.exec_timeout);
                Err(CommandError::ExecTimeout(self.exec_timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(CommandError::Disconnected),
        }
    }

    /// Push a command and wait for completion, discarding its value.
    pub fn queue_and_wait<F>(&self, f: F) -> Result<(), CommandError>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        self.exec(f)
    }

    /// Run every queued command in FIFO order. Never blocks.
    pub fn proc_exec_all(&self, target: &mut T) -> usize {
        let mut n = 0;
        while let Ok(cmd) = self.receiver.try_recv() {
            cmd(target);
            n += 1;
        }
        n
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn quick_config(capacity: usize) -> CommandQueueConfig {
        CommandQueueConfig {
            capacity,
            enqueue_timeout_ms: 20,
            exec_timeout_ms: 50,
        }
    }

    #[test]
    fn test_exec_all_runs_in_order() {
        let queue: CommandQueue<Vec<u32>> = CommandQueue::new(&quick_config(8));
        for i in 0..5 {
            queue.queue(move |v: &mut Vec<u32>| v.push(i)).unwrap();
        }
        let mut target = Vec::new();
        assert_eq!(queue.proc_exec_all(&mut target), 5);
        assert_eq!(target, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_full_times_out() {
        let queue: CommandQueue<u32> = CommandQueue::new(&quick_config(2));
        queue.queue(|_| {}).unwrap();
        queue.queue(|_| {}).unwrap();
        let err = queue.queue(|_| {}).unwrap_err();
        assert_eq!(err, CommandError::EnqueueTimeout(Duration::from_millis(20)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_exec_without_processing_times_out() {
        let queue: CommandQueue<u32> = CommandQueue::new(&quick_config(4));
        let err = queue.exec(|v: &mut u32| *v).unwrap_err();
        assert_eq!(err, CommandError::ExecTimeout(Duration::from_millis(50)));
    }

    #[test]
    fn test_exec_returns_value_from_processing_thread() {
        let queue: Arc<CommandQueue<u32>> = Arc::new(CommandQueue::new(&CommandQueueConfig {
            capacity: 4,
            enqueue_timeout_ms: 1000,
            exec_timeout_ms: 1000,
        }));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = {
            let queue = Arc::clone(&queue);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut value = 41u32;
                while !stop.load(Ordering::Relaxed) {
                    queue.proc_exec_all(&mut value);
                    thread::sleep(Duration::from_millis(1));
                }
                value
            })
        };

        let seen = queue
            .exec(|v: &mut u32| {
                *v += 1;
                *v
            })
            .unwrap();
        assert_eq!(seen, 42);

        stop.store(true, Ordering::Relaxed);
        assert_eq!(worker.join().unwrap(), 42);
    }
}
