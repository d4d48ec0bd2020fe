use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc as channel, Arc,
    },
    thread::{Builder, JoinHandle},
};

use crate::error::{Error, Result};

pub const DEFAULT_POOL_CAPACITY: usize = 4;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

enum WorkerMessage {
    Task(Task),
    Terminate,
}

/// Fixed set of completion threads. Dropping the pool stops and joins them.
pub struct ThreadPool {
    workers: Vec<Worker>,
    spawner: Spawner,
}

/// Submit side of a [`ThreadPool`], cheap to clone and share.
#[derive(Clone)]
pub struct Spawner {
    senders: Arc<[channel::Sender<WorkerMessage>]>,
    next_worker: Arc<AtomicUsize>,
}

impl ThreadPool {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let capacity = capacity.max(1);
        let mut workers = Vec::with_capacity(capacity);
        let mut senders = Vec::with_capacity(capacity);

        for id in 0..capacity {
            let (sender, receiver) = channel::channel::<WorkerMessage>();
            workers.push(Worker::new(id, receiver)?);
            senders.push(sender);
        }

        Ok(Self {
            workers,
            spawner: Spawner {
                senders: senders.into(),
                next_worker: Arc::new(AtomicUsize::new(0)),
            },
        })
    }

    pub fn spawner(&self) -> Spawner {
        self.spawner.clone()
    }

    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.spawner.exec(task)
    }

    pub fn workers_len(&self) -> usize {
        self.workers.len()
    }
}

impl Spawner {
    pub fn exec<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // Round-robin dispatch
        let index = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        self.senders[index]
            .send(WorkerMessage::Task(Box::new(task)))
            .map_err(|_| Error::EngineStopped)
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for sender in self.spawner.senders.iter() {
            let _ = sender.send(WorkerMessage::Terminate);
        }
        for worker in &mut self.workers {
            if let Some(t) = worker.take_thread() {
                let _ = t.join();
            }
        }
    }
}

struct Worker {
    #[allow(dead_code)]
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn new(id: usize, receiver: channel::Receiver<WorkerMessage>) -> io::Result<Self> {
        let thread = Builder::new()
            .name(format!("mill-socket-worker-{id}"))
            .spawn(move || {
                while let Ok(message) = receiver.recv() {
                    match message {
                        WorkerMessage::Task(task) => task(),
                        WorkerMessage::Terminate => break,
                    }
                }
            })?;

        Ok(Self {
            id,
            thread: Some(thread),
        })
    }

    fn take_thread(&mut self) -> Option<JoinHandle<()>> {
        self.thread.take()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        sync::Arc,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_thread_pool_creation() {
        let pool = ThreadPool::new(4).unwrap();
        assert_eq!(pool.workers_len(), 4);
    }

    #[test]
    fn test_zero_capacity_still_gets_a_worker() {
        let pool = ThreadPool::new(0).unwrap();
        assert_eq!(pool.workers_len(), 1);
    }

    #[test]
    fn test_multiple_tasks() {
        let pool = ThreadPool::new(4).unwrap();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let counter_clone = counter.clone();
            pool.exec(move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_pool_cleanup_runs_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2).unwrap();
            let counter_clone = counter.clone();

            pool.exec(move || {
                std::thread::sleep(Duration::from_millis(50));
                counter_clone.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_spawner_fails_after_pool_dropped() {
        let pool = ThreadPool::new(1).unwrap();
        let spawner = pool.spawner();
        drop(pool);
        assert!(matches!(spawner.exec(|| {}), Err(Error::EngineStopped)));
    }
}
