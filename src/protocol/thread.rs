use std::{
    sync::{Arc, Mutex, PoisonError, mpsc},
    thread,
};

use log::{debug, error, warn};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads, each serving one connection at a time.
#[derive(Debug)]
pub struct ThreadPool {
    workers: Vec<Worker>,
    sender: Option<mpsc::Sender<Job>>,
}

impl ThreadPool {
    /// # Panics
    ///
    /// Panics if `size` is zero.
    pub fn new(size: usize) -> Self {
        assert!(size > 0);

        let mut workers = Vec::with_capacity(size);
        let (sender, receiver) = mpsc::channel();

        let receiver = Arc::new(Mutex::new(receiver));
        let sender = Some(sender);

        for i in 0..size {
            workers.push(Worker::new(i, Arc::clone(&receiver)));
        }

        Self { workers, sender }
    }

    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let job = Box::new(f);
        match &self.sender {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!("all workers have stopped; dropping job");
                }
            }
            None => warn!("thread pool is shutting down; dropping job"),
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.sender.take());

        for worker in self.workers.drain(..) {
            debug!("shutting down worker {}", worker.id);

            if worker.thread.join().is_err() {
                error!("worker {} panicked", worker.id);
            }
        }
    }
}

#[derive(Debug)]
struct Worker {
    id: usize,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub fn new(id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) -> Self {
        let thread = thread::spawn(move || {
            loop {
                let msg = receiver
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .recv();
                match msg {
                    Ok(job) => {
                        debug!("worker {id} handling a connection");
                        job();
                    }
                    Err(_) => {
                        debug!("worker {id} disconnected");
                        break;
                    }
                }
            }
        });

        Self { id, thread }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn runs_every_job_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let pool = ThreadPool::new(3);

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(pool);

        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    #[should_panic]
    fn empty_pool() {
        ThreadPool::new(0);
    }
}
