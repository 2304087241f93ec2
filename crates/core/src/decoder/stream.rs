//! Ordered worker queues standing in for device streams.

use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};

use crate::error::{DecodeError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A FIFO queue drained by one worker thread.
///
/// Jobs submitted to the same stream run strictly in submission order; jobs
/// on different streams run concurrently. Dropping the stream lets queued
/// jobs finish, then joins the worker.
pub struct DecodeStream {
    id: usize,
    job_tx: Option<mpsc::UnboundedSender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl DecodeStream {
    pub fn spawn(id: usize) -> Result<Self> {
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<Job>();
        let worker = thread::Builder::new()
            .name(format!("decode-stream-{id}"))
            .spawn(move || {
                while let Some(job) = job_rx.blocking_recv() {
                    job();
                }
                tracing::trace!(stream = id, "decode stream drained");
            })
            .map_err(|e| DecodeError::Device(format!("failed to start stream {id}: {e}")))?;
        Ok(Self {
            id,
            job_tx: Some(job_tx),
            worker: Some(worker),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Enqueue `job`; the receiver completes with its result.
    pub fn submit<T, F>(&self, job: F) -> Result<oneshot::Receiver<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            // The receiver may have been dropped; the work is done either way.
            let _ = done_tx.send(job());
        });
        self.job_tx
            .as_ref()
            .ok_or_else(|| DecodeError::Device(format!("stream {} is closed", self.id)))?
            .send(job)
            .map_err(|_| DecodeError::Device(format!("stream {} worker stopped", self.id)))?;
        Ok(done_rx)
    }
}

impl Drop for DecodeStream {
    fn drop(&mut self) {
        self.job_tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(stream = self.id, "decode stream worker panicked");
            }
        }
    }
}

impl std::fmt::Debug for DecodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeStream").field("id", &self.id).finish()
    }
}

/// Block until a stream job completes.
///
/// Backed by `blocking_recv`, which panics when called on a tokio runtime
/// thread; async callers use [`wait_async`].
pub(crate) fn wait<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.blocking_recv().map_err(|_| job_dropped())
}

pub(crate) async fn wait_async<T>(rx: oneshot::Receiver<T>) -> Result<T> {
    rx.await.map_err(|_| job_dropped())
}

fn job_dropped() -> DecodeError {
    DecodeError::Device("decode job dropped before completing".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn jobs_run_in_submission_order() {
        let stream = DecodeStream::spawn(0).unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        let receivers: Vec<_> = (0..16)
            .map(|i| {
                let log = Arc::clone(&log);
                stream
                    .submit(move || {
                        log.lock().unwrap().push(i);
                        i * 2
                    })
                    .unwrap()
            })
            .collect();
        let results: Vec<i32> = receivers.into_iter().map(|rx| wait(rx).unwrap()).collect();
        assert_eq!(results, (0..16).map(|i| i * 2).collect::<Vec<_>>());
        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn drop_finishes_queued_jobs() {
        let log = Arc::new(Mutex::new(0));
        {
            let stream = DecodeStream::spawn(1).unwrap();
            for _ in 0..8 {
                let log = Arc::clone(&log);
                let _ = stream.submit(move || *log.lock().unwrap() += 1).unwrap();
            }
        }
        assert_eq!(*log.lock().unwrap(), 8);
    }

    #[test]
    fn panicking_job_surfaces_as_device_error() {
        let stream = DecodeStream::spawn(2).unwrap();
        let rx = stream.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert!(matches!(wait(rx), Err(DecodeError::Device(_))));
    }
}
