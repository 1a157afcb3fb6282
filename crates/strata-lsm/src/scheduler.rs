//! IO scheduler for flush and merge jobs.
//!
//! Jobs run on the blocking pool of a dedicated multi-threaded tokio
//! runtime, so request threads and any runtime the caller owns are never
//! tied up by page I/O.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strata_common::{Result, StrataError};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl InFlight {
    fn enter(&self) {
        *self.count.lock() += 1;
    }

    fn exit(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.idle.wait(&mut count);
        }
    }
}

/// Handle to the result of a submitted job.
pub struct IoTicket<T> {
    name: &'static str,
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> IoTicket<T> {
    /// Job name given at submission.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Blocks until the job finishes. Must not be called from async code.
    pub fn wait(self) -> Result<T> {
        let name = self.name;
        self.receiver
            .blocking_recv()
            .map_err(|_| StrataError::Internal(format!("io job {} was dropped", name)))?
    }

    /// Waits for the job from async code.
    pub async fn wait_async(self) -> Result<T> {
        let name = self.name;
        self.receiver
            .await
            .map_err(|_| StrataError::Internal(format!("io job {} was dropped", name)))?
    }
}

/// Runs flush and merge jobs in the background.
pub struct IoScheduler {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    in_flight: Arc<InFlight>,
    shut_down: AtomicBool,
}

impl IoScheduler {
    /// Starts a runtime with `threads` worker threads.
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .max_blocking_threads(threads.max(1))
            .thread_name("strata-io")
            .enable_time()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Mutex::new(Some(runtime)),
            handle,
            in_flight: Arc::new(InFlight::default()),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Queues `job`. Failures are logged and delivered through the ticket.
    pub fn submit<T, F>(&self, name: &'static str, job: F) -> Result<IoTicket<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(StrataError::IndexClosed);
        }
        let (sender, receiver) = oneshot::channel();
        let in_flight = Arc::clone(&self.in_flight);
        in_flight.enter();

        self.handle.spawn(async move {
            let result = match tokio::task::spawn_blocking(job).await {
                Ok(result) => result,
                Err(e) => Err(StrataError::Internal(format!("io job {} panicked: {}", name, e))),
            };
            if let Err(e) = &result {
                tracing::warn!(job = name, error = %e, "IO job failed");
            }
            // The ticket may have been dropped
            let _ = sender.send(result);
            in_flight.exit();
        });
        Ok(IoTicket { name, receiver })
    }

    /// Jobs submitted and not yet finished.
    pub fn in_flight(&self) -> usize {
        *self.in_flight.count.lock()
    }

    /// Refuses new jobs, waits for in-flight ones and stops the runtime.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.in_flight.wait_idle();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        tracing::debug!("IO scheduler stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl Drop for IoScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_submit_and_wait() {
        let scheduler = IoScheduler::new(2).unwrap();
        let ticket = scheduler.submit("add", || Ok(40 + 2)).unwrap();
        assert_eq!(ticket.name(), "add");
        assert_eq!(ticket.wait().unwrap(), 42);
    }

    #[test]
    fn test_job_error_reaches_ticket() {
        let scheduler = IoScheduler::new(1).unwrap();
        let ticket = scheduler
            .submit::<(), _>("fail", || Err(StrataError::IoError("disk gone".into())))
            .unwrap();
        assert!(matches!(ticket.wait(), Err(StrataError::IoError(_))));
    }

    #[test]
    fn test_panicking_job_is_reported() {
        let scheduler = IoScheduler::new(1).unwrap();
        let ticket = scheduler
            .submit::<(), _>("boom", || panic!("job panicked"))
            .unwrap();
        assert!(matches!(ticket.wait(), Err(StrataError::Internal(_))));
    }

    #[test]
    fn test_shutdown_waits_for_jobs() {
        let scheduler = IoScheduler::new(2).unwrap();
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let done = Arc::clone(&done);
            // Tickets are dropped on purpose
            scheduler
                .submit("sleep", move || {
                    std::thread::sleep(Duration::from_millis(20));
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
        }
        assert!(!scheduler.is_shut_down());
        scheduler.shutdown();
        assert!(scheduler.is_shut_down());
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(scheduler.in_flight(), 0);
        assert!(matches!(
            scheduler.submit("late", || Ok(())),
            Err(StrataError::IndexClosed)
        ));
    }

    #[tokio::test]
    async fn test_wait_async() -> Result<()> {
        let scheduler = IoScheduler::new(1)?;
        let ticket = scheduler.submit("async", || Ok("done"))?;
        assert_eq!(ticket.wait_async().await?, "done");
        scheduler.shutdown();
        Ok(())
    }
}
