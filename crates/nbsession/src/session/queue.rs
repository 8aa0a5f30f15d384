//! Bounded background queue for `start` jobs.
//!
//! Starting a sandbox waits on container boot, so the chat reply is sent as
//! soon as the job is queued. A fixed set of workers drains the queue, which
//! caps how many sandboxes boot at once.

use log::{debug, error, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::service::SessionService;

/// Default number of concurrent start workers.
pub const DEFAULT_WORKERS: usize = 2;

/// Default number of jobs waiting for a worker.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

/// One queued start request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartJob {
    pub user_id: String,
    pub hostname: String,
}

/// Errors returned by [`StartQueue::submit`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Too many sandboxes are starting, try again shortly.")]
    Full,

    #[error("The start queue is shut down.")]
    Closed,
}

/// Fixed-size worker pool running [`SessionService::start`].
pub struct StartQueue {
    sender: mpsc::Sender<StartJob>,
    workers: Vec<JoinHandle<()>>,
}

impl StartQueue {
    /// Spawn `workers` workers fed by a queue holding up to `capacity` jobs.
    ///
    /// Both values are raised to at least one.
    pub fn spawn(service: SessionService, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|id| tokio::spawn(worker(id, service.clone(), receiver.clone())))
            .collect::<Vec<_>>();
        info!("Start queue running with {} workers", workers.len());

        Self { sender, workers }
    }

    /// Queue a start without waiting for it.
    pub fn submit(&self, job: StartJob) -> Result<(), QueueError> {
        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => {
                error!("Start queue full, dropping start for {}", job.user_id);
                QueueError::Full
            }
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        for handle in self.workers {
            if let Err(e) = handle.await {
                error!("Start worker ended abnormally: {}", e);
            }
        }
    }
}

async fn worker(
    id: usize,
    service: SessionService,
    receiver: Arc<Mutex<mpsc::Receiver<StartJob>>>,
) {
    loop {
        let job = { receiver.lock().await.recv().await };
        let Some(job) = job else {
            debug!("Start worker {} exiting", id);
            return;
        };

        debug!("Start worker {} picked up {}", id, job.user_id);
        // Run each job in its own task so a panic is contained to that job.
        let task_service = service.clone();
        let task_job = job.clone();
        let handle = tokio::spawn(async move {
            task_service
                .start(&task_job.user_id, &task_job.hostname)
                .await
        });

        match handle.await {
            Ok(Ok(url)) => debug!("Start for {} finished: {}", job.user_id, url),
            // Already reported on the ops channel by the service.
            Ok(Err(_)) => {}
            Err(e) => {
                error!("Start for {} aborted: {}", job.user_id, e);
                service
                    .notifier()
                    .notify(&format!("Failed to start {}'s session: {}", job.user_id, e))
                    .await;
            }
        }
    }
}
