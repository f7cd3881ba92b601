//! Background serve loop for non-driving ranks.

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::communication::Transport;
use crate::error::{Result, SearchError};

use super::coordinator::{SearchCoordinator, Served};
use super::core_trait::StrategyPort;

/// A handle to a peer rank following its driving rank on a tokio task.
///
/// The task serves envelopes until the driving rank calls
/// [`SearchCoordinator::shutdown_group`], then hands the coordinator back
/// through [`SearchWorker::join`]. Errors raised while executing a step are
/// raised on every rank alike, so the loop logs them and keeps serving;
/// a transport or codec failure ends it. Dropping the handle aborts the task.
///
/// # Example
///
/// ```ignore
/// let mut transports = LocalGroup::new(2, 1)?.into_transports();
/// let peer = transports.pop().unwrap();
/// let worker = SearchWorker::spawn(SearchCoordinator::new(peer_strategy, peer));
///
/// let mut driver = SearchCoordinator::new(driver_strategy, transports.pop().unwrap());
/// let frontier = driver.search(request).await?;
/// driver.shutdown_group().await?;
/// let peer = worker.join().await?;
/// ```
pub struct SearchWorker<S, T>
where
    S: StrategyPort,
{
    handle: Option<JoinHandle<Result<SearchCoordinator<S, T>>>>,
}

impl<S, T> SearchWorker<S, T>
where
    S: StrategyPort + 'static,
    T: Transport + 'static,
{
    /// Spawns the serve loop for `coordinator`.
    pub fn spawn(mut coordinator: SearchCoordinator<S, T>) -> Self {
        let handle = tokio::spawn(async move {
            let rank = coordinator.topology().rank();
            let mut served = 0usize;
            loop {
                match coordinator.follow().await {
                    Ok(Served::Step(_)) => served += 1,
                    Ok(Served::Shutdown) => {
                        info!(rank, served, "search worker stopped");
                        return Ok(coordinator);
                    }
                    Err(e) if e.is_fatal() => {
                        error!(rank, error = %e, "search worker lost its group");
                        return Err(e);
                    }
                    Err(e) => {
                        warn!(rank, error = %e, "search step failed");
                    }
                }
            }
        });
        Self { handle: Some(handle) }
    }

    /// Waits for the driving rank's shutdown and returns the coordinator.
    pub async fn join(mut self) -> Result<SearchCoordinator<S, T>> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| SearchError::Transport("search worker already joined".to_string()))?;
        handle
            .await
            .map_err(|e| SearchError::Transport(format!("search worker task failed: {e}")))?
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl<S, T> Drop for SearchWorker<S, T>
where
    S: StrategyPort,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
