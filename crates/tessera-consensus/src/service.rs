//! Publishing consensus status to the rest of the node.
//!
//! Consumers hold an `Arc<dyn ServiceHandle>` and never the concrete
//! [`Service`], so tests can hand them a fixed status instead.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::error::{ConsensusError, ConsensusResult};
use crate::status::Status;

/// Something that can be watched for consensus status.
pub trait ServiceHandle: Send + Sync {
    fn watch(&self) -> Watcher;
}

/// Owner of the status channel.
#[derive(Debug)]
pub struct Service {
    tx: watch::Sender<Option<Arc<Status>>>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Replace the published status.
    pub fn publish(&self, status: Status) {
        debug!(running = status.running(), "publishing consensus status");
        self.tx.send_replace(Some(Arc::new(status)));
    }
}

impl ServiceHandle for Service {
    fn watch(&self) -> Watcher {
        Watcher::new(self.tx.subscribe())
    }
}

/// A receiver of status updates.
#[derive(Debug, Clone)]
pub struct Watcher {
    rx: watch::Receiver<Option<Arc<Status>>>,
}

impl Watcher {
    pub fn new(rx: watch::Receiver<Option<Arc<Status>>>) -> Self {
        Self { rx }
    }

    /// Wait for any published status.
    pub async fn get(&mut self) -> ConsensusResult<Arc<Status>> {
        self.wait(|_| true).await
    }

    /// Wait for a status whose service is running.
    pub async fn get_running(&mut self) -> ConsensusResult<Arc<Status>> {
        self.wait(Status::running).await
    }

    async fn wait(&mut self, accept: impl Fn(&Status) -> bool) -> ConsensusResult<Arc<Status>> {
        let current = self
            .rx
            .wait_for(|s| s.as_deref().is_some_and(&accept))
            .await
            .map_err(|_| ConsensusError::ServiceGone)?;
        current.clone().ok_or(ConsensusError::NotRunning)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tessera_state::{KvStore, StateStore};

    use super::*;
    use crate::cluster::LocalCluster;

    fn status(running: bool) -> Status {
        let kv: Arc<dyn KvStore> = Arc::new(StateStore::open_in_memory().unwrap());
        let cluster = Arc::new(LocalCluster::new(kv.clone()).unwrap());
        Status::new(kv, cluster).unwrap().with_running(running)
    }

    #[tokio::test]
    async fn get_waits_for_first_status() {
        let service = Arc::new(Service::new());
        let mut watcher = service.watch();

        let publisher = {
            let service = service.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                service.publish(status(false));
            })
        };

        let got = watcher.get().await.unwrap();
        assert!(!got.running());
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn get_running_skips_stopped_statuses() {
        let service = Arc::new(Service::new());
        service.publish(status(false));
        let mut watcher = service.watch();

        let publisher = {
            let service = service.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                service.publish(status(true));
            })
        };

        let got = watcher.get_running().await.unwrap();
        assert!(got.running());
        publisher.await.unwrap();
    }

    #[tokio::test]
    async fn dropped_service_is_reported() {
        let service = Service::new();
        let mut watcher = service.watch();
        drop(service);

        let err = watcher.get().await.unwrap_err();
        assert!(matches!(err, ConsensusError::ServiceGone));
    }
}
