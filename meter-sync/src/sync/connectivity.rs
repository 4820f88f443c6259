use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::remote::RemoteBackend;

/// Shared online/offline flag. Cloning shares the same channel.
#[derive(Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _rx) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Notifies subscribers only when the state actually changes.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "connectivity changed");
            metrics::gauge!("sync_online").set(if online { 1.0 } else { 0.0 });
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Ping the remote every `every` and feed the result into `connectivity`.
pub fn spawn_probe<R: RemoteBackend>(
    remote: Arc<R>,
    connectivity: Connectivity,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    match remote.ping().await {
                        Ok(()) => connectivity.set_online(true),
                        Err(e) => {
                            tracing::debug!(error = %e, "connectivity probe failed");
                            connectivity.set_online(false);
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemote;

    #[tokio::test]
    async fn subscribers_only_see_real_transitions() {
        let connectivity = Connectivity::new(false);
        let mut rx = connectivity.subscribe();

        connectivity.set_online(false);
        assert!(!rx.has_changed().unwrap());

        connectivity.set_online(true);
        assert!(rx.has_changed().unwrap());
        assert!(*rx.borrow_and_update());
        assert!(connectivity.is_online());
    }

    #[tokio::test]
    async fn probe_follows_remote_reachability() {
        let remote = Arc::new(MemoryRemote::default());
        remote.set_reachable(false);
        let connectivity = Connectivity::new(true);
        let cancel = CancellationToken::new();
        let mut rx = connectivity.subscribe();

        let handle = spawn_probe(remote.clone(), connectivity.clone(), Duration::from_millis(10), cancel.clone());

        rx.changed().await.unwrap();
        assert!(!connectivity.is_online());

        remote.set_reachable(true);
        rx.changed().await.unwrap();
        assert!(connectivity.is_online());

        cancel.cancel();
        handle.await.unwrap();
    }
}
