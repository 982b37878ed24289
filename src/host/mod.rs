//! The host execution context: one task that owns event dispatch and the
//! control-plane calls made for push-token binding. The push worker never
//! touches that state directly; it posts `HostTask`s and moves on.

use crate::binding::BindingCoordinator;
use crate::events::{EventBridge, Notification};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostTask {
    BindPushToken(String),
    Notify(Notification),
}

/// Fire-and-forget handle used by the push worker.
#[derive(Debug, Clone)]
pub struct HostHandle {
    tx: mpsc::UnboundedSender<HostTask>,
}

impl HostHandle {
    #[cfg(test)]
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<HostTask>) -> Self {
        Self { tx }
    }

    pub fn post(&self, task: HostTask) {
        if self.tx.send(task).is_err() {
            tracing::warn!("host context is gone, dropping task");
        }
    }
}

pub struct HostContext {
    rx: mpsc::UnboundedReceiver<HostTask>,
    coordinator: Arc<BindingCoordinator>,
    bridge: EventBridge,
}

impl HostContext {
    pub fn new(coordinator: Arc<BindingCoordinator>, bridge: EventBridge) -> (HostHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            HostHandle { tx },
            Self {
                rx,
                coordinator,
                bridge,
            },
        )
    }

    /// Runs until every `HostHandle` is dropped or `shutdown` flips to true.
    /// Binding runs concurrently with event dispatch; in-flight bindings are
    /// aborted on exit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut bindings = JoinSet::new();
        loop {
            tokio::select! {
                task = self.rx.recv() => match task {
                    Some(HostTask::BindPushToken(token)) => {
                        let coordinator = self.coordinator.clone();
                        bindings.spawn(async move {
                            // Failures are logged by the coordinator.
                            let _ = coordinator.bind(token).await;
                        });
                    }
                    Some(HostTask::Notify(notification)) => {
                        self.bridge.dispatch(&notification);
                    }
                    None => break,
                },
                Some(joined) = bindings.join_next() => {
                    if let Err(err) = joined {
                        tracing::warn!(error = %err, "binding task ended abnormally");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        bindings.shutdown().await;
        tracing::info!("host context stopped");
    }
}
