//! Worker pool: receives control messages and runs the dispatcher on them.

use crate::config::QueueConfig;
use crate::dispatcher::{CommandDispatcher, Disposition};
use crate::queue::{ControlQueue, Delivery};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct WorkerPool {
    queue: Arc<ControlQueue>,
    dispatcher: Arc<CommandDispatcher>,
    workers: usize,
    handler_timeout: Duration,
    retry_delay: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<ControlQueue>,
        dispatcher: Arc<CommandDispatcher>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            dispatcher,
            workers: config.workers.max(1),
            handler_timeout: config.visibility_timeout(),
            retry_delay: config.retry_delay(),
        }
    }

    /// Handle one delivery and settle it on the queue.
    pub async fn process(&self, delivery: Delivery) -> Disposition {
        let message = &delivery.message;
        let disposition =
            match tokio::time::timeout(self.handler_timeout, self.dispatcher.handle(message)).await {
                Ok(disposition) => disposition,
                Err(_) => {
                    tracing::warn!(
                        message_id = %message.message_id,
                        kind = %message.command.kind,
                        timeout = ?self.handler_timeout,
                        "handler exceeded visibility timeout"
                    );
                    Disposition::Retry
                }
            };

        let settled = match disposition {
            Disposition::Ack => self.queue.ack(delivery.receipt),
            Disposition::Retry => self.queue.release(delivery.receipt, self.retry_delay),
            Disposition::Drop => self.queue.dead_letter(
                delivery.receipt,
                format!("{} dropped by dispatcher", message.command.kind),
            ),
        };
        if let Err(error) = settled {
            // The visibility timeout already returned the message to the queue.
            tracing::debug!(message_id = %message.message_id, %error, "could not settle message");
        }
        disposition
    }

    /// Process messages until none is visible. Returns how many were handled.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.queue.try_receive() {
            self.process(delivery).await;
            handled += 1;
        }
        handled
    }

    /// Start the workers. Each exits when `shutdown` flips or the queue closes.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        tracing::info!(workers = self.workers, "starting dispatcher workers");
        (0..self.workers)
            .map(|worker| {
                let pool = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    loop {
                        let delivery = tokio::select! {
                            delivery = pool.queue.receive() => delivery,
                            _ = shutdown.wait_for(|stop| *stop) => None,
                        };
                        let Some(delivery) = delivery else {
                            break;
                        };
                        pool.process(delivery).await;
                    }
                    tracing::debug!(worker, "dispatcher worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::BuilderConfig;
    use crate::dispatcher::DispatcherConfig;
    use crate::fleet::{FleetRegistry, NoopTransport};
    use crate::model::{ControlCommand, IndexClass, Project};
    use crate::orchestrator::{BuildOrchestrator, ScriptedFleet};
    use crate::store::{MemoryStore, MetadataStore};

    fn pool(store: Arc<MemoryStore>, queue: Arc<ControlQueue>) -> WorkerPool {
        let orchestrator = Arc::new(BuildOrchestrator::new(
            Arc::new(ScriptedFleet::new()),
            store.clone(),
            queue.clone(),
            BuilderConfig::default(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store,
            Arc::new(MemoryBlobStore::new()),
            orchestrator,
            Arc::new(FleetRegistry::new(1, 1, Arc::new(NoopTransport))),
            queue.clone(),
            DispatcherConfig::default(),
        ));
        WorkerPool::new(queue, dispatcher, &QueueConfig::default())
    }

    #[tokio::test]
    async fn drain_settles_every_message() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        let queue = Arc::new(ControlQueue::new(Duration::from_secs(60)));
        let pool = pool(store.clone(), queue.clone());

        queue.send(&ControlCommand::build("p1")).unwrap();
        queue.send(&ControlCommand::refresh("p1", 9, None)).unwrap();

        assert_eq!(pool.drain().await, 2);
        let stats = queue.stats();
        assert_eq!(stats.depth, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(store.list_indexes("p1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn spawned_workers_stop_on_shutdown() {
        let store = Arc::new(MemoryStore::new());
        let queue = Arc::new(ControlQueue::new(Duration::from_secs(60)));
        let pool = Arc::new(pool(store, queue.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = pool.spawn(shutdown_rx);
        queue.send(&ControlCommand::resched()).unwrap();
        shutdown_tx.send(true).unwrap();

        for handle in handles {
            handle.await.unwrap();
        }
    }
}
