//! Worker pool competing for main and retry deliveries.
//!
//! A delivery is completed only once the processor reached a terminal
//! decision. On shutdown an in-flight delivery is abandoned so the bus hands
//! it to another worker. A delivery whose processing errors is deferred with
//! backoff, and dead-lettered once its delivery count reaches the limit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::processor::PrimaryProcessor;
use super::retry::RetryPolicy;
use crate::bus::{BusError, Delivery, MessageBus};
use crate::errors::PipelineError;
use crate::models::message::Topic;

const TOPICS: [Topic; 2] = [Topic::Main, Topic::Retry];

/// Resolves once shutdown is signalled. A dropped sender never resolves it.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub struct WorkerPool {
    processor: Arc<PrimaryProcessor>,
    bus: Arc<dyn MessageBus>,
    workers: usize,
    batch_size: usize,
    idle_wait: Duration,
    redelivery: RetryPolicy,
}

/// Redelivery of deliveries whose processing itself errored.
pub fn default_redelivery() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 10,
        base_delay_ms: 1_000,
        max_delay_ms: 60_000,
        jitter_ms: 0,
    }
}

impl WorkerPool {
    pub fn new(processor: Arc<PrimaryProcessor>, bus: Arc<dyn MessageBus>, workers: usize) -> Self {
        Self {
            processor,
            bus,
            workers: workers.max(1),
            batch_size: 10,
            idle_wait: Duration::from_millis(500),
            redelivery: default_redelivery(),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    /// `max_attempts` is the delivery count at which a failing delivery is
    /// dead-lettered instead of deferred.
    pub fn with_redelivery(mut self, redelivery: RetryPolicy) -> Self {
        self.redelivery = redelivery;
        self
    }

    /// Receive and settle one batch from each topic. Returns how many
    /// deliveries were handled.
    pub async fn poll_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<usize, BusError> {
        let mut handled = 0;
        for topic in TOPICS {
            let deliveries = self.bus.receive(topic, self.batch_size).await?;
            let mut pending = deliveries.into_iter();

            while let Some(delivery) = pending.next() {
                let finished = tokio::select! {
                    result = self.processor.process(&delivery) => Some(result),
                    _ = shutdown_signalled(shutdown) => None,
                };

                match finished {
                    Some(Ok(outcome)) => {
                        debug!(message_id = %delivery.message.message_id, outcome = outcome.as_str(), "delivery settled");
                        self.settle(&delivery).await;
                        handled += 1;
                    }
                    Some(Err(e)) => {
                        self.fail(&delivery, &e).await;
                        handled += 1;
                    }
                    None => {
                        info!(message_id = %delivery.message.message_id, "shutdown during processing, abandoning delivery");
                        // Released back to front so the queue keeps its order.
                        let rest: Vec<Delivery> = pending.by_ref().collect();
                        for later in rest.iter().rev() {
                            self.release(later).await;
                        }
                        self.release(&delivery).await;
                        return Ok(handled);
                    }
                }
            }
        }
        Ok(handled)
    }

    async fn settle(&self, delivery: &Delivery) {
        match self.bus.complete(delivery).await {
            Ok(()) => {}
            Err(BusError::LockLost { .. }) => {
                // Another worker now owns it; the upserts make the rerun harmless.
                warn!(message_id = %delivery.message.message_id, "lock expired before completion");
            }
            Err(e) => error!(message_id = %delivery.message.message_id, error = %e, "failed to complete delivery"),
        }
    }

    async fn fail(&self, delivery: &Delivery, error: &PipelineError) {
        let message_id = delivery.message.message_id;
        if delivery.delivery_count >= self.redelivery.max_attempts {
            match self.processor.quarantine(delivery, &error.to_string()).await {
                Ok(_) => {
                    self.settle(delivery).await;
                    return;
                }
                Err(e) => {
                    error!(%message_id, error = %e, "failed to dead-letter delivery over its limit");
                }
            }
        }

        let delay = self.redelivery.backoff(delivery.delivery_count.saturating_sub(1));
        error!(
            %message_id,
            delivery_count = delivery.delivery_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "processing failed, deferring delivery"
        );
        if let Err(e) = self.bus.defer(delivery, delay).await {
            warn!(%message_id, error = %e, "failed to defer delivery; it returns after lock expiry");
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.bus.abandon(delivery).await {
            warn!(message_id = %delivery.message.message_id, error = %e, "failed to abandon delivery; it returns after lock expiry");
        }
    }

    /// Poll until both topics are empty. Used by local tooling and tests.
    pub async fn drain(&self) -> Result<usize, BusError> {
        let (_tx, mut rx) = watch::channel(false);
        let mut total = 0;
        loop {
            let handled = self.poll_once(&mut rx).await?;
            if handled == 0 {
                return Ok(total);
            }
            total += handled;
        }
    }

    /// Start the workers. They stop after `shutdown` flips to `true`.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let pool = self.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    info!(worker_id, "worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        let idle = match pool.poll_once(&mut shutdown).await {
                            Ok(0) => true,
                            Ok(_) => false,
                            Err(e) => {
                                error!(worker_id, error = %e, "bus receive failed");
                                true
                            }
                        };
                        if idle {
                            tokio::select! {
                                _ = tokio::time::sleep(pool.idle_wait) => {}
                                _ = shutdown_signalled(&mut shutdown) => {}
                            }
                        }
                    }
                    info!(worker_id, "worker stopped");
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppState, Backends};
    use crate::audit::AuditSink;
    use crate::bus::memory::MemoryBus;
    use crate::models::arx::TelemetryVector;
    use crate::models::audit::AuditRecord;
    use crate::models::message::{
        ApplicationProperties, BusMessage, DeadLetterReason, DeadLetterRecord, PayloadPointer,
    };
    use crate::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey};
    use crate::models::tenant::TenantInfo;
    use crate::store::memory::MemoryStore;
    use crate::store::{ApprovalStore, StoreError};
    use crate::tenant::StrategyRegistry;
    use async_trait::async_trait;
    use chrono::Utc;
    use tokio::sync::Notify;
    use uuid::Uuid;

    const TENANT: &str = "t-worker";
    const DOCUMENT: &[u8] = br#"{"ApprovalIdentifier": {"DocumentNumber": "PO1", "FiscalYear": "2024"}}"#;

    struct FailingAudit;

    #[async_trait]
    impl AuditSink for FailingAudit {
        async fn record(&self, _record: &AuditRecord) -> anyhow::Result<()> {
            anyhow::bail!("audit table unavailable")
        }
    }

    /// Store whose detail writes never finish.
    #[derive(Default)]
    struct StuckStore {
        entered: Notify,
    }

    #[async_trait]
    impl ApprovalStore for StuckStore {
        async fn upsert_detail(&self, _detail: &ApprovalDetail) -> Result<(), StoreError> {
            self.entered.notify_one();
            std::future::pending().await
        }

        async fn upsert_summary(&self, _summary: &ApprovalSummary) -> Result<(), StoreError> {
            Ok(())
        }

        async fn get_summary(&self, _key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
            Ok(None)
        }
    }

    /// Store whose detail writes outlast a short bus lock.
    #[derive(Default)]
    struct SlowStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl ApprovalStore for SlowStore {
        async fn upsert_detail(&self, detail: &ApprovalDetail) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(80)).await;
            self.inner.upsert_detail(detail).await
        }

        async fn upsert_summary(&self, summary: &ApprovalSummary) -> Result<(), StoreError> {
            self.inner.upsert_summary(summary).await
        }

        async fn get_summary(&self, key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
            self.inner.get_summary(key).await
        }
    }

    fn tenant() -> TenantInfo {
        TenantInfo {
            tenant_id: TENANT.into(),
            doc_type_id: Uuid::new_v4(),
            name: String::new(),
            strategy_tag: "standard".into(),
            validation_tag: "default".into(),
            enabled: true,
            routing: Default::default(),
            validation: Default::default(),
            max_attempts: None,
        }
    }

    fn properties() -> ApplicationProperties {
        ApplicationProperties {
            application_id: TENANT.into(),
            approval_request_version: "1".into(),
            created_date: Utc::now(),
            content_type: "application/json".into(),
        }
    }

    fn pointer_message(payload_id: Uuid) -> BusMessage {
        let pointer = PayloadPointer {
            payload_id,
            tenant_id: TENANT.into(),
            doc_type_id: Uuid::new_v4(),
            telemetry: TelemetryVector {
                xcv: "xcv".into(),
                tcv: "tcv-worker".into(),
                business_process_name: String::new(),
            },
            received_at: Utc::now(),
        };
        BusMessage::new(properties(), "tcv-worker", &pointer).unwrap()
    }

    fn undecodable_message() -> BusMessage {
        BusMessage::new(properties(), "tcv-worker", &serde_json::json!({"not": "a pointer"})).unwrap()
    }

    async fn state(backends: Backends) -> Arc<AppState> {
        let state = Arc::new(AppState::assemble(
            backends,
            StrategyRegistry::builtin(),
            RetryPolicy::immediate(3),
            RetryPolicy::immediate(3),
        ));
        state.load_tenants().await.unwrap();
        state
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_returns_every_delivery() {
        let bus = Arc::new(MemoryBus::default());
        let stuck = Arc::new(StuckStore::default());
        let mut backends = Backends::in_memory(Arc::new(MemoryStore::with_tenants(vec![tenant()])), bus.clone());
        backends.store = stuck.clone();
        let payloads = backends.payloads.clone();
        let state = state(backends).await;

        let mut published = Vec::new();
        for _ in 0..2 {
            let payload_id = Uuid::new_v4();
            payloads.put(payload_id, DOCUMENT).await.unwrap();
            let message = pointer_message(payload_id);
            bus.publish(Topic::Main, &message).await.unwrap();
            published.push(message.message_id);
        }

        let pool = Arc::new(state.worker_pool(1));
        let (tx, mut rx) = watch::channel(false);
        let worker = tokio::spawn({
            let pool = pool.clone();
            async move { pool.poll_once(&mut rx).await }
        });

        stuck.entered.notified().await;
        tx.send(true).unwrap();
        assert_eq!(worker.await.unwrap().unwrap(), 0);

        let again = bus.receive(Topic::Main, 10).await.unwrap();
        let ids: Vec<Uuid> = again.iter().map(|d| d.message.message_id).collect();
        assert_eq!(ids, published);
        assert!(again.iter().all(|d| d.delivery_count == 2));
        assert_eq!(bus.depth(Topic::DeadLetter).await, 0);
    }

    #[tokio::test]
    async fn test_processing_error_defers_delivery() {
        let bus = Arc::new(MemoryBus::default());
        let mut backends = Backends::in_memory(Arc::new(MemoryStore::new()), bus.clone());
        backends.audit = Arc::new(FailingAudit);
        let state = state(backends).await;
        let pool = state.worker_pool(1).with_redelivery(RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 60_000,
            max_delay_ms: 60_000,
            jitter_ms: 0,
        });

        bus.publish(Topic::Main, &undecodable_message()).await.unwrap();
        let (_tx, mut rx) = watch::channel(false);
        assert_eq!(pool.poll_once(&mut rx).await.unwrap(), 1);

        // Held back rather than handed straight out again.
        assert_eq!(pool.poll_once(&mut rx).await.unwrap(), 0);
        assert_eq!(bus.depth(Topic::Main).await, 1);
        assert_eq!(bus.depth(Topic::DeadLetter).await, 0);
    }

    #[tokio::test]
    async fn test_delivery_limit_dead_letters_unsettleable_message() {
        let bus = Arc::new(MemoryBus::default());
        let mut backends = Backends::in_memory(Arc::new(MemoryStore::new()), bus.clone());
        backends.audit = Arc::new(FailingAudit);
        let state = state(backends).await;
        let pool = state.worker_pool(1).with_redelivery(RetryPolicy::immediate(3));

        let message = undecodable_message();
        bus.publish(Topic::Main, &message).await.unwrap();

        assert_eq!(pool.drain().await.unwrap(), 3);
        assert_eq!(bus.depth(Topic::Main).await, 0);
        let dead = bus.peek(Topic::DeadLetter, 10).await.unwrap();
        assert_eq!(dead.len(), 1);
        let record: DeadLetterRecord = dead[0].decode().unwrap();
        assert_eq!(record.reason, DeadLetterReason::DeliveryLimit);
        assert_eq!(record.original_message_id, message.message_id);
        assert_eq!(record.original_body, Some(serde_json::json!({"not": "a pointer"})));
    }

    #[tokio::test]
    async fn test_lost_lock_leaves_redelivery_to_new_owner() {
        let bus = Arc::new(MemoryBus::new(Duration::from_millis(20)));
        let store = Arc::new(SlowStore::default());
        let mut backends = Backends::in_memory(Arc::new(MemoryStore::with_tenants(vec![tenant()])), bus.clone());
        backends.store = store.clone();
        let payloads = backends.payloads.clone();
        let state = state(backends).await;

        let payload_id = Uuid::new_v4();
        payloads.put(payload_id, DOCUMENT).await.unwrap();
        bus.publish(Topic::Main, &pointer_message(payload_id)).await.unwrap();

        let pool = Arc::new(state.worker_pool(1));
        let worker = tokio::spawn({
            let pool = pool.clone();
            async move {
                let (_tx, mut rx) = watch::channel(false);
                pool.poll_once(&mut rx).await
            }
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        let stolen = bus.receive(Topic::Main, 1).await.unwrap();
        assert_eq!(stolen.len(), 1);
        assert_eq!(stolen[0].delivery_count, 2);

        assert_eq!(worker.await.unwrap().unwrap(), 1);
        assert_eq!(store.inner.summary_count(), 1);
        // The first worker's settle must not have removed the new lock.
        bus.complete(&stolen[0]).await.unwrap();
        assert_eq!(bus.depth(Topic::Main).await, 0);
    }
}
