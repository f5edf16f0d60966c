//! Primary processor.
//!
//! Drives one delivery through
//! `Received -> Converting -> Validating -> Persisting` and decides whether it
//! succeeded, goes back through the retry topic, or is dead-lettered. Every
//! write is an upsert, so re-running a delivery is safe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use super::retry::RetryCoordinator;
use crate::audit::AuditSink;
use crate::bus::{Delivery, MessageBus};
use crate::errors::PipelineError;
use crate::metrics::METRICS;
use crate::models::arx::Operation;
use crate::models::audit::{AuditOutcome, AuditRecord, ProcessingStage};
use crate::models::message::{
    BusMessage, DeadLetterReason, DeadLetterRecord, NotificationMessage, PayloadPointer,
    RetryEnvelope, Topic,
};
use crate::models::summary::{ApprovalDetail, ApprovalSummary, SummaryKey, SummaryStatus};
use crate::notification::{Alerter, NotificationTrigger, OperationalAlert};
use crate::store::payload_store::PayloadStore;
use crate::store::{ApprovalStore, StoreError};
use crate::tenant::TenantStrategyResolver;

/// The unit of work carried by a main-topic or retry-topic message.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub original_message_id: Uuid,
    pub attempt_count: u32,
    pub pointer: PayloadPointer,
}

impl WorkItem {
    pub fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        match delivery.topic {
            Topic::Retry => {
                let envelope: RetryEnvelope = delivery.message.decode()?;
                Ok(Self {
                    original_message_id: envelope.original_message_id,
                    attempt_count: envelope.attempt_count,
                    pointer: envelope.payload_pointer,
                })
            }
            _ => Ok(Self {
                original_message_id: delivery.message.message_id,
                attempt_count: 0,
                pointer: delivery.message.decode()?,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProcessingOutcome {
    Succeeded,
    /// Persisted, but the notification trigger or audit sink failed.
    DegradedSuccess,
    /// Failed validation; a rejected summary was persisted.
    Rejected,
    Retrying { attempt_count: u32, delay: Duration },
    DeadLettered(DeadLetterReason),
}

impl ProcessingOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingOutcome::Succeeded => "succeeded",
            ProcessingOutcome::DegradedSuccess => "degraded_success",
            ProcessingOutcome::Rejected => "rejected",
            ProcessingOutcome::Retrying { .. } => "retrying",
            ProcessingOutcome::DeadLettered(_) => "dead_lettered",
        }
    }
}

/// Collaborators invoked after conversion.
#[derive(Clone)]
pub struct Downstream {
    pub store: Arc<dyn ApprovalStore>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn NotificationTrigger>,
    pub alerter: Arc<dyn Alerter>,
}

enum StageFailure {
    /// Re-delivery cannot change the result.
    Terminal {
        reason: DeadLetterReason,
        stage: ProcessingStage,
        error: String,
    },
    Transient {
        stage: ProcessingStage,
        error: String,
        key: Option<SummaryKey>,
    },
}

impl StageFailure {
    fn terminal(reason: DeadLetterReason, stage: ProcessingStage, error: impl ToString) -> Self {
        StageFailure::Terminal {
            reason,
            stage,
            error: error.to_string(),
        }
    }

    fn transient(stage: ProcessingStage, error: impl ToString, key: Option<&SummaryKey>) -> Self {
        StageFailure::Transient {
            stage,
            error: error.to_string(),
            key: key.cloned(),
        }
    }

    fn store(error: StoreError, key: &SummaryKey) -> Self {
        if error.is_permanent() {
            StageFailure::terminal(DeadLetterReason::Persistence, ProcessingStage::Persisting, error)
        } else {
            StageFailure::transient(ProcessingStage::Persisting, error, Some(key))
        }
    }
}

struct DeadLetter {
    reason: DeadLetterReason,
    stage: ProcessingStage,
    error: String,
    original_message_id: Uuid,
    tenant_id: String,
    attempt_count: u32,
    pointer: Option<PayloadPointer>,
    original_body: Option<serde_json::Value>,
    key: Option<SummaryKey>,
}

pub struct PrimaryProcessor {
    resolver: TenantStrategyResolver,
    payloads: PayloadStore,
    bus: Arc<dyn MessageBus>,
    retry: RetryCoordinator,
    downstream: Downstream,
}

impl PrimaryProcessor {
    pub fn new(
        resolver: TenantStrategyResolver,
        payloads: PayloadStore,
        bus: Arc<dyn MessageBus>,
        retry: RetryCoordinator,
        downstream: Downstream,
    ) -> Self {
        Self {
            resolver,
            payloads,
            bus,
            retry,
            downstream,
        }
    }

    /// Process one delivery to a terminal decision.
    ///
    /// `Ok` means the delivery may be completed. `Err` means the decision
    /// could not be recorded (dead-letter audit or retry publish failed) and
    /// the delivery must be abandoned for redelivery.
    pub async fn process(&self, delivery: &Delivery) -> Result<ProcessingOutcome, PipelineError> {
        let started = Instant::now();
        let message = &delivery.message;

        let item = match WorkItem::from_delivery(delivery) {
            Ok(item) => item,
            Err(e) => {
                warn!(message_id = %message.message_id, topic = %delivery.topic, "undecodable message body: {}", e);
                return self
                    .dead_letter(
                        message,
                        DeadLetter {
                            reason: DeadLetterReason::Undecodable,
                            stage: ProcessingStage::Received,
                            error: e.to_string(),
                            original_message_id: message.message_id,
                            tenant_id: message.application_properties.application_id.clone(),
                            attempt_count: 0,
                            pointer: None,
                            original_body: Some(message.body.clone()),
                            key: None,
                        },
                    )
                    .await;
            }
        };

        let span = tracing::info_span!(
            "process",
            message_id = %item.original_message_id,
            tenant_id = %item.pointer.tenant_id,
            tcv = %item.pointer.telemetry.tcv,
            attempt = item.attempt_count,
        );

        let outcome = async {
            match self.run(&item, message).await {
                Ok(outcome) => Ok(outcome),
                Err(StageFailure::Terminal { reason, stage, error }) => {
                    self.dead_letter(
                        message,
                        DeadLetter {
                            reason,
                            stage,
                            error,
                            original_message_id: item.original_message_id,
                            tenant_id: item.pointer.tenant_id.clone(),
                            attempt_count: item.attempt_count,
                            pointer: Some(item.pointer.clone()),
                            original_body: None,
                            key: None,
                        },
                    )
                    .await
                }
                Err(StageFailure::Transient { stage, error, key }) => {
                    self.retry_or_escalate(&item, message, stage, error, key).await
                }
            }
        }
        .instrument(span)
        .await;

        METRICS.observe_processing(delivery.topic.name(), started.elapsed().as_secs_f64());
        if let Ok(outcome) = &outcome {
            METRICS.outcome(&item.pointer.tenant_id, outcome.as_str());
        }
        outcome
    }

    /// Dead-letter a delivery the worker could not settle within its
    /// redelivery limit. The audit record is best effort here.
    pub async fn quarantine(
        &self,
        delivery: &Delivery,
        error: &str,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let message = &delivery.message;
        let dead = match WorkItem::from_delivery(delivery) {
            Ok(item) => DeadLetter {
                reason: DeadLetterReason::DeliveryLimit,
                stage: ProcessingStage::Received,
                error: error.to_string(),
                original_message_id: item.original_message_id,
                tenant_id: item.pointer.tenant_id.clone(),
                attempt_count: item.attempt_count,
                pointer: Some(item.pointer),
                original_body: None,
                key: None,
            },
            Err(_) => DeadLetter {
                reason: DeadLetterReason::DeliveryLimit,
                stage: ProcessingStage::Received,
                error: error.to_string(),
                original_message_id: message.message_id,
                tenant_id: message.application_properties.application_id.clone(),
                attempt_count: 0,
                pointer: None,
                original_body: Some(message.body.clone()),
                key: None,
            },
        };
        warn!(
            message_id = %dead.original_message_id,
            delivery_count = delivery.delivery_count,
            error = %error,
            "delivery limit reached, dead-lettering"
        );
        self.dead_letter(message, dead).await
    }

    async fn run(
        &self,
        item: &WorkItem,
        source: &BusMessage,
    ) -> Result<ProcessingOutcome, StageFailure> {
        let pointer = &item.pointer;

        let resolved = self.resolver.resolve(&pointer.tenant_id).await.map_err(|e| {
            StageFailure::terminal(DeadLetterReason::TenantResolution, ProcessingStage::Received, e)
        })?;
        let tenant = &resolved.tenant;

        // The blob write may not be visible yet; treat a miss as transient.
        let raw = self
            .payloads
            .get(pointer.payload_id)
            .await
            .map_err(|e| StageFailure::transient(ProcessingStage::Received, e, None))?;

        let mut arx = resolved.converter.convert(tenant, &raw).map_err(|e| {
            StageFailure::terminal(DeadLetterReason::Conversion, ProcessingStage::Converting, e)
        })?;
        arx.telemetry = pointer.telemetry.clone();
        let key = SummaryKey::for_request(&arx, tenant);

        let validation = resolved
            .validator
            .validate(&arx)
            .await
            .map_err(|e| StageFailure::transient(ProcessingStage::Validating, e, Some(&key)))?;

        if !validation.action_result {
            let summary = ApprovalSummary::from_request(
                &arx,
                tenant,
                SummaryStatus::Rejected,
                validation.error_messages.clone(),
                pointer.payload_id,
                item.original_message_id,
            );
            self.downstream
                .store
                .upsert_summary(&summary)
                .await
                .map_err(|e| StageFailure::store(e, &key))?;

            info!(key = %key, violations = validation.error_messages.len(), "request rejected");
            let record = self.audit_record(
                item,
                &key,
                ProcessingStage::Validating,
                AuditOutcome::Rejected,
                Some(validation.error_messages.join("; ")),
            );
            if let Err(e) = self.downstream.audit.record(&record).await {
                warn!(key = %key, error = %e, "audit write failed for rejected request");
            }
            return Ok(ProcessingOutcome::Rejected);
        }

        let status = if arx.operation == Operation::Delete {
            SummaryStatus::Deleted
        } else {
            SummaryStatus::Pending
        };
        let summary = ApprovalSummary::from_request(
            &arx,
            tenant,
            status,
            Vec::new(),
            pointer.payload_id,
            item.original_message_id,
        );
        let detail = ApprovalDetail {
            key: key.clone(),
            request: arx.clone(),
            updated_at: Utc::now(),
        };

        let store = &self.downstream.store;
        store
            .upsert_detail(&detail)
            .await
            .map_err(|e| StageFailure::store(e, &key))?;
        store
            .upsert_summary(&summary)
            .await
            .map_err(|e| StageFailure::store(e, &key))?;

        info!(key = %key, operation = %arx.operation, status = status.as_str(), "request persisted");

        // Persistence is committed; from here on failures only degrade.
        let mut degraded = Vec::new();
        if tenant.routing.notify && arx.wants_notification() {
            let notification = NotificationMessage {
                key: key.clone(),
                doc_type_id: tenant.doc_type_id,
                operation: arx.operation,
                action_name: arx.action_name().map(String::from),
                telemetry: arx.telemetry.clone(),
            };
            if let Err(e) = self
                .downstream
                .notifier
                .trigger(&notification, &source.application_properties)
                .await
            {
                warn!(key = %key, error = %e, "notification trigger failed");
                degraded.push(format!("notification: {}", e));
            }
        }

        let outcome = if degraded.is_empty() {
            AuditOutcome::Succeeded
        } else {
            AuditOutcome::DegradedSuccess
        };
        let failure = (!degraded.is_empty()).then(|| degraded.join("; "));
        let record = self.audit_record(item, &key, ProcessingStage::Succeeded, outcome, failure);
        if let Err(e) = self.downstream.audit.record(&record).await {
            warn!(key = %key, error = %e, "audit write failed");
            degraded.push(format!("audit: {}", e));
        }

        if degraded.is_empty() {
            Ok(ProcessingOutcome::Succeeded)
        } else {
            Ok(ProcessingOutcome::DegradedSuccess)
        }
    }

    fn audit_record(
        &self,
        item: &WorkItem,
        key: &SummaryKey,
        stage: ProcessingStage,
        outcome: AuditOutcome,
        failure: Option<String>,
    ) -> AuditRecord {
        AuditRecord {
            message_id: item.original_message_id,
            payload_id: Some(item.pointer.payload_id),
            tenant_id: item.pointer.tenant_id.clone(),
            key: Some(key.clone()),
            stage,
            outcome,
            attempt_count: item.attempt_count,
            telemetry: Some(item.pointer.telemetry.clone()),
            failure,
            recorded_at: Utc::now(),
        }
    }

    async fn retry_or_escalate(
        &self,
        item: &WorkItem,
        source: &BusMessage,
        stage: ProcessingStage,
        error: String,
        key: Option<SummaryKey>,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let envelope = RetryEnvelope {
            original_message_id: item.original_message_id,
            tenant_id: item.pointer.tenant_id.clone(),
            attempt_count: item.attempt_count + 1,
            payload_pointer: item.pointer.clone(),
            last_error: error.clone(),
        };

        if self.retry.should_escalate(&envelope).await {
            return self
                .dead_letter(
                    source,
                    DeadLetter {
                        reason: DeadLetterReason::RetryExhausted,
                        stage,
                        error,
                        original_message_id: item.original_message_id,
                        tenant_id: envelope.tenant_id,
                        attempt_count: envelope.attempt_count,
                        pointer: Some(envelope.payload_pointer),
                        original_body: None,
                        key,
                    },
                )
                .await;
        }

        let delay = self.retry.requeue(&envelope, source).await?;
        METRICS.retry(&envelope.tenant_id);
        warn!(
            stage = stage.as_str(),
            attempt = envelope.attempt_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, scheduled retry"
        );
        Ok(ProcessingOutcome::Retrying {
            attempt_count: envelope.attempt_count,
            delay,
        })
    }

    async fn dead_letter(
        &self,
        source: &BusMessage,
        dead: DeadLetter,
    ) -> Result<ProcessingOutcome, PipelineError> {
        let telemetry = dead.pointer.as_ref().map(|p| p.telemetry.clone());

        // The audit record must exist before the message leaves the pipeline.
        let record = AuditRecord {
            message_id: dead.original_message_id,
            payload_id: dead.pointer.as_ref().map(|p| p.payload_id),
            tenant_id: dead.tenant_id.clone(),
            key: dead.key,
            stage: dead.stage,
            outcome: AuditOutcome::DeadLettered,
            attempt_count: dead.attempt_count,
            telemetry: telemetry.clone(),
            failure: Some(format!("{}: {}", dead.reason.as_str(), dead.error)),
            recorded_at: Utc::now(),
        };
        match self.downstream.audit.record(&record).await {
            Ok(()) => {}
            // Settling already failed repeatedly; the record must not be
            // held back by the audit sink too.
            Err(e) if dead.reason == DeadLetterReason::DeliveryLimit => {
                warn!(message_id = %dead.original_message_id, error = %e, "audit write failed for delivery-limit dead letter");
            }
            Err(e) => return Err(PipelineError::Audit(e)),
        }

        let body = DeadLetterRecord {
            original_message_id: dead.original_message_id,
            tenant_id: dead.tenant_id.clone(),
            attempt_count: dead.attempt_count,
            reason: dead.reason,
            error: dead.error.clone(),
            payload_pointer: dead.pointer,
            original_body: dead.original_body,
            dead_lettered_at: Utc::now(),
        };
        let message = BusMessage::new(
            source.application_properties.clone(),
            source.correlation_id.clone(),
            &body,
        )?;
        self.bus.publish(Topic::DeadLetter, &message).await?;

        let tcv = telemetry
            .map(|t| t.tcv)
            .unwrap_or_else(|| source.correlation_id.clone());
        let alert = OperationalAlert::dead_lettered(
            dead.reason,
            &dead.tenant_id,
            dead.original_message_id,
            dead.attempt_count,
            &dead.error,
            &tcv,
        );
        // Alert channels retry with sleeps; keep them off the delivery lock.
        let alerter = self.downstream.alerter.clone();
        tokio::spawn(
            async move {
                if let Err(e) = alerter.alert(&alert).await {
                    warn!(message_id = %alert.message_id, error = %e, "operational alert failed");
                }
            }
            .in_current_span(),
        );

        METRICS.dead_letter(&dead.tenant_id, dead.reason.as_str());
        Ok(ProcessingOutcome::DeadLettered(dead.reason))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::identity::PermissiveIdentityResolver;
    use crate::models::arx::TelemetryVector;
    use crate::models::message::ApplicationProperties;
    use crate::models::tenant::TenantInfo;
    use crate::notification::AlertFanout;
    use crate::pipeline::retry::RetryPolicy;
    use crate::store::memory::MemoryStore;
    use crate::tenant::{StrategyRegistry, TenantRegistry};
    use crate::validation::ValidationEngine;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TENANT: &str = "t-proc";

    struct FailingNotifier {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl NotificationTrigger for FailingNotifier {
        async fn trigger(
            &self,
            _notification: &NotificationMessage,
            _properties: &ApplicationProperties,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("notification topic unavailable")
        }
    }

    /// Alerter whose channels are slow and end up failing.
    struct SlowAlerter {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Alerter for SlowAlerter {
        async fn alert(&self, _alert: &OperationalAlert) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("webhook timed out")
        }
    }

    /// Store that refuses every write as out-of-range data.
    struct RejectingStore;

    #[async_trait]
    impl ApprovalStore for RejectingStore {
        async fn upsert_detail(&self, _detail: &ApprovalDetail) -> Result<(), StoreError> {
            Err(StoreError::Rejected("value too long for column".into()))
        }

        async fn upsert_summary(&self, _summary: &ApprovalSummary) -> Result<(), StoreError> {
            Err(StoreError::Rejected("value too long for column".into()))
        }

        async fn get_summary(&self, _key: &SummaryKey) -> Result<Option<ApprovalSummary>, StoreError> {
            Ok(None)
        }
    }

    struct Harness {
        bus: Arc<MemoryBus>,
        store: Arc<MemoryStore>,
        payloads: PayloadStore,
        notifier: Arc<FailingNotifier>,
        processor: PrimaryProcessor,
    }

    fn harness(tenant: TenantInfo) -> Harness {
        harness_with(tenant, None, Arc::new(AlertFanout::default()))
    }

    fn harness_with(
        tenant: TenantInfo,
        writes: Option<Arc<dyn ApprovalStore>>,
        alerter: Arc<dyn Alerter>,
    ) -> Harness {
        let bus = Arc::new(MemoryBus::default());
        let store = Arc::new(MemoryStore::new());
        let payloads = PayloadStore::in_memory();
        let notifier = Arc::new(FailingNotifier { calls: AtomicUsize::new(0) });
        let registry = TenantRegistry::with_tenants(vec![tenant]);
        let resolver = TenantStrategyResolver::new(
            registry.clone(),
            Arc::new(StrategyRegistry::builtin()),
            Arc::new(ValidationEngine::new(Arc::new(PermissiveIdentityResolver))),
        );
        let writes = match writes {
            Some(w) => w,
            None => store.clone() as Arc<dyn ApprovalStore>,
        };
        let processor = PrimaryProcessor::new(
            resolver,
            payloads.clone(),
            bus.clone(),
            RetryCoordinator::new(bus.clone(), registry, RetryPolicy::immediate(3)),
            Downstream {
                store: writes,
                audit: store.clone(),
                notifier: notifier.clone(),
                alerter,
            },
        );
        Harness { bus, store, payloads, notifier, processor }
    }

    fn tenant(strategy: &str) -> TenantInfo {
        TenantInfo {
            tenant_id: TENANT.into(),
            doc_type_id: Uuid::new_v4(),
            name: String::new(),
            strategy_tag: strategy.into(),
            validation_tag: "default".into(),
            enabled: true,
            routing: Default::default(),
            validation: Default::default(),
            max_attempts: None,
        }
    }

    fn pointer_message(tenant_id: &str, payload_id: Uuid) -> BusMessage {
        let pointer = PayloadPointer {
            payload_id,
            tenant_id: tenant_id.into(),
            doc_type_id: Uuid::new_v4(),
            telemetry: TelemetryVector {
                xcv: "xcv".into(),
                tcv: "tcv-proc".into(),
                business_process_name: String::new(),
            },
            received_at: Utc::now(),
        };
        let props = ApplicationProperties {
            application_id: tenant_id.into(),
            approval_request_version: "1".into(),
            created_date: Utc::now(),
            content_type: "application/json".into(),
        };
        BusMessage::new(props, "tcv-proc", &pointer).unwrap()
    }

    async fn deliver(bus: &MemoryBus, topic: Topic, message: &BusMessage) -> Delivery {
        bus.publish(topic, message).await.unwrap();
        bus.receive(topic, 1).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn test_notification_failure_is_degraded_success() {
        let h = harness(tenant("standard"));
        let payload_id = Uuid::new_v4();
        h.payloads
            .put(payload_id, br#"{"ApprovalIdentifier": {"DocumentNumber": "PO7", "FiscalYear": "2024"}}"#)
            .await
            .unwrap();

        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, payload_id)).await;
        let outcome = h.processor.process(&d).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::DegradedSuccess);
        assert_eq!(h.store.summary_count(), 1);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 1);
        let audit = h.store.audit_records().await;
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].outcome, AuditOutcome::DegradedSuccess);
    }

    #[tokio::test]
    async fn test_missing_blob_is_retried() {
        let h = harness(tenant("standard"));
        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, Uuid::new_v4())).await;

        let outcome = h.processor.process(&d).await.unwrap();
        assert!(matches!(outcome, ProcessingOutcome::Retrying { attempt_count: 1, .. }));

        let retry = h.bus.peek(Topic::Retry, 10).await.unwrap();
        assert_eq!(retry.len(), 1);
        let envelope: RetryEnvelope = retry[0].decode().unwrap();
        assert_eq!(envelope.original_message_id, d.message.message_id);
        assert_eq!(retry[0].correlation_id, "tcv-proc");
    }

    #[tokio::test]
    async fn test_conversion_failure_goes_straight_to_dead_letter() {
        let h = harness(tenant("flat"));
        let payload_id = Uuid::new_v4();
        h.payloads.put(payload_id, br#"{"FiscalYear": "2024"}"#).await.unwrap();

        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, payload_id)).await;
        let outcome = h.processor.process(&d).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::Conversion));
        assert_eq!(h.bus.depth(Topic::Retry).await, 0);
        let dead = h.bus.peek(Topic::DeadLetter, 10).await.unwrap();
        let record: DeadLetterRecord = dead[0].decode().unwrap();
        assert_eq!(record.payload_pointer.unwrap().payload_id, payload_id);
        let audit = h.store.audit_records().await;
        assert_eq!(audit[0].stage, ProcessingStage::Converting);
    }

    #[tokio::test]
    async fn test_unknown_tenant_dead_lettered_without_retry() {
        let h = harness(tenant("standard"));
        let d = deliver(&h.bus, Topic::Main, &pointer_message("ghost", Uuid::new_v4())).await;

        let outcome = h.processor.process(&d).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::TenantResolution));
        assert_eq!(h.bus.depth(Topic::Retry).await, 0);
        assert_eq!(h.bus.depth(Topic::DeadLetter).await, 1);
    }

    #[tokio::test]
    async fn test_undecodable_body_keeps_original() {
        let h = harness(tenant("standard"));
        let props = ApplicationProperties {
            application_id: TENANT.into(),
            approval_request_version: "1".into(),
            created_date: Utc::now(),
            content_type: "application/json".into(),
        };
        let garbage = BusMessage::new(props, "tcv", &serde_json::json!({"what": "ever"})).unwrap();
        let d = deliver(&h.bus, Topic::Main, &garbage).await;

        let outcome = h.processor.process(&d).await.unwrap();
        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::Undecodable));
        let record: DeadLetterRecord = h.bus.peek(Topic::DeadLetter, 1).await.unwrap()[0].decode().unwrap();
        assert_eq!(record.original_body, Some(serde_json::json!({"what": "ever"})));
        assert!(record.payload_pointer.is_none());
    }

    #[tokio::test]
    async fn test_delete_persists_deleted_status() {
        let mut t = tenant("standard");
        t.routing.notify = false;
        let h = harness(t);
        let payload_id = Uuid::new_v4();
        h.payloads
            .put(payload_id, br#"{"Operation": "Delete", "ApprovalIdentifier": {"DocumentNumber": "PO8", "FiscalYear": "2024"}}"#)
            .await
            .unwrap();

        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, payload_id)).await;
        assert_eq!(h.processor.process(&d).await.unwrap(), ProcessingOutcome::Succeeded);

        let key = SummaryKey {
            tenant_id: TENANT.into(),
            document_key: "PO8".into(),
            fiscal_year: "2024".into(),
        };
        let summary = h.store.get_summary(&key).await.unwrap().unwrap();
        assert_eq!(summary.status, SummaryStatus::Deleted);
        assert_eq!(h.notifier.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_slow_alert_does_not_delay_dead_letter() {
        let calls = Arc::new(AtomicUsize::new(0));
        let h = harness_with(
            tenant("standard"),
            None,
            Arc::new(SlowAlerter { calls: calls.clone() }),
        );
        let d = deliver(&h.bus, Topic::Main, &pointer_message("ghost", Uuid::new_v4())).await;

        let started = Instant::now();
        let outcome = h.processor.process(&d).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::TenantResolution));
        assert_eq!(h.bus.depth(Topic::DeadLetter).await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.bus.depth(Topic::DeadLetter).await, 1);
    }

    #[tokio::test]
    async fn test_rejected_write_dead_lettered_without_retry() {
        let h = harness_with(
            tenant("standard"),
            Some(Arc::new(RejectingStore)),
            Arc::new(AlertFanout::default()),
        );
        let payload_id = Uuid::new_v4();
        h.payloads
            .put(payload_id, br#"{"ApprovalIdentifier": {"DocumentNumber": "PO9", "FiscalYear": "2024"}}"#)
            .await
            .unwrap();

        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, payload_id)).await;
        let outcome = h.processor.process(&d).await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::Persistence));
        assert_eq!(h.bus.depth(Topic::Retry).await, 0);
        let record: DeadLetterRecord = h.bus.peek(Topic::DeadLetter, 1).await.unwrap()[0].decode().unwrap();
        assert!(record.error.contains("value too long"));
        let audit = h.store.audit_records().await;
        assert_eq!(audit[0].stage, ProcessingStage::Persisting);
    }

    #[tokio::test]
    async fn test_quarantine_records_delivery_limit() {
        let h = harness(tenant("standard"));
        let payload_id = Uuid::new_v4();
        let d = deliver(&h.bus, Topic::Main, &pointer_message(TENANT, payload_id)).await;

        let outcome = h.processor.quarantine(&d, "audit sink unavailable").await.unwrap();

        assert_eq!(outcome, ProcessingOutcome::DeadLettered(DeadLetterReason::DeliveryLimit));
        let record: DeadLetterRecord = h.bus.peek(Topic::DeadLetter, 1).await.unwrap()[0].decode().unwrap();
        assert_eq!(record.reason, DeadLetterReason::DeliveryLimit);
        assert_eq!(record.original_message_id, d.message.message_id);
        assert_eq!(record.payload_pointer.unwrap().payload_id, payload_id);
        assert_eq!(record.error, "audit sink unavailable");
        let audit = h.store.audit_records().await;
        assert_eq!(audit[0].stage, ProcessingStage::Received);
    }
}
