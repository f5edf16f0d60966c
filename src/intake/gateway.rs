//! Payload intake.
//!
//! Accepts a tenant's raw body, checks it structurally, offloads it to blob
//! storage and publishes a pointer on the main topic. The returned
//! `PayloadId` is the one embedded in the published pointer.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::errors::IntakeError;
use crate::metrics::METRICS;
use crate::models::message::{
    ApplicationProperties, BusMessage, PayloadPointer, PayloadProcessingResult, Topic,
};
use crate::models::validation::ValidationCheckResult;
use crate::pipeline::retry::{with_backoff, RetryPolicy};
use crate::store::payload_store::PayloadStore;
use crate::tenant::TenantStrategyResolver;
use crate::validation::check_required_fields;

pub struct IntakeGateway {
    resolver: TenantStrategyResolver,
    payloads: PayloadStore,
    bus: Arc<dyn MessageBus>,
    policy: RetryPolicy,
}

impl IntakeGateway {
    pub fn new(
        resolver: TenantStrategyResolver,
        payloads: PayloadStore,
        bus: Arc<dyn MessageBus>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            resolver,
            payloads,
            bus,
            policy,
        }
    }

    /// Accept one payload.
    ///
    /// Payloads that parse but miss required fields come back with
    /// `ValidationResults` and no `PayloadId`; nothing is stored or published
    /// for them.
    pub async fn accept(
        &self,
        tenant_id: &str,
        raw: &[u8],
        tcv: Option<&str>,
    ) -> Result<PayloadProcessingResult, IntakeError> {
        let result = self.accept_inner(tenant_id, raw, tcv).await;
        let label = match &result {
            Ok(r) if r.payload_id.is_some() => "accepted",
            Ok(_) => "rejected",
            Err(IntakeError::MalformedPayload(_)) => "malformed",
            Err(IntakeError::TenantResolution(_)) => "unknown_tenant",
            Err(IntakeError::TenantDisabled(_)) => "tenant_disabled",
            Err(IntakeError::Transient { .. }) => "transient",
            Err(IntakeError::Internal(_)) => "internal",
        };
        METRICS.intake(label);
        result
    }

    async fn accept_inner(
        &self,
        tenant_id: &str,
        raw: &[u8],
        tcv: Option<&str>,
    ) -> Result<PayloadProcessingResult, IntakeError> {
        let resolved = self.resolver.resolve(tenant_id).await?;
        let tenant = &resolved.tenant;
        if !tenant.enabled {
            return Err(IntakeError::TenantDisabled(tenant.tenant_id.clone()));
        }

        let arx = resolved.converter.convert(tenant, raw)?;

        let missing = check_required_fields(&arx, tenant);
        if !missing.is_empty() {
            warn!(tenant_id = %tenant.tenant_id, violations = missing.len(), "payload rejected at intake");
            return Ok(PayloadProcessingResult {
                payload_id: None,
                validation_results: Some(ValidationCheckResult::from_errors(missing)),
            });
        }

        let telemetry = arx
            .telemetry
            .clone()
            .completed(tcv, &tenant.routing.business_process_name);
        let payload_id = Uuid::new_v4();

        with_backoff(&self.policy, "payload store put", || {
            self.payloads.put(payload_id, raw)
        })
        .await
        .map_err(|e| IntakeError::Transient {
            operation: "payload store",
            attempts: e.attempts,
            message: e.last_error.to_string(),
        })?;

        let pointer = PayloadPointer {
            payload_id,
            tenant_id: tenant.tenant_id.clone(),
            doc_type_id: tenant.doc_type_id,
            telemetry: telemetry.clone(),
            received_at: chrono::Utc::now(),
        };
        let properties = ApplicationProperties {
            application_id: tenant.tenant_id.clone(),
            approval_request_version: tenant.routing.approval_request_version.clone(),
            created_date: pointer.received_at,
            content_type: resolved.converter.content_type().to_string(),
        };
        let message = BusMessage::new(properties, telemetry.tcv.clone(), &pointer)
            .map_err(|e| IntakeError::Internal(e.into()))?;

        with_backoff(&self.policy, "main topic publish", || {
            self.bus.publish(Topic::Main, &message)
        })
        .await
        .map_err(|e| IntakeError::Transient {
            operation: "message bus",
            attempts: e.attempts,
            message: e.last_error.to_string(),
        })?;

        info!(
            tenant_id = %tenant.tenant_id,
            payload_id = %payload_id,
            message_id = %message.message_id,
            tcv = %telemetry.tcv,
            "payload accepted"
        );

        Ok(PayloadProcessingResult {
            payload_id: Some(payload_id),
            validation_results: None,
        })
    }
}
