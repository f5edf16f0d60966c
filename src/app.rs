//! Resource wiring.
//!
//! Every pooled client is built once here and shared by `Arc`; nothing in
//! the pipeline reaches for a global.

use std::sync::Arc;

use crate::audit::AuditSink;
use crate::bus::memory::MemoryBus;
use crate::bus::redis_queue::RedisQueueBus;
use crate::bus::MessageBus;
use crate::config::Config;
use crate::identity::{
    CachedIdentityResolver, HttpIdentityResolver, IdentityResolver, PermissiveIdentityResolver,
};
use crate::intake::IntakeGateway;
use crate::jobs::registry_refresh;
use crate::notification::{
    AlertFanout, Alerter, BusNotificationTrigger, SlackAlerter, WebhookAlerter,
};
use crate::pipeline::{
    DeadLetterQueue, Downstream, PrimaryProcessor, RetryCoordinator, RetryPolicy, WorkerPool,
};
use crate::store::memory::MemoryStore;
use crate::store::payload_store::PayloadStore;
use crate::store::postgres::PgStore;
use crate::store::{ApprovalStore, TenantSource, YamlTenantSource};
use crate::tenant::{StrategyRegistry, TenantRegistry, TenantStrategyResolver};
use crate::validation::ValidationEngine;

/// External systems the pipeline talks to.
#[derive(Clone)]
pub struct Backends {
    pub bus: Arc<dyn MessageBus>,
    pub store: Arc<dyn ApprovalStore>,
    pub audit: Arc<dyn AuditSink>,
    pub tenant_source: Arc<dyn TenantSource>,
    pub payloads: PayloadStore,
    pub identity: Arc<dyn IdentityResolver>,
    /// Set when `identity` is cached, so the eviction job can sweep it.
    pub identity_cache: Option<Arc<CachedIdentityResolver>>,
    pub alerter: Arc<dyn Alerter>,
}

impl Backends {
    /// Everything in-process. The memory store doubles as audit sink and
    /// tenant source.
    pub fn in_memory(store: Arc<MemoryStore>, bus: Arc<MemoryBus>) -> Self {
        Self {
            bus,
            store: store.clone(),
            audit: store.clone(),
            tenant_source: store,
            payloads: PayloadStore::in_memory(),
            identity: Arc::new(PermissiveIdentityResolver),
            identity_cache: None,
            alerter: Arc::new(AlertFanout::default()),
        }
    }

    pub async fn connect(cfg: &Config) -> anyhow::Result<Self> {
        let bus: Arc<dyn MessageBus> = if cfg.redis_url.is_empty() {
            tracing::warn!("REDIS_URL not set, using in-process bus (single process only)");
            Arc::new(MemoryBus::new(cfg.lock_duration()))
        } else {
            tracing::info!("Connecting to Redis...");
            Arc::new(RedisQueueBus::connect(&cfg.redis_url, "approvals", cfg.lock_duration()).await?)
        };

        let (store, audit, db_tenants): (
            Arc<dyn ApprovalStore>,
            Arc<dyn AuditSink>,
            Arc<dyn TenantSource>,
        ) = if cfg.database_url.is_empty() {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            let memory = Arc::new(MemoryStore::new());
            (
                memory.clone() as Arc<dyn ApprovalStore>,
                memory.clone() as Arc<dyn AuditSink>,
                memory as Arc<dyn TenantSource>,
            )
        } else {
            tracing::info!("Connecting to database...");
            let db = Arc::new(PgStore::connect(&cfg.database_url).await?);
            tracing::info!("Running migrations...");
            db.migrate().await?;
            (
                db.clone() as Arc<dyn ApprovalStore>,
                db.clone() as Arc<dyn AuditSink>,
                db as Arc<dyn TenantSource>,
            )
        };

        let tenant_source: Arc<dyn TenantSource> = match &cfg.tenants_file {
            Some(path) => Arc::new(YamlTenantSource::new(path)),
            None => db_tenants,
        };

        let (identity, identity_cache) = match &cfg.identity_service_url {
            Some(url) => {
                let http = HttpIdentityResolver::new(
                    url,
                    cfg.identity_timeout(),
                    cfg.identity_max_retries,
                )?;
                let cached = Arc::new(CachedIdentityResolver::new(
                    Arc::new(http),
                    cfg.identity_cache_ttl(),
                ));
                (cached.clone() as Arc<dyn IdentityResolver>, Some(cached))
            }
            None => {
                tracing::warn!("IDENTITY_SERVICE_URL not set, approver aliases are not checked");
                (Arc::new(PermissiveIdentityResolver) as Arc<dyn IdentityResolver>, None)
            }
        };

        let mut channels: Vec<Arc<dyn Alerter>> = Vec::new();
        if let Some(url) = &cfg.alert_slack_webhook_url {
            channels.push(Arc::new(SlackAlerter::new(url.clone())));
        }
        if !cfg.alert_webhook_urls.is_empty() {
            channels.push(Arc::new(WebhookAlerter::new(
                cfg.alert_webhook_urls.clone(),
                cfg.alert_webhook_secret.clone(),
            )?));
        }

        Ok(Self {
            bus,
            store,
            audit,
            tenant_source,
            payloads: PayloadStore::from_url(cfg.payload_store_url.as_deref())?,
            identity,
            identity_cache,
            alerter: Arc::new(AlertFanout::new(channels)),
        })
    }
}

/// Shared application state passed to handlers, workers and jobs.
pub struct AppState {
    pub registry: TenantRegistry,
    pub strategies: Arc<StrategyRegistry>,
    pub intake: IntakeGateway,
    pub processor: Arc<PrimaryProcessor>,
    pub dead_letters: DeadLetterQueue,
    pub bus: Arc<dyn MessageBus>,
    pub tenant_source: Arc<dyn TenantSource>,
    pub identity_cache: Option<Arc<CachedIdentityResolver>>,
}

impl AppState {
    /// Wire the pipeline over `backends`. The tenant catalog starts empty;
    /// call `load_tenants` before serving.
    pub fn assemble(
        backends: Backends,
        strategies: StrategyRegistry,
        intake_policy: RetryPolicy,
        delivery_policy: RetryPolicy,
    ) -> Self {
        let registry = TenantRegistry::new();
        let strategies = Arc::new(strategies);
        let engine = Arc::new(ValidationEngine::new(backends.identity.clone()));
        let resolver = TenantStrategyResolver::new(registry.clone(), strategies.clone(), engine);

        let intake = IntakeGateway::new(
            resolver.clone(),
            backends.payloads.clone(),
            backends.bus.clone(),
            intake_policy,
        );
        let processor = PrimaryProcessor::new(
            resolver,
            backends.payloads.clone(),
            backends.bus.clone(),
            RetryCoordinator::new(backends.bus.clone(), registry.clone(), delivery_policy),
            Downstream {
                store: backends.store.clone(),
                audit: backends.audit.clone(),
                notifier: Arc::new(BusNotificationTrigger::new(backends.bus.clone())),
                alerter: backends.alerter.clone(),
            },
        );

        Self {
            registry,
            strategies,
            intake,
            processor: Arc::new(processor),
            dead_letters: DeadLetterQueue::new(backends.bus.clone()),
            bus: backends.bus,
            tenant_source: backends.tenant_source,
            identity_cache: backends.identity_cache,
        }
    }

    pub fn from_config(backends: Backends, cfg: &Config) -> Self {
        Self::assemble(
            backends,
            StrategyRegistry::builtin(),
            cfg.intake_retry_policy(),
            cfg.delivery_retry_policy(),
        )
    }

    pub async fn load_tenants(&self) -> anyhow::Result<usize> {
        registry_refresh::refresh_once(&self.registry, self.tenant_source.as_ref(), &self.strategies)
            .await
    }

    pub fn worker_pool(&self, workers: usize) -> WorkerPool {
        WorkerPool::new(self.processor.clone(), self.bus.clone(), workers)
    }
}
