// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![allow(clippy::too_many_arguments)] // Invoice upserts bind every column

//! Coachbill Billing
//!
//! Customers, subscriptions and invoices for a coaching business, kept in
//! sync with the payment processor through signed webhooks, plus a dunning
//! engine that works failed payments and expiring cards through a timed
//! sequence of recovery steps.
//!
//! ## Features
//!
//! - **Plans**: Static coaching plan catalog with trials
//! - **Subscriptions**: Create subscriptions with optional discount codes
//! - **Webhooks**: Idempotent processor event handling with replay
//! - **Dunning**: Lease-based campaign sweep with per-step action log
//! - **Metrics**: MRR/ARR, churn and payment success reporting
//! - **Invariants**: Read-only consistency checks

pub mod config;
pub mod customer;
pub mod dunning;
pub mod error;
pub mod invariants;
pub mod metrics;
pub mod models;
pub mod plans;
pub mod providers;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

use std::sync::Arc;

use sqlx::PgPool;

// Config
pub use config::BillingConfig;

// Customer
pub use customer::{CreateCustomer, CustomerService};

// Dunning
pub use dunning::{
    Campaign, CampaignDetail, CampaignStatus, CampaignTrigger, DunningEngine, PgCampaignStore,
    RecoveryAnalytics, SweepReport,
};

// Error
pub use error::{BillingError, BillingResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Metrics
pub use metrics::{MetricsService, RevenueMetrics};

// Models
pub use models::{Customer, LifecycleStage, Subscription, SubscriptionStatus};

// Plans
pub use plans::{BillingInterval, Plan};

// Subscriptions
pub use subscriptions::{CreateSubscription, SubscriptionService};

// Webhooks
pub use webhooks::{
    WebhookEvent, WebhookEventRecord, WebhookHandler, WebhookOutcome, WebhookReplayResult,
    WebhookStatsSnapshot,
};

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub customers: CustomerService,
    pub subscriptions: SubscriptionService,
    pub dunning: Arc<DunningEngine>,
    pub webhooks: WebhookHandler,
    pub metrics: MetricsService,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::new(BillingConfig::from_env()?, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: BillingConfig, pool: PgPool) -> Self {
        let (gateway, notifier) = providers::from_config(&config);
        let store = Arc::new(PgCampaignStore::new(pool.clone()));
        let dunning = Arc::new(DunningEngine::new(store, gateway, notifier.clone(), &config));

        Self {
            customers: CustomerService::new(pool.clone()),
            subscriptions: SubscriptionService::new(pool.clone()),
            webhooks: WebhookHandler::new(pool.clone(), config.clone(), dunning.clone(), notifier),
            metrics: MetricsService::new(pool.clone()),
            invariants: InvariantChecker::new(pool),
            dunning,
            config,
        }
    }
}
