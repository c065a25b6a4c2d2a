//! Application state

use std::sync::Arc;

use coachbill_billing::{BillingConfig, BillingService};
use sqlx::PgPool;

use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub billing: Arc<BillingService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing_config: BillingConfig) -> Self {
        if config.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not set, admin endpoints are unauthenticated");
        }
        let billing = Arc::new(BillingService::new(billing_config, pool.clone()));
        tracing::info!("Billing service initialized");

        Self {
            pool,
            config,
            billing,
        }
    }
}
