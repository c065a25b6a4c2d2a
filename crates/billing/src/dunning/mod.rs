//! Failed-payment recovery
//!
//! A campaign is opened when a payment fails (or a card is about to expire)
//! and then walks a fixed template of timed steps. The worker sweep calls
//! [`DunningEngine::process_due`], which leases due campaigns so that several
//! sweeps can run at once without executing a step twice.

pub mod analytics;
pub mod campaign;
mod engine;
mod memory;
mod postgres;
pub mod scoring;
mod store;

pub use analytics::{KindPerformance, RecoveryAnalytics, StepEffectiveness, TemplatePerformance};
pub use campaign::{
    ActionType, Campaign, CampaignInsert, CampaignKind, CampaignOutcome, CampaignStatus,
    CampaignTemplate, CampaignTrigger, DunningActionRecord, DunningStep, RetryStrategy,
    StepAction, TemplateId,
};
pub use engine::{CampaignDetail, DunningEngine, StepOutcome, SweepReport};
pub use memory::InMemoryCampaignStore;
pub use postgres::PgCampaignStore;
pub use scoring::CustomerProfile;
pub use store::{CampaignContext, CampaignStore, NewAction};
