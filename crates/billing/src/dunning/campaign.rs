//! Campaign types and the static step templates
//!
//! A campaign walks an ordered list of steps. Each step carries an offset
//! from the campaign anchor: the payment failure for failed-payment
//! campaigns, the card expiry for card-expiring campaigns. Offsets may be
//! negative (reminders before a card expires).

use serde::{Deserialize, Serialize};
use time::{Date, Duration, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::text_enum;

text_enum!(
    CampaignStatus {
        Active => "active",
        Paused => "paused",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    CampaignKind {
        FailedPayment => "failed_payment",
        CardExpiring => "card_expiring",
    }
);

text_enum!(
    TemplateId {
        FailedPaymentStandard => "failed_payment_standard",
        HighValueCustomer => "high_value_customer",
        ExpiringCards => "expiring_cards",
    }
);

text_enum!(
    ActionType {
        Email => "email",
        Sms => "sms",
        PhoneCall => "phone_call",
        PaymentRetry => "payment_retry",
        DiscountOffer => "discount_offer",
        PaymentPlan => "payment_plan",
        CancelSubscription => "cancel_subscription",
    }
);

text_enum!(
    RetryStrategy {
        SmartRouting => "smart_routing",
        OptimalTiming => "optimal_timing",
        PremiumRouting => "premium_routing",
    }
);

impl CampaignStatus {
    /// Open campaigns hold the per-subscription slot
    pub fn is_open(&self) -> bool {
        matches!(self, CampaignStatus::Active | CampaignStatus::Paused)
    }
}

/// What a step does when it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepAction {
    Email {
        template: &'static str,
        discount_percent: Option<u8>,
    },
    Sms {
        template: &'static str,
    },
    PhoneCall {
        purpose: &'static str,
    },
    PaymentRetry {
        strategy: RetryStrategy,
    },
    DiscountOffer {
        percent: u8,
        months: u8,
    },
    PaymentPlan {
        max_installments: u8,
    },
    CancelSubscription {
        winback_after_days: Option<u16>,
    },
}

impl StepAction {
    pub fn action_type(&self) -> ActionType {
        match self {
            StepAction::Email { .. } => ActionType::Email,
            StepAction::Sms { .. } => ActionType::Sms,
            StepAction::PhoneCall { .. } => ActionType::PhoneCall,
            StepAction::PaymentRetry { .. } => ActionType::PaymentRetry,
            StepAction::DiscountOffer { .. } => ActionType::DiscountOffer,
            StepAction::PaymentPlan { .. } => ActionType::PaymentPlan,
            StepAction::CancelSubscription { .. } => ActionType::CancelSubscription,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DunningStep {
    /// 1-based position in the template
    pub number: i32,
    /// Minutes relative to the campaign anchor
    pub offset_minutes: i64,
    pub action: StepAction,
}

impl DunningStep {
    pub fn scheduled_at(&self, anchor: OffsetDateTime) -> OffsetDateTime {
        anchor + Duration::minutes(self.offset_minutes)
    }

    /// When the step should run, never earlier than `now`
    pub fn due_at(&self, anchor: OffsetDateTime, now: OffsetDateTime) -> OffsetDateTime {
        self.scheduled_at(anchor).max(now)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CampaignTemplate {
    pub id: TemplateId,
    pub kind: CampaignKind,
    pub steps: &'static [DunningStep],
}

impl CampaignTemplate {
    pub fn total_steps(&self) -> i32 {
        self.steps.len() as i32
    }

    pub fn step(&self, number: i32) -> Option<&'static DunningStep> {
        if number < 1 {
            return None;
        }
        self.steps.get((number - 1) as usize)
    }
}

const HOUR: i64 = 60;

static STANDARD_STEPS: [DunningStep; 6] = [
    DunningStep {
        number: 1,
        offset_minutes: HOUR,
        action: StepAction::PaymentRetry {
            strategy: RetryStrategy::SmartRouting,
        },
    },
    DunningStep {
        number: 2,
        offset_minutes: 6 * HOUR,
        action: StepAction::Email {
            template: "payment_failed_gentle",
            discount_percent: None,
        },
    },
    DunningStep {
        number: 3,
        offset_minutes: 24 * HOUR,
        action: StepAction::PaymentRetry {
            strategy: RetryStrategy::OptimalTiming,
        },
    },
    DunningStep {
        number: 4,
        offset_minutes: 72 * HOUR,
        action: StepAction::Email {
            template: "payment_failed_urgent",
            discount_percent: Some(20),
        },
    },
    DunningStep {
        number: 5,
        offset_minutes: 168 * HOUR,
        action: StepAction::Sms {
            template: "payment_final_notice",
        },
    },
    DunningStep {
        number: 6,
        offset_minutes: 336 * HOUR,
        action: StepAction::CancelSubscription {
            winback_after_days: None,
        },
    },
];

static HIGH_VALUE_STEPS: [DunningStep; 8] = [
    DunningStep {
        number: 1,
        offset_minutes: 30,
        action: StepAction::PhoneCall {
            purpose: "personal_outreach",
        },
    },
    DunningStep {
        number: 2,
        offset_minutes: 2 * HOUR,
        action: StepAction::PaymentRetry {
            strategy: RetryStrategy::PremiumRouting,
        },
    },
    DunningStep {
        number: 3,
        offset_minutes: 12 * HOUR,
        action: StepAction::Email {
            template: "vip_payment_failed",
            discount_percent: None,
        },
    },
    DunningStep {
        number: 4,
        offset_minutes: 48 * HOUR,
        action: StepAction::PaymentPlan {
            max_installments: 3,
        },
    },
    DunningStep {
        number: 5,
        offset_minutes: 96 * HOUR,
        action: StepAction::DiscountOffer {
            percent: 30,
            months: 3,
        },
    },
    DunningStep {
        number: 6,
        offset_minutes: 168 * HOUR,
        action: StepAction::Email {
            template: "vip_retention_offer",
            discount_percent: None,
        },
    },
    DunningStep {
        number: 7,
        offset_minutes: 240 * HOUR,
        action: StepAction::PhoneCall {
            purpose: "final_retention_call",
        },
    },
    DunningStep {
        number: 8,
        offset_minutes: 504 * HOUR,
        action: StepAction::CancelSubscription {
            winback_after_days: Some(30),
        },
    },
];

static EXPIRING_CARD_STEPS: [DunningStep; 4] = [
    DunningStep {
        number: 1,
        offset_minutes: -720 * HOUR,
        action: StepAction::Email {
            template: "card_expiring_early_notice",
            discount_percent: None,
        },
    },
    DunningStep {
        number: 2,
        offset_minutes: -168 * HOUR,
        action: StepAction::Email {
            template: "card_expiring_urgent",
            discount_percent: None,
        },
    },
    DunningStep {
        number: 3,
        offset_minutes: -24 * HOUR,
        action: StepAction::Sms {
            template: "card_expires_tomorrow",
        },
    },
    DunningStep {
        number: 4,
        offset_minutes: 24 * HOUR,
        action: StepAction::Email {
            template: "card_update_required_post_failure",
            discount_percent: None,
        },
    },
];

static STANDARD: CampaignTemplate = CampaignTemplate {
    id: TemplateId::FailedPaymentStandard,
    kind: CampaignKind::FailedPayment,
    steps: &STANDARD_STEPS,
};

static HIGH_VALUE: CampaignTemplate = CampaignTemplate {
    id: TemplateId::HighValueCustomer,
    kind: CampaignKind::FailedPayment,
    steps: &HIGH_VALUE_STEPS,
};

static EXPIRING_CARDS: CampaignTemplate = CampaignTemplate {
    id: TemplateId::ExpiringCards,
    kind: CampaignKind::CardExpiring,
    steps: &EXPIRING_CARD_STEPS,
};

impl TemplateId {
    pub fn template(&self) -> &'static CampaignTemplate {
        match self {
            TemplateId::FailedPaymentStandard => &STANDARD,
            TemplateId::HighValueCustomer => &HIGH_VALUE,
            TemplateId::ExpiringCards => &EXPIRING_CARDS,
        }
    }
}

/// Why a campaign was started, stored with the campaign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum CampaignTrigger {
    FailedPayment {
        invoice_id: String,
        amount_cents: i64,
        attempt_count: i32,
        failure_code: Option<String>,
        failure_message: Option<String>,
    },
    CardExpiring {
        exp_month: u8,
        exp_year: i32,
        last4: Option<String>,
    },
}

impl CampaignTrigger {
    /// Processor invoice behind a failed-payment campaign
    pub fn invoice_id(&self) -> Option<&str> {
        match self {
            CampaignTrigger::FailedPayment { invoice_id, .. } => Some(invoice_id),
            CampaignTrigger::CardExpiring { .. } => None,
        }
    }

    pub fn kind(&self) -> CampaignKind {
        match self {
            CampaignTrigger::FailedPayment { .. } => CampaignKind::FailedPayment,
            CampaignTrigger::CardExpiring { .. } => CampaignKind::CardExpiring,
        }
    }

    pub fn amount_cents(&self) -> Option<i64> {
        match self {
            CampaignTrigger::FailedPayment { amount_cents, .. } => Some(*amount_cents),
            CampaignTrigger::CardExpiring { .. } => None,
        }
    }

    /// The instant step offsets are measured from.
    ///
    /// Cards are valid through the last day of their expiry month, so the
    /// anchor is midnight UTC on the first day of the following month.
    pub fn anchor(&self, now: OffsetDateTime) -> BillingResult<OffsetDateTime> {
        match self {
            CampaignTrigger::FailedPayment { .. } => Ok(now),
            CampaignTrigger::CardExpiring {
                exp_month,
                exp_year,
                ..
            } => {
                let month = Month::try_from(*exp_month).map_err(|_| {
                    BillingError::InvalidInput(format!("invalid card expiry month: {exp_month}"))
                })?;
                let (year, month) = if month == Month::December {
                    (*exp_year + 1, Month::January)
                } else {
                    (*exp_year, month.next())
                };
                let date = Date::from_calendar_date(year, month, 1).map_err(|e| {
                    BillingError::InvalidInput(format!("invalid card expiry: {e}"))
                })?;
                Ok(date.midnight().assume_utc())
            }
        }
    }
}

/// Key that allows only one open campaign per subscription (or per customer
/// for campaigns not tied to a subscription)
pub fn dedupe_key(kind: CampaignKind, customer_id: Uuid, subscription_id: Option<Uuid>) -> String {
    match subscription_id {
        Some(sub) if kind == CampaignKind::FailedPayment => format!("subscription:{sub}"),
        _ => format!("customer:{customer_id}:{kind}"),
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Campaign {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub dedupe_key: String,
    #[sqlx(rename = "campaign_kind", try_from = "String")]
    pub kind: CampaignKind,
    #[sqlx(try_from = "String")]
    pub template: TemplateId,
    #[sqlx(try_from = "String")]
    pub status: CampaignStatus,
    pub current_step: i32,
    pub total_steps: i32,
    pub anchor_at: OffsetDateTime,
    pub next_action_at: OffsetDateTime,
    pub success_probability: f64,
    #[sqlx(rename = "trigger_data", json)]
    pub trigger: CampaignTrigger,
    pub recovered_cents: i64,
    pub failure_reason: Option<String>,
    pub locked_until: Option<OffsetDateTime>,
    pub started_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl Campaign {
    pub fn current(&self) -> Option<&'static DunningStep> {
        self.template.template().step(self.current_step)
    }

    pub fn is_due(&self, now: OffsetDateTime) -> bool {
        self.status == CampaignStatus::Active
            && self.next_action_at <= now
            && self.locked_until.map_or(true, |until| until <= now)
    }
}

/// Values needed to insert a campaign
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub customer_id: Uuid,
    pub subscription_id: Option<Uuid>,
    pub dedupe_key: String,
    pub template: TemplateId,
    pub anchor_at: OffsetDateTime,
    pub next_action_at: OffsetDateTime,
    pub success_probability: f64,
    pub trigger: CampaignTrigger,
    pub started_at: OffsetDateTime,
}

/// Result of inserting a campaign under the one-open-campaign rule
#[derive(Debug, Clone)]
pub enum CampaignInsert {
    Created(Campaign),
    AlreadyOpen(Campaign),
}

impl CampaignInsert {
    pub fn campaign(&self) -> &Campaign {
        match self {
            CampaignInsert::Created(c) | CampaignInsert::AlreadyOpen(c) => c,
        }
    }

    pub fn into_campaign(self) -> Campaign {
        match self {
            CampaignInsert::Created(c) | CampaignInsert::AlreadyOpen(c) => c,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CampaignInsert::Created(_))
    }
}

/// How a campaign ended
#[derive(Debug, Clone, PartialEq)]
pub enum CampaignOutcome {
    Recovered { amount_cents: i64 },
    Exhausted,
    Canceled,
    Failed { reason: String },
}

impl CampaignOutcome {
    pub fn status(&self) -> CampaignStatus {
        match self {
            CampaignOutcome::Failed { .. } => CampaignStatus::Failed,
            _ => CampaignStatus::Completed,
        }
    }

    pub fn recovered_cents(&self) -> i64 {
        match self {
            CampaignOutcome::Recovered { amount_cents } => *amount_cents,
            _ => 0,
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            CampaignOutcome::Recovered { .. } => None,
            CampaignOutcome::Exhausted => Some("all steps exhausted".to_string()),
            CampaignOutcome::Canceled => Some("subscription canceled".to_string()),
            CampaignOutcome::Failed { reason } => Some(reason.clone()),
        }
    }
}

/// One executed step
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DunningActionRecord {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub step_number: i32,
    #[sqlx(try_from = "String")]
    pub action_type: ActionType,
    pub success: bool,
    pub detail: serde_json::Value,
    pub executed_at: OffsetDateTime,
}
