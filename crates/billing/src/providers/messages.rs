//! Customer-facing message copy
//!
//! Every template id referenced by a dunning step or webhook handler renders
//! here. Unknown ids fall back to the generic payment-update message.

use serde::Serialize;

#[derive(Debug, Clone, Default)]
pub struct MessageContext {
    pub first_name: String,
    pub plan_name: Option<String>,
    pub amount_cents: i64,
    pub currency: String,
    pub portal_url: String,
    pub discount_percent: Option<u8>,
    pub discount_months: Option<u8>,
    pub max_installments: Option<u8>,
    pub card_last4: Option<String>,
    pub trial_ends_on: Option<String>,
}

impl MessageContext {
    fn name(&self) -> &str {
        if self.first_name.is_empty() {
            "there"
        } else {
            &self.first_name
        }
    }

    fn plan(&self) -> &str {
        self.plan_name.as_deref().unwrap_or("your coaching plan")
    }

    fn amount(&self) -> String {
        format_amount(self.amount_cents, &self.currency)
    }

    fn card(&self) -> String {
        match &self.card_last4 {
            Some(last4) => format!("card ending in {last4}"),
            None => "card on file".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedMessage {
    pub template: String,
    pub subject: String,
    pub body: String,
}

/// Format cents for display: `$97.00` for USD, `97.00 EUR` otherwise
pub fn format_amount(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    let value = format!("{}.{:02}", abs / 100, abs % 100);
    if currency.eq_ignore_ascii_case("USD") || currency.is_empty() {
        format!("{sign}${value}")
    } else {
        format!("{sign}{value} {}", currency.to_uppercase())
    }
}

pub fn render(template: &str, ctx: &MessageContext) -> RenderedMessage {
    let name = ctx.name();
    let plan = ctx.plan();
    let amount = ctx.amount();
    let portal = &ctx.portal_url;

    let (subject, body) = match template {
        "payment_failed_gentle" => (
            format!("Payment update needed - {name}"),
            format!(
                "Hi {name},\n\nWe had trouble processing your payment of {amount} for {plan}. \
                 This happens sometimes and is usually quick to fix.\n\n\
                 Update your payment method here: {portal}"
            ),
        ),
        "payment_failed_urgent" => {
            let offer = ctx
                .discount_percent
                .map(|p| format!(" As a thank you for staying with us, your next payment is {p}% off."))
                .unwrap_or_default();
            (
                "Action required: payment failed".to_string(),
                format!(
                    "Hi {name},\n\nWe still could not collect {amount} for {plan}.{offer}\n\n\
                     Please update your payment method to keep your access: {portal}"
                ),
            )
        }
        "payment_final_notice" => (
            "Final notice".to_string(),
            format!(
                "{name}, your {plan} payment of {amount} is still outstanding. \
                 Update your card to avoid cancellation: {portal}"
            ),
        ),
        "vip_payment_failed" => (
            format!("{name}, a quick note about your {plan} membership"),
            format!(
                "Hi {name},\n\nYour payment of {amount} did not go through. \
                 Your coach and our team are here to help sort it out personally.\n\n\
                 You can update your details at {portal} or simply reply to this email."
            ),
        ),
        "vip_retention_offer" => (
            "We would love to keep coaching you".to_string(),
            format!(
                "Hi {name},\n\nYour {plan} membership is at risk because of an unpaid balance \
                 of {amount}. Reply to this email and we will find an arrangement that works \
                 for you, or update your payment method at {portal}."
            ),
        ),
        "card_expiring_early_notice" => (
            "Your card expires soon".to_string(),
            format!(
                "Hi {name},\n\nYour {} expires soon. Update it now to keep {plan} \
                 running without interruption: {portal}",
                ctx.card()
            ),
        ),
        "card_expiring_urgent" => (
            "Your card expires next week".to_string(),
            format!(
                "Hi {name},\n\nYour {} expires in a week. Please update it at {portal}",
                ctx.card()
            ),
        ),
        "card_expires_tomorrow" => (
            "Card expires tomorrow".to_string(),
            format!(
                "{name}, your {} expires tomorrow. Update it to keep {plan}: {portal}",
                ctx.card()
            ),
        ),
        "card_update_required_post_failure" => (
            "Please update your payment method".to_string(),
            format!(
                "Hi {name},\n\nYour {} has expired and we could not renew {plan}. \
                 Update your payment method here: {portal}",
                ctx.card()
            ),
        ),
        "discount_offer" => {
            let percent = ctx.discount_percent.unwrap_or(0);
            let months = ctx.discount_months.unwrap_or(1);
            (
                format!("{percent}% off {plan} for {months} months"),
                format!(
                    "Hi {name},\n\nWe have applied {percent}% off your next {months} months of \
                     {plan}. Settle the outstanding {amount} at {portal} to keep going."
                ),
            )
        }
        "payment_plan_offer" => {
            let installments = ctx.max_installments.unwrap_or(2);
            (
                "Split your balance into installments".to_string(),
                format!(
                    "Hi {name},\n\nYou can pay the outstanding {amount} for {plan} in up to \
                     {installments} installments. Choose a schedule at {portal}"
                ),
            )
        }
        "subscription_canceled" => (
            format!("Your {plan} subscription has been canceled"),
            format!(
                "Hi {name},\n\nWe were unable to collect {amount} and your {plan} subscription \
                 has been canceled. You can restart any time at {portal}"
            ),
        ),
        "trial_will_end" => {
            let when = ctx.trial_ends_on.as_deref().unwrap_or("soon");
            (
                format!("Your {plan} trial ends {when}"),
                format!(
                    "Hi {name},\n\nYour trial of {plan} ends {when}. Your first payment of \
                     {amount} will be collected automatically. Manage billing at {portal}"
                ),
            )
        }
        _ => (
            format!("Payment update needed - {name}"),
            format!(
                "Hi {name},\n\nWe had trouble processing your payment for {plan} ({amount}). \
                 Please update your payment method to continue: {portal}"
            ),
        ),
    };

    RenderedMessage {
        template: template.to_string(),
        subject,
        body,
    }
}
