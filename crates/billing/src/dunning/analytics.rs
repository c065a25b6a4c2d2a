//! Recovery performance summaries
//!
//! Rates only count campaigns that have closed. Campaigns still running are
//! reported separately so they do not drag recovery rates down.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use uuid::Uuid;

use super::campaign::{ActionType, Campaign, CampaignKind, DunningActionRecord, TemplateId};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KindPerformance {
    pub kind: CampaignKind,
    pub campaigns: usize,
    pub recoveries: usize,
    pub recovery_rate_pct: f64,
    pub recovered_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemplatePerformance {
    pub template: TemplateId,
    pub campaigns: usize,
    pub recoveries: usize,
    pub predicted_success_pct: f64,
    pub actual_success_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepEffectiveness {
    pub template: TemplateId,
    pub step_number: i32,
    pub action_type: ActionType,
    pub actions: usize,
    pub successes: usize,
    pub success_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryAnalytics {
    pub period_days: i64,
    /// Closed campaigns started in the window
    pub total_campaigns: usize,
    pub in_flight_campaigns: usize,
    pub successful_recoveries: usize,
    pub recovery_rate_pct: f64,
    pub total_recovered_cents: i64,
    pub avg_recovery_cents: i64,
    pub avg_resolution_hours: f64,
    pub by_kind: Vec<KindPerformance>,
    pub by_template: Vec<TemplatePerformance>,
    pub by_step: Vec<StepEffectiveness>,
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn pct(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        round2(part as f64 * 100.0 / whole as f64)
    }
}

pub fn summarize(
    period_days: i64,
    campaigns: &[Campaign],
    actions: &[DunningActionRecord],
) -> RecoveryAnalytics {
    let (closed, open): (Vec<&Campaign>, Vec<&Campaign>) =
        campaigns.iter().partition(|c| c.completed_at.is_some());
    let recovered: Vec<&Campaign> = closed
        .iter()
        .copied()
        .filter(|c| c.recovered_cents > 0)
        .collect();
    let total_recovered_cents: i64 = recovered.iter().map(|c| c.recovered_cents).sum();

    let resolution_hours: Vec<f64> = closed
        .iter()
        .filter_map(|c| c.completed_at.map(|done| (done - c.started_at).as_seconds_f64() / 3600.0))
        .collect();
    let avg_resolution_hours = if resolution_hours.is_empty() {
        0.0
    } else {
        round2(resolution_hours.iter().sum::<f64>() / resolution_hours.len() as f64)
    };

    let mut kinds: BTreeMap<&'static str, (CampaignKind, usize, usize, i64)> = BTreeMap::new();
    for c in &closed {
        let entry = kinds.entry(c.kind.as_str()).or_insert((c.kind, 0, 0, 0));
        entry.1 += 1;
        if c.recovered_cents > 0 {
            entry.2 += 1;
            entry.3 += c.recovered_cents;
        }
    }
    let by_kind = kinds
        .into_values()
        .map(|(kind, count, recoveries, recovered_cents)| KindPerformance {
            kind,
            campaigns: count,
            recoveries,
            recovery_rate_pct: pct(recoveries, count),
            recovered_cents,
        })
        .collect();

    let mut templates: BTreeMap<&'static str, (TemplateId, usize, usize, f64)> = BTreeMap::new();
    for c in &closed {
        let entry = templates
            .entry(c.template.as_str())
            .or_insert((c.template, 0, 0, 0.0));
        entry.1 += 1;
        if c.recovered_cents > 0 {
            entry.2 += 1;
        }
        entry.3 += c.success_probability;
    }
    let by_template = templates
        .into_values()
        .map(|(template, count, recoveries, probability_sum)| TemplatePerformance {
            template,
            campaigns: count,
            recoveries,
            predicted_success_pct: round2(probability_sum * 100.0 / count as f64),
            actual_success_pct: pct(recoveries, count),
        })
        .collect();

    // Step outcomes are final once recorded, so running campaigns count here
    let template_of: HashMap<Uuid, TemplateId> =
        campaigns.iter().map(|c| (c.id, c.template)).collect();
    let mut steps: BTreeMap<(&'static str, i32), (TemplateId, ActionType, usize, usize)> =
        BTreeMap::new();
    for a in actions {
        let Some(template) = template_of.get(&a.campaign_id) else {
            continue;
        };
        let entry = steps
            .entry((template.as_str(), a.step_number))
            .or_insert((*template, a.action_type, 0, 0));
        entry.2 += 1;
        if a.success {
            entry.3 += 1;
        }
    }
    let by_step = steps
        .into_iter()
        .map(
            |((_, step_number), (template, action_type, count, successes))| StepEffectiveness {
                template,
                step_number,
                action_type,
                actions: count,
                successes,
                success_pct: pct(successes, count),
            },
        )
        .collect();

    RecoveryAnalytics {
        period_days,
        total_campaigns: closed.len(),
        in_flight_campaigns: open.len(),
        successful_recoveries: recovered.len(),
        recovery_rate_pct: pct(recovered.len(), closed.len()),
        total_recovered_cents,
        avg_recovery_cents: if recovered.is_empty() {
            0
        } else {
            total_recovered_cents / recovered.len() as i64
        },
        avg_resolution_hours,
        by_kind,
        by_template,
        by_step,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dunning::campaign::{CampaignStatus, CampaignTrigger};
    use time::macros::datetime;
    use time::Duration;

    fn campaign(template: TemplateId, recovered: i64, hours_to_close: Option<i64>) -> Campaign {
        let started = datetime!(2026-05-01 00:00 UTC);
        Campaign {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            subscription_id: None,
            dedupe_key: "k".into(),
            kind: template.template().kind,
            template,
            status: if hours_to_close.is_some() {
                CampaignStatus::Completed
            } else {
                CampaignStatus::Active
            },
            current_step: 1,
            total_steps: template.template().total_steps(),
            anchor_at: started,
            next_action_at: started,
            success_probability: 0.65,
            trigger: CampaignTrigger::FailedPayment {
                invoice_id: "in_1".into(),
                amount_cents: recovered,
                attempt_count: 1,
                failure_code: None,
                failure_message: None,
            },
            recovered_cents: recovered,
            failure_reason: None,
            locked_until: None,
            started_at: started,
            completed_at: hours_to_close.map(|h| started + Duration::hours(h)),
        }
    }

    fn action(campaign: &Campaign, step: i32, success: bool) -> DunningActionRecord {
        DunningActionRecord {
            id: Uuid::new_v4(),
            campaign_id: campaign.id,
            step_number: step,
            action_type: ActionType::PaymentRetry,
            success,
            detail: serde_json::json!({}),
            executed_at: campaign.started_at,
        }
    }

    #[test]
    fn empty_window_is_all_zero() {
        let a = summarize(30, &[], &[]);
        assert_eq!(a.total_campaigns, 0);
        assert_eq!(a.in_flight_campaigns, 0);
        assert!(a.by_kind.is_empty());
        assert_eq!(a.recovery_rate_pct, 0.0);
        assert_eq!(a.avg_recovery_cents, 0);
        assert_eq!(a.avg_resolution_hours, 0.0);
        assert!(a.by_template.is_empty());
    }

    #[test]
    fn rates_are_rounded_to_two_decimals() {
        let campaigns = vec![
            campaign(TemplateId::FailedPaymentStandard, 9_700, Some(10)),
            campaign(TemplateId::FailedPaymentStandard, 0, Some(336)),
            campaign(TemplateId::FailedPaymentStandard, 0, Some(50)),
        ];
        let a = summarize(30, &campaigns, &[]);
        assert_eq!(a.successful_recoveries, 1);
        assert_eq!(a.recovery_rate_pct, 33.33);
        assert_eq!(a.total_recovered_cents, 9_700);
        assert_eq!(a.avg_recovery_cents, 9_700);
        assert_eq!(a.avg_resolution_hours, 132.0);

        let standard = &a.by_template[0];
        assert_eq!(standard.campaigns, 3);
        assert_eq!(standard.predicted_success_pct, 65.0);
        assert_eq!(standard.actual_success_pct, 33.33);
    }

    #[test]
    fn running_campaigns_do_not_dilute_recovery_rate() {
        let campaigns = vec![
            campaign(TemplateId::FailedPaymentStandard, 9_700, Some(10)),
            campaign(TemplateId::FailedPaymentStandard, 0, None),
            campaign(TemplateId::FailedPaymentStandard, 0, None),
            campaign(TemplateId::FailedPaymentStandard, 0, None),
        ];
        let a = summarize(30, &campaigns, &[]);
        assert_eq!(a.total_campaigns, 1);
        assert_eq!(a.in_flight_campaigns, 3);
        assert_eq!(a.recovery_rate_pct, 100.0);
        assert_eq!(a.by_template[0].campaigns, 1);
    }

    #[test]
    fn closed_campaigns_are_broken_down_by_kind() {
        let campaigns = vec![
            campaign(TemplateId::FailedPaymentStandard, 9_700, Some(10)),
            campaign(TemplateId::FailedPaymentStandard, 0, Some(336)),
            campaign(TemplateId::ExpiringCards, 4_900, Some(24)),
            campaign(TemplateId::ExpiringCards, 0, None),
        ];
        let a = summarize(30, &campaigns, &[]);
        assert_eq!(a.by_kind.len(), 2);

        let card = a.by_kind.iter().find(|k| k.kind == CampaignKind::CardExpiring).unwrap();
        assert_eq!(card.campaigns, 1);
        assert_eq!(card.recovery_rate_pct, 100.0);
        assert_eq!(card.recovered_cents, 4_900);

        let failed = a.by_kind.iter().find(|k| k.kind == CampaignKind::FailedPayment).unwrap();
        assert_eq!(failed.campaigns, 2);
        assert_eq!(failed.recoveries, 1);
        assert_eq!(failed.recovery_rate_pct, 50.0);
    }

    #[test]
    fn step_effectiveness_is_per_template_step() {
        let std = campaign(TemplateId::FailedPaymentStandard, 0, None);
        let vip = campaign(TemplateId::HighValueCustomer, 0, None);
        let actions = vec![
            action(&std, 1, true),
            action(&vip, 1, false),
            action(&vip, 1, true),
        ];
        let a = summarize(7, &[std, vip], &actions);
        assert_eq!(a.by_step.len(), 2);
        let vip_step = a
            .by_step
            .iter()
            .find(|s| s.template == TemplateId::HighValueCustomer)
            .unwrap();
        assert_eq!(vip_step.actions, 2);
        assert_eq!(vip_step.success_pct, 50.0);
    }
}
