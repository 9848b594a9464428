//! Plan lifecycle notifications.

pub mod slack;

pub use slack::{SlackMessage, SlackNotifier};

use chrono::{DateTime, Utc};

use crate::plan::{Plan, StepStatus};

fn version_path(plan: &Plan) -> String {
    if plan.needs_cluster_upgrade() {
        format!(
            "{} (embedded cluster {} → {})",
            plan.version_label, plan.current_ec_version, plan.new_ec_version
        )
    } else {
        plan.version_label.clone()
    }
}

fn elapsed(plan: &Plan, now: DateTime<Utc>) -> String {
    let secs = (now - plan.created_at).num_seconds().unsigned_abs();
    format!("{}m {}s", secs / 60, secs % 60)
}

fn context(plan: &Plan) -> String {
    format!("Sent by ecup for plan {}", plan.id)
}

/// Message for a plan whose steps all completed.
pub fn build_completed_message(plan: &Plan, now: DateTime<Utc>) -> SlackMessage {
    SlackMessage {
        header: "Upgrade Completed".to_string(),
        fields: vec![
            ("App".to_string(), plan.app_slug.clone()),
            ("Version".to_string(), version_path(plan)),
            ("Steps".to_string(), plan.steps.len().to_string()),
            ("Duration".to_string(), elapsed(plan, now)),
        ],
        context: context(plan),
    }
}

/// Message for a plan that stopped on an error.
pub fn build_failed_message(plan: &Plan, error: &str, now: DateTime<Utc>) -> SlackMessage {
    let failed_step = plan
        .steps
        .iter()
        .find(|s| s.status == StepStatus::Failed)
        .or_else(|| plan.active_step())
        .map_or_else(|| "unknown".to_string(), |s| s.name.clone());

    SlackMessage {
        header: "Upgrade Failed".to_string(),
        fields: vec![
            ("App".to_string(), plan.app_slug.clone()),
            ("Version".to_string(), version_path(plan)),
            ("Failed Step".to_string(), failed_step),
            ("Duration".to_string(), elapsed(plan, now)),
            ("Error".to_string(), error.to_string()),
        ],
        context: context(plan),
    }
}
