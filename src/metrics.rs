//! Prometheus metrics for ecup.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::dispatch::Command;
use crate::plan::{StepStatus, StepType};

/// Labels for command dispatch metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CommandLabels {
    pub command: String,
    pub result: String,
}

/// Labels for step status transitions.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub step_type: String,
    pub status: String,
}

/// Labels for finished plans.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PlanLabels {
    pub result: String,
}

pub struct Metrics {
    pub connected_agents: Gauge,
    pub commands_dispatched_total: Family<CommandLabels, Counter>,
    pub step_transitions_total: Family<StepLabels, Counter>,
    pub plans_finished_total: Family<PlanLabels, Counter>,
}

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let connected_agents = Gauge::default();
        registry.register(
            "ecup_connected_agents",
            "Number of EC managers currently connected",
            connected_agents.clone(),
        );

        let commands_dispatched_total = Family::<CommandLabels, Counter>::default();
        registry.register(
            "ecup_commands_dispatched",
            "Total number of commands written to EC managers",
            commands_dispatched_total.clone(),
        );

        let step_transitions_total = Family::<StepLabels, Counter>::default();
        registry.register(
            "ecup_step_transitions",
            "Total number of plan step status transitions",
            step_transitions_total.clone(),
        );

        let plans_finished_total = Family::<PlanLabels, Counter>::default();
        registry.register(
            "ecup_plans_finished",
            "Total number of plan executions that returned",
            plans_finished_total.clone(),
        );

        Self {
            connected_agents,
            commands_dispatched_total,
            step_transitions_total,
            plans_finished_total,
        }
    }

    pub fn set_connected_agents(&self, count: usize) {
        self.connected_agents
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn record_command(&self, command: Command, ok: bool) {
        self.commands_dispatched_total
            .get_or_create(&CommandLabels {
                command: command.to_string(),
                result: if ok { "success" } else { "error" }.to_string(),
            })
            .inc();
    }

    pub fn record_step_transition(&self, step_type: StepType, status: StepStatus) {
        self.step_transitions_total
            .get_or_create(&StepLabels {
                step_type: step_type.to_string(),
                status: status.to_string(),
            })
            .inc();
    }

    pub fn record_plan_finished(&self, ok: bool) {
        self.plans_finished_total
            .get_or_create(&PlanLabels {
                result: if ok { "complete" } else { "failed" }.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
pub async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}
