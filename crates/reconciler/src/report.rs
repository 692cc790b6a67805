//! Reconciliation reports and ingress status conditions.

use chrono::{DateTime, Utc};
use serde::Serialize;

use alb_core::{Error, ResourceKind};

use crate::converge::ConvergeSummary;
use crate::graph::{IngressGraph, IngressKey};
use crate::node::{NodeState, NodeView, Verdict};
use crate::plan::Step;

/// How a node fared in one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Nothing to do.
    Unchanged,
    Applied,
    Failed,
    /// Did not run this pass; nothing went wrong.
    Deferred,
    /// Planned only.
    Pending,
}

/// Per-node result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub kind: ResourceKind,
    pub id: String,
    pub verdict: Verdict,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<&'static str>,
    /// The error may clear on a later pass without the input changing.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// The current value after the pass.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<serde_json::Value>,
}

impl NodeOutcome {
    /// Snapshot of `node`'s verdict and state.
    #[must_use]
    pub fn of(node: &dyn NodeView) -> Self {
        let error = match node.state() {
            NodeState::Failed(error) => Some(error),
            _ => None,
        };
        Self {
            kind: node.kind(),
            id: node.id().to_owned(),
            verdict: node.verdict().clone(),
            status: status(node.verdict(), node.state()),
            error: error.map(ToString::to_string),
            error_category: error.map(Error::category),
            retryable: error.is_some_and(Error::is_retryable),
            handle: node.handle().map(str::to_owned),
            current: node.current_json(),
        }
    }
}

fn status(verdict: &Verdict, state: &NodeState) -> OutcomeStatus {
    match state {
        NodeState::Failed(error) if error.is_deferral() => OutcomeStatus::Deferred,
        NodeState::Failed(_) => OutcomeStatus::Failed,
        NodeState::Applied if verdict.is_noop() => OutcomeStatus::Unchanged,
        NodeState::Applied => OutcomeStatus::Applied,
        NodeState::Pending | NodeState::InProgress if verdict.is_noop() => OutcomeStatus::Unchanged,
        NodeState::Pending | NodeState::InProgress => OutcomeStatus::Pending,
    }
}

/// Kubernetes-style status condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub status: bool,
    pub reason: &'static str,
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

/// Result of reconciling one ingress.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub ingress: IngressKey,
    pub outcomes: Vec<NodeOutcome>,
    /// A second diff right after the pass would find nothing to do.
    pub converged: bool,
    pub summary: ConvergeSummary,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    /// Collect outcomes from a converged-over graph, before pruning.
    #[must_use]
    pub fn from_graph(graph: &IngressGraph, summary: ConvergeSummary) -> Self {
        Self {
            ingress: graph.ingress.clone(),
            outcomes: graph.nodes().into_iter().map(NodeOutcome::of).collect(),
            converged: false,
            summary,
            finished_at: Utc::now(),
        }
    }

    fn count(&self, status: OutcomeStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    #[must_use]
    pub fn applied(&self) -> usize {
        self.count(OutcomeStatus::Applied)
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.count(OutcomeStatus::Failed)
    }

    #[must_use]
    pub fn deferred(&self) -> usize {
        self.count(OutcomeStatus::Deferred)
    }

    /// No node failed. Deferred nodes do not count as failures.
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.failed() == 0
    }

    /// Another pass may make progress on its own: not converged, and at
    /// least one node failed or was deferred for a retryable reason.
    #[must_use]
    pub fn should_requeue(&self) -> bool {
        !self.converged && self.outcomes.iter().any(|o| o.retryable)
    }

    /// The outcome of the node `id` of `kind`.
    #[must_use]
    pub fn outcome(&self, kind: ResourceKind, id: &str) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind && o.id == id)
    }

    /// `Ready`, `Progressing` and `Degraded` conditions for the ingress.
    #[must_use]
    pub fn conditions(&self) -> Vec<Condition> {
        let now = self.finished_at;
        let failed = self.failed();
        let deferred = self.deferred();
        let first_error = self
            .outcomes
            .iter()
            .find(|o| o.status == OutcomeStatus::Failed)
            .and_then(|o| o.error.clone())
            .unwrap_or_default();

        vec![
            Condition {
                type_: "Ready",
                status: self.converged,
                reason: if self.converged { "Reconciled" } else { "NotReconciled" },
                message: format!("{} of {} resources in sync", self.in_sync(), self.outcomes.len()),
                last_transition_time: now,
            },
            Condition {
                type_: "Progressing",
                status: !self.converged && failed == 0,
                reason: if deferred > 0 { "Deferred" } else { "Applying" },
                message: format!("{} applied, {deferred} deferred", self.applied()),
                last_transition_time: now,
            },
            Condition {
                type_: "Degraded",
                status: failed > 0,
                reason: if failed > 0 { "ApplyFailed" } else { "AsExpected" },
                message: first_error,
                last_transition_time: now,
            },
        ]
    }

    fn in_sync(&self) -> usize {
        self.count(OutcomeStatus::Applied)
            .saturating_add(self.count(OutcomeStatus::Unchanged))
    }
}

/// Dry-run result: verdicts and the ordered steps that would run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanReport {
    pub ingress: IngressKey,
    pub outcomes: Vec<NodeOutcome>,
    pub steps: Vec<Step>,
}

impl PlanReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
