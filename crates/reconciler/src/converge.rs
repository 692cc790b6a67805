//! Converger: executes a step plan against a provider.
//!
//! Steps whose prerequisites have all succeeded are started as soon as a
//! concurrency slot is free. A failed step fails its node and every step
//! reachable from it in the plan; unrelated branches keep going. Successful
//! steps roll the node's current half forward so that re-diffing the graph
//! afterwards shows only what is still outstanding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use alb_core::{Error, ResourceKind, Result, ResultExt};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Bfs;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::graph::{IngressGraph, NodeRef};
use crate::node::{Handle, Node, NodeState, NodeView, Verdict};
use crate::plan::{Plan, Step, StepOp};
use crate::provider::{Change, CreateRequest, ModifyRequest, Provider};
use crate::types::{FieldDiff, Resource};

/// Counters of one convergence pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConvergeSummary {
    /// Steps in the plan.
    pub planned: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Steps not started because a prerequisite failed.
    pub skipped: usize,
    pub cancelled: bool,
}

/// A fully prepared provider call.
#[derive(Debug)]
enum Action {
    Create(CreateRequest),
    Modify { handle: Handle, request: ModifyRequest },
    Delete { kind: ResourceKind, handle: Handle },
}

async fn execute(provider: Arc<dyn Provider>, action: Action) -> Result<Option<Handle>> {
    match action {
        Action::Create(request) => provider.create(request).await.map(Some),
        Action::Modify { handle, request } => provider.modify(&handle, request).await.map(|()| None),
        // Already gone counts as deleted.
        Action::Delete { kind, handle } => provider
            .delete(kind, &handle)
            .await
            .ignore_not_found()
            .map(|_| None),
    }
}

/// Executes plans with bounded concurrency.
#[derive(Clone)]
pub struct Converger {
    provider: Arc<dyn Provider>,
    max_concurrent: usize,
}

impl Converger {
    /// Create a converger issuing at most `max_concurrent` calls at once.
    pub fn new(provider: Arc<dyn Provider>, max_concurrent: usize) -> Self {
        Self {
            provider,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Drive `graph` towards its desired side.
    ///
    /// Node states are updated in place. On return every node is either
    /// [`NodeState::Applied`] or [`NodeState::Failed`]. Once `cancel` fires,
    /// no new steps start; steps already in flight run to completion.
    #[instrument(skip_all, fields(ingress = %graph.ingress))]
    pub async fn converge(&self, graph: &mut IngressGraph, cancel: &CancellationToken) -> ConvergeSummary {
        init_states(graph);
        let plan = Plan::build(graph);
        let dag = plan.dag();
        let mut in_degree = plan.in_degrees();
        let mut remaining: HashMap<NodeRef, usize> = HashMap::new();
        for step in plan.steps() {
            let count = remaining.entry(step.node.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }

        let mut ready: VecDeque<NodeIndex> = dag
            .node_indices()
            .filter(|i| in_degree.get(i) == Some(&0))
            .collect();
        let mut doomed: HashSet<NodeIndex> = HashSet::new();
        let mut in_flight = FuturesUnordered::new();
        let mut summary = ConvergeSummary {
            planned: plan.len(),
            ..ConvergeSummary::default()
        };

        info!(steps = plan.len(), "Starting convergence");

        loop {
            while in_flight.len() < self.max_concurrent && !cancel.is_cancelled() {
                let Some(index) = ready.pop_front() else {
                    break;
                };
                if doomed.contains(&index) {
                    continue;
                }
                let Some(step) = dag.node_weight(index) else {
                    continue;
                };
                match prepare(graph, step) {
                    Ok(action) => {
                        debug!(%step, "starting step");
                        graph.with_node(&step.node, |node| node.set_state(NodeState::InProgress));
                        let provider = Arc::clone(&self.provider);
                        in_flight.push(async move { (index, execute(provider, action).await) });
                    }
                    Err(error) => fail(graph, dag, index, error, &mut doomed, &mut summary),
                }
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };
            let Some(step) = dag.node_weight(index) else {
                continue;
            };
            match result {
                Ok(handle) => {
                    debug!(%step, "step succeeded");
                    summary.succeeded = summary.succeeded.saturating_add(1);
                    finish(graph, step, handle, &mut remaining);
                    for next in dag.neighbors_directed(index, Direction::Outgoing) {
                        if let Some(degree) = in_degree.get_mut(&next) {
                            *degree = degree.saturating_sub(1);
                            if *degree == 0 {
                                ready.push_back(next);
                            }
                        }
                    }
                }
                Err(error) => fail(graph, dag, index, error, &mut doomed, &mut summary),
            }
        }

        summary.cancelled = cancel.is_cancelled();
        let cancelled = summary.cancelled;
        graph.visit_mut(&mut |node| {
            if !node.state().is_terminal() {
                let error = if cancelled {
                    Error::Cancelled
                } else {
                    Error::dependency_blocked(node.kind(), node.id(), "a dependency cycle")
                };
                node.set_state(NodeState::Failed(error));
            }
        });

        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "Convergence complete"
        );
        summary
    }
}

/// Nodes without steps are settled before the plan runs.
fn init_states(graph: &mut IngressGraph) {
    graph.visit_mut(&mut |node| {
        let state = match node.verdict() {
            Verdict::NoOp => NodeState::Applied,
            Verdict::Blocked { blocked_by } => NodeState::Failed(Error::dependency_blocked(
                node.kind(),
                node.id(),
                blocked_by.clone(),
            )),
            _ => NodeState::Pending,
        };
        node.set_state(state);
    });
}

/// Roll the node forward after a successful step.
fn finish(graph: &mut IngressGraph, step: &Step, handle: Option<Handle>, remaining: &mut HashMap<NodeRef, usize>) {
    let left = remaining.get_mut(&step.node).map(|count| {
        *count = count.saturating_sub(1);
        *count
    });
    graph.with_node(&step.node, |node| {
        match (step.op, handle) {
            (StepOp::Create, Some(handle)) => node.mark_created(handle),
            (StepOp::Create, None) => {}
            (StepOp::Modify, _) => node.mark_modified(),
            (StepOp::Delete, _) => node.mark_deleted(),
        }
        if left == Some(0) {
            node.set_state(NodeState::Applied);
        }
    });
}

/// Fail the step at `index` and every step that depends on it.
fn fail(
    graph: &mut IngressGraph,
    dag: &DiGraph<Step, ()>,
    index: NodeIndex,
    error: Error,
    doomed: &mut HashSet<NodeIndex>,
    summary: &mut ConvergeSummary,
) {
    let Some(step) = dag.node_weight(index) else {
        return;
    };
    warn!(%step, %error, "step failed");
    summary.failed = summary.failed.saturating_add(1);

    // The resource is gone; the next pass recreates it.
    if step.op == StepOp::Modify && error.is_not_found() {
        graph.with_node(&step.node, |node| node.mark_deleted());
    }
    set_failed(graph, &step.node, error);

    let blocker = step.to_string();
    let mut bfs = Bfs::new(dag, index);
    while let Some(next) = bfs.next(dag) {
        if next == index || !doomed.insert(next) {
            continue;
        }
        if let Some(dependent) = dag.node_weight(next) {
            debug!(step = %dependent, %blocker, "skipping step");
            summary.skipped = summary.skipped.saturating_add(1);
            set_failed(
                graph,
                &dependent.node,
                Error::dependency_blocked(dependent.node.kind, &dependent.node.id, &blocker),
            );
        }
    }
}

/// The first failure of a node is the one reported.
fn set_failed(graph: &mut IngressGraph, at: &NodeRef, error: Error) {
    graph.with_node(at, |node| {
        if !matches!(node.state(), NodeState::Failed(_)) {
            node.set_state(NodeState::Failed(error));
        }
    });
}

fn prepare(graph: &IngressGraph, step: &Step) -> Result<Action> {
    let at = &step.node;
    match step.op {
        StepOp::Create => create_request(graph, at).map(Action::Create),
        StepOp::Modify => modify_request(graph, at),
        StepOp::Delete => {
            let handle = graph
                .nodes()
                .into_iter()
                .find(|n| n.kind() == at.kind && n.id() == at.id)
                .and_then(|n| n.handle().map(str::to_owned))
                .ok_or_else(|| Error::not_found(at.kind, &at.id))?;
            Ok(Action::Delete { kind: at.kind, handle })
        }
    }
}

fn parent_handle<T: Resource>(at: &NodeRef, parent: &Node<T>) -> Result<Handle> {
    parent
        .handle
        .clone()
        .ok_or_else(|| Error::dependency_blocked(at.kind, &at.id, NodeRef::of(parent).to_string()))
}

fn target_group_handle(graph: &IngressGraph, at: &NodeRef, name: &str) -> Result<Handle> {
    graph
        .target_group(name)
        .and_then(|tg| tg.node.handle.clone())
        .ok_or_else(|| Error::dependency_blocked(at.kind, &at.id, format!("target group '{name}'")))
}

fn create_request(graph: &IngressGraph, at: &NodeRef) -> Result<CreateRequest> {
    let missing = || Error::not_found(at.kind, &at.id);
    match at.kind {
        ResourceKind::LoadBalancer => {
            let lb = graph
                .load_balancer
                .as_ref()
                .filter(|lb| lb.node.id() == at.id)
                .ok_or_else(missing)?;
            Ok(CreateRequest::LoadBalancer {
                spec: lb.node.desired.clone().ok_or_else(missing)?,
                tags: lb.node.desired_tags.clone(),
            })
        }
        ResourceKind::Listener => {
            let lb = graph.load_balancer.as_ref().ok_or_else(missing)?;
            let listener = graph.listener(&at.id).ok_or_else(missing)?;
            let mut spec = listener.node.desired.clone().ok_or_else(missing)?;
            spec.default_target_group = target_group_handle(graph, at, &spec.default_target_group)?;
            Ok(CreateRequest::Listener {
                load_balancer: parent_handle(at, &lb.node)?,
                spec,
            })
        }
        ResourceKind::Rule => {
            let (listener, rule) = graph.rule(&at.id).ok_or_else(missing)?;
            let mut spec = rule.desired.clone().ok_or_else(missing)?;
            spec.target_group = target_group_handle(graph, at, &spec.target_group)?;
            Ok(CreateRequest::Rule {
                listener: parent_handle(at, &listener.node)?,
                spec,
            })
        }
        ResourceKind::TargetGroup => {
            let tg = graph.target_group(&at.id).ok_or_else(missing)?;
            Ok(CreateRequest::TargetGroup {
                spec: tg.node.desired.clone().ok_or_else(missing)?,
                tags: tg.node.desired_tags.clone(),
            })
        }
        ResourceKind::TargetGroupBinding => {
            let tg = graph.binding_owner(&at.id).ok_or_else(missing)?;
            let targets = tg.targets.desired.as_ref().ok_or_else(missing)?;
            Ok(CreateRequest::Binding {
                target_group: parent_handle(at, &tg.node)?,
                targets: targets.targets.clone(),
            })
        }
    }
}

/// Handle, desired value and field diff of a node present on both sides.
fn both_sides<T: Resource>(at: &NodeRef, node: &Node<T>) -> Result<(Handle, T, FieldDiff)> {
    let missing = || Error::not_found(at.kind, &at.id);
    let handle = node.handle.clone().ok_or_else(missing)?;
    let desired = node.desired.clone().ok_or_else(missing)?;
    let diff = node.field_diff().ok_or_else(missing)?;
    Ok((handle, desired, diff))
}

fn modify_request(graph: &IngressGraph, at: &NodeRef) -> Result<Action> {
    let missing = || Error::not_found(at.kind, &at.id);
    let (handle, diff, change) = match at.kind {
        ResourceKind::LoadBalancer => {
            let lb = graph
                .load_balancer
                .as_ref()
                .filter(|lb| lb.node.id() == at.id)
                .ok_or_else(missing)?;
            let (handle, spec, diff) = both_sides(at, &lb.node)?;
            let tags = lb.node.desired_tags.changes_from(&lb.node.current_tags);
            (handle, diff, Change::LoadBalancer { spec, tags })
        }
        ResourceKind::Listener => {
            let listener = graph.listener(&at.id).ok_or_else(missing)?;
            let (handle, mut spec, diff) = both_sides(at, &listener.node)?;
            spec.default_target_group = target_group_handle(graph, at, &spec.default_target_group)?;
            (handle, diff, Change::Listener { spec })
        }
        ResourceKind::Rule => {
            let (_, rule) = graph.rule(&at.id).ok_or_else(missing)?;
            let (handle, mut spec, diff) = both_sides(at, rule)?;
            spec.target_group = target_group_handle(graph, at, &spec.target_group)?;
            (handle, diff, Change::Rule { spec })
        }
        ResourceKind::TargetGroup => {
            let tg = graph.target_group(&at.id).ok_or_else(missing)?;
            let (handle, spec, diff) = both_sides(at, &tg.node)?;
            let tags = tg.node.desired_tags.changes_from(&tg.node.current_tags);
            (handle, diff, Change::TargetGroup { spec, tags })
        }
        ResourceKind::TargetGroupBinding => {
            let tg = graph.binding_owner(&at.id).ok_or_else(missing)?;
            let (handle, desired, diff) = both_sides(at, &tg.targets)?;
            let current = tg.targets.current.as_ref().ok_or_else(missing)?;
            let change = Change::Binding {
                register: desired.added_since(current),
                deregister: desired.removed_since(current),
            };
            (handle, diff, change)
        }
    };
    Ok(Action::Modify {
        handle,
        request: ModifyRequest { diff, change },
    })
}
