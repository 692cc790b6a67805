//! In-memory provider.
//!
//! Holds a [`ProviderSnapshot`] behind a mutex and enforces the integrity
//! rules a real load-balancing API enforces: names are unique, children need
//! a live parent, and a target group cannot be deleted while a listener or
//! rule forwards to it. Every call is journaled, and faults can be injected
//! per operation and kind, which is what the integration tests drive.

use std::collections::VecDeque;

use alb_core::{Error, ResourceKind, Result, TagChanges, TagSet};
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use super::{
    Change, CreateRequest, ListenerRecord, LoadBalancerRecord, ModifyRequest, Provider,
    ProviderSnapshot, RuleRecord, TargetGroupRecord,
};
use crate::node::Handle;
use crate::types::Target;
use alb_core::tags::CLUSTER_TAG;

/// Provider call type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Create,
    Modify,
    Delete,
}

/// One journaled provider call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Call {
    pub operation: Operation,
    pub kind: Option<ResourceKind>,
    /// Name for creates, handle otherwise.
    pub target: String,
    pub succeeded: bool,
}

impl Call {
    #[must_use]
    pub fn is(&self, operation: Operation, kind: ResourceKind) -> bool {
        self.operation == operation && self.kind == Some(kind)
    }
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    kind: Option<ResourceKind>,
    error: Error,
    persistent: bool,
}

#[derive(Debug, Default)]
struct State {
    snapshot: ProviderSnapshot,
    next_id: u64,
    journal: Vec<Call>,
    faults: VecDeque<Fault>,
}

impl State {
    fn next_handle(&mut self, kind: ResourceKind, label: &str) -> Handle {
        self.next_id = self.next_id.saturating_add(1);
        format!("arn:memory:{kind}/{label}/{:08x}", self.next_id)
    }

    /// Pop the first fault matching the call, keeping persistent ones.
    fn take_fault(&mut self, operation: Operation, kind: Option<ResourceKind>) -> Option<Error> {
        let index = self
            .faults
            .iter()
            .position(|f| f.operation == operation && (f.kind.is_none() || f.kind == kind))?;
        let fault = self.faults.get(index)?.clone();
        if !fault.persistent {
            self.faults.remove(index);
        }
        Some(fault.error)
    }

    fn record(&mut self, operation: Operation, kind: Option<ResourceKind>, target: &str, succeeded: bool) {
        self.journal.push(Call {
            operation,
            kind,
            target: target.to_owned(),
            succeeded,
        });
    }

    fn target_group_exists(&self, handle: &str) -> bool {
        self.snapshot.target_groups.iter().any(|tg| tg.handle == handle)
    }

    fn require_target_group(&self, handle: &str) -> Result<()> {
        if self.target_group_exists(handle) {
            Ok(())
        } else {
            Err(Error::not_found(ResourceKind::TargetGroup, handle))
        }
    }

    fn create(&mut self, request: CreateRequest) -> Result<Handle> {
        match request {
            CreateRequest::LoadBalancer { spec, tags } => {
                if self.snapshot.load_balancers.iter().any(|lb| lb.spec.name == spec.name) {
                    return Err(Error::conflict(ResourceKind::LoadBalancer, &spec.name, "name already in use"));
                }
                let handle = self.next_handle(ResourceKind::LoadBalancer, &spec.name);
                self.snapshot.load_balancers.push(LoadBalancerRecord {
                    handle: handle.clone(),
                    spec,
                    tags,
                });
                Ok(handle)
            }
            CreateRequest::Listener { load_balancer, spec } => {
                if !self.snapshot.load_balancers.iter().any(|lb| lb.handle == load_balancer) {
                    return Err(Error::not_found(ResourceKind::LoadBalancer, load_balancer));
                }
                self.require_target_group(&spec.default_target_group)?;
                if self
                    .snapshot
                    .listeners
                    .iter()
                    .any(|l| l.load_balancer == load_balancer && l.spec.port == spec.port)
                {
                    return Err(Error::conflict(
                        ResourceKind::Listener,
                        format!("{load_balancer}:{}", spec.port),
                        "port already has a listener",
                    ));
                }
                let handle = self.next_handle(ResourceKind::Listener, &spec.port.to_string());
                self.snapshot.listeners.push(ListenerRecord {
                    handle: handle.clone(),
                    load_balancer,
                    spec,
                });
                Ok(handle)
            }
            CreateRequest::Rule { listener, spec } => {
                if !self.snapshot.listeners.iter().any(|l| l.handle == listener) {
                    return Err(Error::not_found(ResourceKind::Listener, listener));
                }
                self.require_target_group(&spec.target_group)?;
                if self
                    .snapshot
                    .rules
                    .iter()
                    .any(|r| r.listener == listener && r.spec.priority == spec.priority)
                {
                    return Err(Error::conflict(
                        ResourceKind::Rule,
                        format!("{listener}:{}", spec.priority),
                        "priority already in use",
                    ));
                }
                let handle = self.next_handle(ResourceKind::Rule, &spec.priority.to_string());
                self.snapshot.rules.push(RuleRecord {
                    handle: handle.clone(),
                    listener,
                    spec,
                });
                Ok(handle)
            }
            CreateRequest::TargetGroup { spec, tags } => {
                if self.snapshot.target_groups.iter().any(|tg| tg.spec.name == spec.name) {
                    return Err(Error::conflict(ResourceKind::TargetGroup, &spec.name, "name already in use"));
                }
                let handle = self.next_handle(ResourceKind::TargetGroup, &spec.name);
                self.snapshot.target_groups.push(TargetGroupRecord {
                    handle: handle.clone(),
                    spec,
                    tags,
                    targets: Vec::new(),
                });
                Ok(handle)
            }
            CreateRequest::Binding { target_group, targets } => {
                let record = self.target_group_mut(&target_group)?;
                register(&mut record.targets, targets);
                Ok(target_group)
            }
        }
    }

    fn modify(&mut self, handle: &str, request: ModifyRequest) -> Result<()> {
        match request.change {
            Change::LoadBalancer { spec, tags } => {
                let record = self
                    .snapshot
                    .load_balancers
                    .iter_mut()
                    .find(|lb| lb.handle == handle)
                    .ok_or_else(|| Error::not_found(ResourceKind::LoadBalancer, handle))?;
                if record.spec.name != spec.name || record.spec.scheme != spec.scheme {
                    return Err(Error::conflict(
                        ResourceKind::LoadBalancer,
                        handle,
                        "name and scheme cannot be modified",
                    ));
                }
                record.spec = spec;
                apply_tags(&mut record.tags, tags);
            }
            Change::Listener { spec } => {
                self.require_target_group(&spec.default_target_group)?;
                let record = self
                    .snapshot
                    .listeners
                    .iter_mut()
                    .find(|l| l.handle == handle)
                    .ok_or_else(|| Error::not_found(ResourceKind::Listener, handle))?;
                if record.spec.port != spec.port {
                    return Err(Error::conflict(ResourceKind::Listener, handle, "port cannot be modified"));
                }
                record.spec = spec;
            }
            Change::Rule { spec } => {
                self.require_target_group(&spec.target_group)?;
                let record = self
                    .snapshot
                    .rules
                    .iter_mut()
                    .find(|r| r.handle == handle)
                    .ok_or_else(|| Error::not_found(ResourceKind::Rule, handle))?;
                if record.spec.priority != spec.priority {
                    return Err(Error::conflict(ResourceKind::Rule, handle, "priority cannot be modified"));
                }
                record.spec = spec;
            }
            Change::TargetGroup { spec, tags } => {
                let record = self.target_group_mut(handle)?;
                record.spec.health_check = spec.health_check;
                apply_tags(&mut record.tags, tags);
            }
            Change::Binding { register: added, deregister } => {
                let record = self.target_group_mut(handle)?;
                record.targets.retain(|t| !deregister.contains(t));
                register(&mut record.targets, added);
            }
        }
        Ok(())
    }

    fn delete(&mut self, kind: ResourceKind, handle: &str) -> Result<()> {
        let snapshot = &mut self.snapshot;
        match kind {
            ResourceKind::LoadBalancer => {
                let before = snapshot.load_balancers.len();
                snapshot.load_balancers.retain(|lb| lb.handle != handle);
                if snapshot.load_balancers.len() == before {
                    return Err(Error::not_found(kind, handle));
                }
                let listeners: Vec<Handle> = snapshot
                    .listeners
                    .iter()
                    .filter(|l| l.load_balancer == handle)
                    .map(|l| l.handle.clone())
                    .collect();
                snapshot.listeners.retain(|l| l.load_balancer != handle);
                snapshot.rules.retain(|r| !listeners.contains(&r.listener));
            }
            ResourceKind::Listener => {
                let before = snapshot.listeners.len();
                snapshot.listeners.retain(|l| l.handle != handle);
                if snapshot.listeners.len() == before {
                    return Err(Error::not_found(kind, handle));
                }
                snapshot.rules.retain(|r| r.listener != handle);
            }
            ResourceKind::Rule => {
                let before = snapshot.rules.len();
                snapshot.rules.retain(|r| r.handle != handle);
                if snapshot.rules.len() == before {
                    return Err(Error::not_found(kind, handle));
                }
            }
            ResourceKind::TargetGroup => {
                if !self.target_group_exists(handle) {
                    return Err(Error::not_found(kind, handle));
                }
                let snapshot = &mut self.snapshot;
                let referrer = snapshot
                    .listeners
                    .iter()
                    .find(|l| l.spec.default_target_group == handle)
                    .map(|l| l.handle.clone())
                    .or_else(|| {
                        snapshot
                            .rules
                            .iter()
                            .find(|r| r.spec.target_group == handle)
                            .map(|r| r.handle.clone())
                    });
                if let Some(referrer) = referrer {
                    return Err(Error::dependency_blocked(kind, handle, referrer));
                }
                snapshot.target_groups.retain(|tg| tg.handle != handle);
            }
            ResourceKind::TargetGroupBinding => {
                self.target_group_mut(handle)?.targets.clear();
            }
        }
        Ok(())
    }

    fn target_group_mut(&mut self, handle: &str) -> Result<&mut TargetGroupRecord> {
        self.snapshot
            .target_groups
            .iter_mut()
            .find(|tg| tg.handle == handle)
            .ok_or_else(|| Error::not_found(ResourceKind::TargetGroup, handle))
    }
}

fn register(targets: &mut Vec<Target>, added: Vec<Target>) {
    for target in added {
        if !targets.contains(&target) {
            targets.push(target);
        }
    }
}

fn apply_tags(tags: &mut TagSet, changes: TagChanges) {
    for key in &changes.removals {
        tags.remove(key);
    }
    for tag in changes.upserts {
        tags.insert(tag.key, tag.value);
    }
}

fn create_label(request: &CreateRequest) -> String {
    match request {
        CreateRequest::LoadBalancer { spec, .. } => spec.name.clone(),
        CreateRequest::Listener { load_balancer, spec } => format!("{load_balancer}:{}", spec.port),
        CreateRequest::Rule { listener, spec } => format!("{listener}:{}", spec.priority),
        CreateRequest::TargetGroup { spec, .. } => spec.name.clone(),
        CreateRequest::Binding { target_group, .. } => target_group.clone(),
    }
}

/// A provider backed by process memory.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    state: Mutex<State>,
}

impl InMemoryProvider {
    /// Create an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider pre-populated with `snapshot`.
    #[must_use]
    pub fn from_snapshot(snapshot: ProviderSnapshot) -> Self {
        Self {
            state: Mutex::new(State {
                snapshot,
                ..State::default()
            }),
        }
    }

    /// Everything currently stored, across all clusters.
    pub async fn snapshot(&self) -> ProviderSnapshot {
        self.state.lock().await.snapshot.clone()
    }

    /// Every call made so far, in order.
    pub async fn journal(&self) -> Vec<Call> {
        self.state.lock().await.journal.clone()
    }

    /// Successful mutating calls, in order.
    pub async fn mutations(&self) -> Vec<Call> {
        self.state
            .lock()
            .await
            .journal
            .iter()
            .filter(|c| c.succeeded && c.operation != Operation::List)
            .cloned()
            .collect()
    }

    pub async fn clear_journal(&self) {
        self.state.lock().await.journal.clear();
    }

    /// Fail the next `operation` on `kind` (any kind when `None`) with `error`.
    pub async fn inject(&self, operation: Operation, kind: Option<ResourceKind>, error: Error) {
        self.push_fault(operation, kind, error, false).await;
    }

    /// Fail every `operation` on `kind` with `error` until cleared.
    pub async fn inject_persistent(&self, operation: Operation, kind: Option<ResourceKind>, error: Error) {
        self.push_fault(operation, kind, error, true).await;
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    async fn push_fault(&self, operation: Operation, kind: Option<ResourceKind>, error: Error, persistent: bool) {
        self.state.lock().await.faults.push_back(Fault {
            operation,
            kind,
            error,
            persistent,
        });
    }
}

/// Owned by a cluster other than `cluster`.
fn foreign(tags: &TagSet, cluster: &str) -> bool {
    tags.get(CLUSTER_TAG).is_some_and(|owner| owner != cluster)
}

#[async_trait]
impl Provider for InMemoryProvider {
    async fn list(&self, cluster: &str) -> Result<ProviderSnapshot> {
        let mut state = self.state.lock().await;
        if let Some(error) = state.take_fault(Operation::List, None) {
            state.record(Operation::List, None, cluster, false);
            return Err(error);
        }
        state.record(Operation::List, None, cluster, true);

        let mut snapshot = state.snapshot.clone();
        snapshot.load_balancers.retain(|lb| !foreign(&lb.tags, cluster));
        snapshot.target_groups.retain(|tg| !foreign(&tg.tags, cluster));
        let load_balancers = &snapshot.load_balancers;
        snapshot
            .listeners
            .retain(|l| load_balancers.iter().any(|lb| lb.handle == l.load_balancer));
        let listeners = &snapshot.listeners;
        snapshot
            .rules
            .retain(|r| listeners.iter().any(|l| l.handle == r.listener));
        Ok(snapshot)
    }

    async fn create(&self, request: CreateRequest) -> Result<Handle> {
        let kind = request.kind();
        let label = create_label(&request);
        let mut state = self.state.lock().await;
        let result = match state.take_fault(Operation::Create, Some(kind)) {
            Some(error) => Err(error),
            None => state.create(request),
        };
        state.record(Operation::Create, Some(kind), &label, result.is_ok());
        debug!(%kind, target = %label, ok = result.is_ok(), "memory provider create");
        result
    }

    async fn modify(&self, handle: &str, request: ModifyRequest) -> Result<()> {
        let kind = request.change.kind();
        let mut state = self.state.lock().await;
        let result = match state.take_fault(Operation::Modify, Some(kind)) {
            Some(error) => Err(error),
            None => state.modify(handle, request),
        };
        state.record(Operation::Modify, Some(kind), handle, result.is_ok());
        debug!(%kind, %handle, ok = result.is_ok(), "memory provider modify");
        result
    }

    async fn delete(&self, kind: ResourceKind, handle: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let result = match state.take_fault(Operation::Delete, Some(kind)) {
            Some(error) => Err(error),
            None => state.delete(kind, handle),
        };
        state.record(Operation::Delete, Some(kind), handle, result.is_ok());
        debug!(%kind, %handle, ok = result.is_ok(), "memory provider delete");
        result
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::types::{FieldDiff, ListenerSpec, LoadBalancerSpec, Protocol, TargetGroupSpec};

    fn tg_spec(name: &str) -> TargetGroupSpec {
        TargetGroupSpec {
            name: name.into(),
            port: 80,
            protocol: Protocol::Http,
            target_type: Default::default(),
            health_check: Default::default(),
        }
    }

    fn listener_spec(port: u16, target_group: &str) -> ListenerSpec {
        ListenerSpec {
            port,
            protocol: Protocol::Http,
            certificate_arn: None,
            ssl_policy: None,
            default_target_group: target_group.into(),
        }
    }

    async fn seeded() -> (InMemoryProvider, Handle, Handle, Handle) {
        let provider = InMemoryProvider::new();
        let lb = provider
            .create(CreateRequest::LoadBalancer {
                spec: LoadBalancerSpec::named("lb"),
                tags: TagSet::new(),
            })
            .await
            .unwrap();
        let tg = provider
            .create(CreateRequest::TargetGroup {
                spec: tg_spec("tg"),
                tags: TagSet::new(),
            })
            .await
            .unwrap();
        let listener = provider
            .create(CreateRequest::Listener {
                load_balancer: lb.clone(),
                spec: listener_spec(80, &tg),
            })
            .await
            .unwrap();
        (provider, lb, tg, listener)
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let (provider, ..) = seeded().await;
        let err = provider
            .create(CreateRequest::LoadBalancer {
                spec: LoadBalancerSpec::named("lb"),
                tags: TagSet::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_listener_needs_live_load_balancer() {
        let (provider, _, tg, _) = seeded().await;
        let err = provider
            .create(CreateRequest::Listener {
                load_balancer: "arn:missing".into(),
                spec: listener_spec(443, &tg),
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_referenced_target_group_cannot_be_deleted() {
        let (provider, _, tg, listener) = seeded().await;
        let err = provider.delete(ResourceKind::TargetGroup, &tg).await.unwrap_err();
        assert!(matches!(err, Error::DependencyBlocked { .. }));

        provider.delete(ResourceKind::Listener, &listener).await.unwrap();
        provider.delete(ResourceKind::TargetGroup, &tg).await.unwrap();
        assert!(provider.snapshot().await.target_groups.is_empty());
    }

    #[tokio::test]
    async fn test_load_balancer_delete_cascades_to_children() {
        let (provider, lb, ..) = seeded().await;
        provider.delete(ResourceKind::LoadBalancer, &lb).await.unwrap();
        let snapshot = provider.snapshot().await;
        assert!(snapshot.load_balancers.is_empty());
        assert!(snapshot.listeners.is_empty());
        assert_eq!(snapshot.target_groups.len(), 1);
    }

    #[tokio::test]
    async fn test_binding_registers_and_deregisters() {
        let (provider, _, tg, _) = seeded().await;
        provider
            .create(CreateRequest::Binding {
                target_group: tg.clone(),
                targets: vec![Target::new("i-1", 80), Target::new("i-2", 80)],
            })
            .await
            .unwrap();
        provider
            .modify(
                &tg,
                ModifyRequest {
                    diff: FieldDiff::new().changed("targets"),
                    change: Change::Binding {
                        register: vec![Target::new("i-3", 80)],
                        deregister: vec![Target::new("i-1", 80)],
                    },
                },
            )
            .await
            .unwrap();
        let snapshot = provider.snapshot().await;
        let targets = &snapshot.target_groups.first().unwrap().targets;
        assert_eq!(targets, &vec![Target::new("i-2", 80), Target::new("i-3", 80)]);
    }

    #[tokio::test]
    async fn test_one_shot_fault_fires_once() {
        let provider = InMemoryProvider::new();
        provider
            .inject(Operation::Create, Some(ResourceKind::TargetGroup), Error::provider("throttled"))
            .await;
        let request = CreateRequest::TargetGroup {
            spec: tg_spec("tg"),
            tags: TagSet::new(),
        };
        assert!(provider.create(request.clone()).await.is_err());
        assert!(provider.create(request).await.is_ok());

        let journal = provider.journal().await;
        assert_eq!(journal.len(), 2);
        assert!(!journal.first().unwrap().succeeded);
        assert_eq!(provider.mutations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_hides_other_clusters() {
        let provider = InMemoryProvider::new();
        let tags: TagSet = [(CLUSTER_TAG, "other")].into_iter().collect();
        provider
            .create(CreateRequest::LoadBalancer {
                spec: LoadBalancerSpec::named("theirs"),
                tags,
            })
            .await
            .unwrap();
        assert!(provider.list("mine").await.unwrap().is_empty());
        assert_eq!(provider.list("other").await.unwrap().len(), 1);
    }
}
