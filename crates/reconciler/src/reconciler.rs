//! Reconciler implementation.

use std::collections::BTreeSet;
use std::sync::Arc;

use alb_core::{Error, Result};
use futures::StreamExt;
use futures::stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ReconcilerConfig;
use crate::converge::Converger;
use crate::current::{CurrentGraphs, build_current_graphs};
use crate::desired::{DesiredGraphBuilder, IngressInput};
use crate::diff::{diff, rediff};
use crate::graph::{IngressGraph, IngressKey};
use crate::plan::Plan;
use crate::provider::Provider;
use crate::report::{NodeOutcome, PlanReport, ReconcileReport};

/// Results of reconciling a batch of ingresses.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// One report per ingress that got as far as converging, orphans included.
    pub reports: Vec<ReconcileReport>,
    /// Ingresses rejected before any provider call.
    pub rejected: Vec<(IngressKey, Error)>,
}

impl BatchReport {
    #[must_use]
    pub fn report(&self, key: &IngressKey) -> Option<&ReconcileReport> {
        self.reports.iter().find(|r| &r.ingress == key)
    }

    /// Every ingress converged and none was rejected.
    #[must_use]
    pub fn all_converged(&self) -> bool {
        self.rejected.is_empty() && self.reports.iter().all(|r| r.converged)
    }
}

/// Reconciles ingresses against a provider.
pub struct Reconciler {
    /// Cloud provider.
    provider: Arc<dyn Provider>,
    /// Configuration.
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(provider: Arc<dyn Provider>, config: ReconcilerConfig) -> Self {
        Self { provider, config }
    }

    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn desired_builder(&self) -> DesiredGraphBuilder {
        DesiredGraphBuilder::new(&self.config.cluster_name)
            .default_idle_timeout(self.config.default_idle_timeout_secs)
    }

    fn converger(&self) -> Converger {
        Converger::new(Arc::clone(&self.provider), self.config.max_concurrent_calls)
    }

    async fn current_graphs(&self, live: Option<&BTreeSet<IngressKey>>) -> Result<CurrentGraphs> {
        let snapshot = self.provider.list(&self.config.cluster_name).await?;
        debug!(resources = snapshot.len(), "listed provider resources");
        Ok(build_current_graphs(&snapshot, &self.config.cluster_name, live))
    }

    /// Compute what a reconcile of `input` would do, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid input, any error from the
    /// provider listing, or [`Error::DependencyBlocked`] if the steps cannot
    /// be ordered.
    #[instrument(skip_all, fields(ingress = %input.key()))]
    pub async fn plan(&self, input: &IngressInput) -> Result<PlanReport> {
        let desired = self.desired_builder().build(input)?;
        let current = self.current_graphs(None).await?.take(&input.key());
        let graph = diff(desired, current);
        let plan = Plan::build(&graph);

        Ok(PlanReport {
            ingress: graph.ingress.clone(),
            outcomes: graph.nodes().into_iter().map(NodeOutcome::of).collect(),
            steps: plan.ordered_steps()?,
        })
    }

    /// Drive the resources of `input` towards its desired state.
    ///
    /// Per-node failures are reported in the returned report, not as an
    /// error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid input (before any provider
    /// call) or any error from the provider listing.
    #[instrument(skip_all, fields(ingress = %input.key()))]
    pub async fn reconcile(&self, input: &IngressInput, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let desired = self.desired_builder().build(input)?;
        let current = self.current_graphs(None).await?.take(&input.key());
        Ok(self.converge(desired, current, cancel).await)
    }

    /// Delete every resource owned by the removed ingress `key`.
    ///
    /// # Errors
    ///
    /// Returns any error from the provider listing.
    #[instrument(skip_all, fields(ingress = %key))]
    pub async fn reconcile_deleted(&self, key: &IngressKey, cancel: &CancellationToken) -> Result<ReconcileReport> {
        let mut current = self.current_graphs(None).await?.take(key);
        current.orphaned = true;
        Ok(self
            .converge(IngressGraph::empty(key.clone()), current, cancel)
            .await)
    }

    /// Reconcile every ingress in `inputs` and, when enabled, delete
    /// resources of ingresses not among them.
    ///
    /// Ingresses are independent: one failing or being rejected does not
    /// stop the others.
    ///
    /// # Errors
    ///
    /// Returns any error from the provider listing.
    #[instrument(skip_all, fields(ingresses = inputs.len()))]
    pub async fn reconcile_all(&self, inputs: &[IngressInput], cancel: &CancellationToken) -> Result<BatchReport> {
        let live: BTreeSet<IngressKey> = inputs.iter().map(IngressInput::key).collect();
        let mut current = self.current_graphs(Some(&live)).await?;
        let mut batch = BatchReport::default();

        info!(
            ingresses = inputs.len(),
            discovered = current.graphs.len(),
            "Starting reconciliation"
        );

        let mut jobs = Vec::new();
        for input in inputs {
            let key = input.key();
            match self.desired_builder().build(input) {
                Ok(desired) => jobs.push((desired, current.take(&key))),
                Err(error) => {
                    warn!(ingress = %key, %error, "rejected ingress");
                    batch.rejected.push((key, error));
                }
            }
        }

        let orphans: Vec<IngressGraph> = std::mem::take(&mut current.graphs)
            .into_values()
            .filter(|graph| graph.orphaned)
            .collect();
        if self.config.delete_orphans {
            for orphan in orphans {
                info!(ingress = %orphan.ingress, "deleting resources of removed ingress");
                jobs.push((IngressGraph::empty(orphan.ingress.clone()), orphan));
            }
        } else if !orphans.is_empty() {
            debug!(count = orphans.len(), "leaving orphaned resources in place");
        }

        let reports: Vec<ReconcileReport> = stream::iter(jobs)
            .map(|(desired, current)| self.converge(desired, current, cancel))
            .buffer_unordered(self.config.max_concurrent_ingresses.max(1))
            .collect()
            .await;
        batch.reports = reports;
        batch.reports.sort_by(|a, b| a.ingress.cmp(&b.ingress));

        info!(
            converged = batch.reports.iter().filter(|r| r.converged).count(),
            rejected = batch.rejected.len(),
            "Reconciliation complete"
        );
        Ok(batch)
    }

    async fn converge(&self, desired: IngressGraph, current: IngressGraph, cancel: &CancellationToken) -> ReconcileReport {
        let mut graph = diff(desired, current);
        if graph.is_converged() {
            debug!(ingress = %graph.ingress, "already converged");
        }

        let summary = self.converger().converge(&mut graph, cancel).await;
        let mut report = ReconcileReport::from_graph(&graph, summary);

        graph.prune();
        rediff(&mut graph);
        report.converged = graph.is_converged();

        if report.converged {
            info!(ingress = %report.ingress, applied = report.applied(), "Ingress converged");
        } else {
            info!(
                ingress = %report.ingress,
                applied = report.applied(),
                failed = report.failed(),
                deferred = report.deferred(),
                requeue = report.should_requeue(),
                "Ingress not yet converged"
            );
        }
        report
    }
}

/// Builder for [`Reconciler`].
#[derive(Default)]
pub struct ReconcilerBuilder {
    provider: Option<Arc<dyn Provider>>,
    config: ReconcilerConfig,
}

impl ReconcilerBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Set the configuration.
    #[must_use]
    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the cluster name.
    #[must_use]
    pub fn cluster_name(mut self, name: impl Into<String>) -> Self {
        self.config.cluster_name = name.into();
        self
    }

    /// Set max concurrent provider calls per ingress.
    #[must_use]
    pub const fn max_concurrent_calls(mut self, max: usize) -> Self {
        self.config.max_concurrent_calls = max;
        self
    }

    /// Enable/disable orphan deletion.
    #[must_use]
    pub const fn delete_orphans(mut self, enabled: bool) -> Self {
        self.config.delete_orphans = enabled;
        self
    }

    /// Build the reconciler.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no provider was set or the configuration
    /// is invalid.
    pub fn build(self) -> Result<Reconciler> {
        let provider = self
            .provider
            .ok_or_else(|| Error::config("a provider is required"))?;
        self.config.validate()?;
        Ok(Reconciler::new(provider, self.config))
    }
}
