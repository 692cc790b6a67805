//! Reconciliation core for ALB ingresses.
//!
//! Each ingress maps to a tree of cloud resources:
//!
//! ```text
//! LoadBalancer ─┬─ Listener ── ListenerRule ──┐
//!               └─ Listener ── (default) ─────┴─▶ TargetGroup ── TargetGroupBinding
//! ```
//!
//! A pass over one ingress:
//!
//! 1. builds the **desired graph** from the ingress input ([`desired`]);
//! 2. builds the **current graph** from a provider listing ([`current`]);
//! 3. **diffs** the two into one graph of per-node verdicts ([`diff`]);
//! 4. orders the verdicts into a dependency DAG of steps ([`plan`]);
//! 5. **converges** by executing the steps against a [`Provider`],
//!    independent branches concurrently ([`converge`]);
//! 6. reports per-node outcomes and status conditions ([`report`]).
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use alb_reconciler::desired::{BackendRef, IngressInput, IngressRule};
//! use alb_reconciler::{InMemoryProvider, ReconcilerBuilder};
//! use tokio_util::sync::CancellationToken;
//!
//! # #[tokio::main]
//! # async fn main() -> alb_core::Result<()> {
//! let reconciler = ReconcilerBuilder::new()
//!     .with_provider(Arc::new(InMemoryProvider::new()))
//!     .cluster_name("prod")
//!     .build()?;
//!
//! let mut ingress = IngressInput::new("shop", "web");
//! ingress.rules.push(IngressRule {
//!     host: Some("shop.example.com".into()),
//!     path: None,
//!     backend: BackendRef::new("web", 80),
//! });
//!
//! let report = reconciler.reconcile(&ingress, &CancellationToken::new()).await?;
//! assert!(report.converged);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod config;
pub mod converge;
pub mod current;
pub mod desired;
pub mod diff;
pub mod graph;
pub mod node;
pub mod plan;
pub mod provider;
pub mod reconciler;
pub mod report;
pub mod types;

// Re-export main types
pub use config::ReconcilerConfig;
pub use converge::{ConvergeSummary, Converger};
pub use desired::{DesiredGraphBuilder, IngressInput};
pub use graph::{IngressGraph, IngressKey, NodeRef};
pub use node::{NodeState, Verdict};
pub use plan::{Plan, Step, StepOp};
pub use provider::{InMemoryProvider, Provider, ProviderSnapshot};
pub use reconciler::{BatchReport, Reconciler, ReconcilerBuilder};
pub use report::{Condition, NodeOutcome, OutcomeStatus, PlanReport, ReconcileReport};
