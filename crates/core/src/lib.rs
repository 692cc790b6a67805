//! Core types shared by the ALB ingress reconciler.
//!
//! - [`Error`]: the reconciliation error taxonomy
//! - [`TagSet`]: order-independent resource tags and ownership markers
//! - [`naming`]: deterministic resource names and child identities
//! - [`ResourceKind`]: the levels of the load-balancer resource tree

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod kind;
pub mod naming;
pub mod result;
pub mod tags;

pub use error::Error;
pub use kind::ResourceKind;
pub use result::{Result, ResultExt};
pub use tags::{Tag, TagChanges, TagSet};
