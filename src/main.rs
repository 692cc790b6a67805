//! # alb-ingress
//!
//! Command-line front end of the ALB ingress reconciler.
//!
//! Ingress definitions are read from JSON, and the provider is an in-memory
//! one seeded from (and saved back to) a JSON state file, so plans and
//! applies can be inspected without a cloud account.
//!
//! Logging goes to stderr and honours `RUST_LOG`.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![deny(clippy::expect_used)]

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    commands::run(Cli::parse()).await
}

/// Initialize tracing subscriber.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
