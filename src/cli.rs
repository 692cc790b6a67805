//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// ALB ingress reconciler
#[derive(Parser, Debug)]
#[command(name = "alb-ingress")]
#[command(version)]
#[command(about = "Reconcile ingress definitions into ALB resource trees")]
#[command(
    long_about = "Builds the desired load balancer, listener, rule and target group tree for each ingress, \
                  diffs it against a provider state file and converges the state towards it."
)]
pub struct Cli {
    /// Reconciler configuration file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Cluster name, overriding the configuration
    #[arg(long, global = true)]
    pub cluster: Option<String>,

    /// Print reports as JSON
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the steps a reconcile would take, without changing anything
    Plan {
        /// Ingress definition file (JSON object or array)
        #[arg(short, long)]
        ingress: PathBuf,

        /// Provider state file (JSON); empty when missing
        #[arg(short, long)]
        state: Option<PathBuf>,
    },

    /// Converge the provider state towards the ingress definitions
    Apply {
        /// Ingress definition file (JSON object or array)
        #[arg(short, long)]
        ingress: PathBuf,

        /// Provider state file (JSON); empty when missing
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Where to write the resulting state; defaults to --state
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also delete resources of ingresses absent from the file,
        /// unless the configuration disables orphan deletion
        #[arg(long, default_value_t = false)]
        prune: bool,
    },

    /// Delete every resource of one ingress
    Delete {
        /// Ingress namespace
        #[arg(short, long)]
        namespace: String,

        /// Ingress name
        #[arg(long)]
        name: String,

        /// Provider state file (JSON)
        #[arg(short, long)]
        state: PathBuf,

        /// Where to write the resulting state; defaults to --state
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
