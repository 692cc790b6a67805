//! Command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use alb_reconciler::{
    InMemoryProvider, IngressInput, IngressKey, PlanReport, ProviderSnapshot, ReconcileReport,
    Reconciler, ReconcilerConfig,
};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

/// One ingress or a list of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum IngressFile {
    Many(Vec<IngressInput>),
    One(Box<IngressInput>),
}

fn load_config(cli: &Cli) -> Result<ReconcilerConfig> {
    let config = match &cli.config {
        Some(path) => ReconcilerConfig::from_file(path)?,
        None => ReconcilerConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(cluster) = &cli.cluster {
        config.cluster_name.clone_from(cluster);
    }
    config.validate()?;
    Ok(config)
}

fn load_ingresses(path: &Path) -> Result<Vec<IngressInput>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read ingress file {}", path.display()))?;
    let parsed: IngressFile = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse ingress file {}", path.display()))?;
    Ok(match parsed {
        IngressFile::Many(inputs) => inputs,
        IngressFile::One(input) => vec![*input],
    })
}

fn load_state(path: Option<&Path>) -> Result<ProviderSnapshot> {
    match path {
        Some(path) if path.exists() => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read state file {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("Failed to parse state file {}", path.display()))
        }
        Some(path) => {
            info!(path = %path.display(), "State file missing, starting empty");
            Ok(ProviderSnapshot::default())
        }
        None => Ok(ProviderSnapshot::default()),
    }
}

async fn save_state(provider: &InMemoryProvider, path: Option<&PathBuf>) -> Result<()> {
    let Some(path) = path else {
        return Ok(());
    };
    let snapshot = provider.snapshot().await;
    let text = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, text).with_context(|| format!("Failed to write state file {}", path.display()))?;
    info!(path = %path.display(), resources = snapshot.len(), "State written");
    Ok(())
}

/// Cancel `token` on Ctrl-C so in-flight passes stop dispatching.
fn cancel_on_interrupt(token: &CancellationToken) {
    let token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight calls");
            token.cancel();
        }
    });
}

/// Run the parsed command.
pub async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;
    let json = cli.json;

    match cli.command {
        Commands::Plan { ingress, state } => {
            let provider = Arc::new(InMemoryProvider::from_snapshot(load_state(state.as_deref())?));
            let reconciler = Reconciler::new(provider, config);
            for input in load_ingresses(&ingress)? {
                let plan = reconciler.plan(&input).await?;
                print_plan(&plan, json)?;
            }
            Ok(())
        }
        Commands::Apply {
            ingress,
            state,
            output,
            prune,
        } => {
            let provider = Arc::new(InMemoryProvider::from_snapshot(load_state(state.as_deref())?));
            let config = ReconcilerConfig {
                delete_orphans: prune && config.delete_orphans,
                ..config
            };
            let reconciler = Reconciler::new(provider.clone(), config);
            let inputs = load_ingresses(&ingress)?;

            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);
            let batch = reconciler.reconcile_all(&inputs, &cancel).await?;

            for (key, error) in &batch.rejected {
                warn!(ingress = %key, %error, "Ingress rejected");
            }
            for report in &batch.reports {
                print_report(report, json)?;
            }
            save_state(&provider, output.as_ref().or(state.as_ref())).await?;

            if !batch.rejected.is_empty() || batch.reports.iter().any(|r| !r.all_succeeded()) {
                bail!("reconciliation finished with errors");
            }
            Ok(())
        }
        Commands::Delete {
            namespace,
            name,
            state,
            output,
        } => {
            let provider = Arc::new(InMemoryProvider::from_snapshot(load_state(Some(state.as_path()))?));
            let reconciler = Reconciler::new(provider.clone(), config);
            let cancel = CancellationToken::new();
            cancel_on_interrupt(&cancel);

            let report = reconciler
                .reconcile_deleted(&IngressKey::new(namespace, name), &cancel)
                .await?;
            print_report(&report, json)?;
            save_state(&provider, Some(output.as_ref().unwrap_or(&state))).await?;

            if !report.all_succeeded() {
                bail!("deletion finished with errors");
            }
            Ok(())
        }
    }
}

fn print_plan(plan: &PlanReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(plan)?);
        return Ok(());
    }
    if plan.is_empty() {
        println!("{}: up to date", plan.ingress);
        return Ok(());
    }
    println!("{}: {} step(s)", plan.ingress, plan.steps.len());
    for step in &plan.steps {
        println!("  {step}");
    }
    Ok(())
}

fn print_report(report: &ReconcileReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!(
        "{}: {} ({} applied, {} failed, {} deferred)",
        report.ingress,
        if report.converged { "converged" } else { "not converged" },
        report.applied(),
        report.failed(),
        report.deferred(),
    );
    if report.should_requeue() {
        println!("  re-run to retry the remaining changes");
    }
    for outcome in report.outcomes.iter().filter(|o| o.error.is_some()) {
        println!(
            "  {} '{}': {}",
            outcome.kind,
            outcome.id,
            outcome.error.as_deref().unwrap_or_default()
        );
    }
    Ok(())
}
