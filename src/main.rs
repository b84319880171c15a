//! viewswap - atomic shadow-swap refresher for PostgreSQL materialized views
//!
//! Rebuilds a fleet of derived views as `<name>_new` shadow copies, gates
//! them behind unique indexes, then promotes the whole fleet to live in a
//! single transaction. Consumers always see either the fully-previous or
//! fully-current version of every view.
//!
//! Configuration comes from the environment (see `config`); the binary is
//! a no-argument entry point intended to run from a scheduler that
//! guarantees one run at a time.

mod cleanup;
mod config;
mod dune;
mod error;
mod indexes;
mod refresh;
mod registry;
mod session;
mod shadow;
mod swap;
mod template;
mod validate;

use std::path::Path;

use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;
use crate::refresh::Refresher;
use crate::registry::Registry;
use crate::validate::TotalDelta;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let settings = Settings::load()?;
    let registry = Registry::standard(Path::new(&settings.refresh.queries_dir))?;
    info!(views = registry.len(), "view registry validated");

    let refresher = Refresher::new(settings, registry);
    match refresher.run().await {
        Ok(report) => {
            for outcome in &report.outcomes {
                debug!(
                    view = %outcome.view,
                    old = ?outcome.old_total,
                    new = ?outcome.new_total,
                    "final totals"
                );
            }
            let regressions = report
                .outcomes
                .iter()
                .filter(|o| matches!(o.delta, Some(TotalDelta::Regressed)))
                .count();
            if regressions > 0 {
                warn!(regressions, "view totals decreased during this run");
            }
            info!(
                run_id = %report.run_id,
                started_at = %report.started_at,
                "total refresh time: {:.2}s",
                report.duration.as_secs_f64()
            );
            Ok(())
        }
        Err(e) => {
            error!("refresh run failed: {}", e);
            Err(e.into())
        }
    }
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,viewswap=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .compact(),
        )
        .init();
}
