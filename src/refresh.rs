//! Refresh orchestrator
//!
//! Drives a full run: pre-cleanup, baseline capture, shadow builds in
//! dependency order, the uniqueness gate, the atomic swap, advisory
//! validation, and post-cleanup. Any fatal error aborts the run; safe
//! re-invocation is guaranteed by the idempotent pre-run cleanup.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cleanup;
use crate::config::Settings;
use crate::dune::DuneClient;
use crate::error::{RefreshError, RefreshResult};
use crate::indexes;
use crate::registry::{RefreshStrategy, Registry};
use crate::session::Session;
use crate::shadow;
use crate::swap::{self, RunPhase};
use crate::template::ShadowMap;
use crate::validate::{self, ViewOutcome};

/// Summary of a completed run
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcomes: Vec<ViewOutcome>,
}

/// The refresh orchestrator. One instance per process; `run` performs one
/// full refresh of the registered fleet.
pub struct Refresher {
    settings: Settings,
    registry: Registry,
}

impl Refresher {
    pub fn new(settings: Settings, registry: Registry) -> Self {
        Self { settings, registry }
    }

    pub async fn run(&self) -> RefreshResult<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(%run_id, views = self.registry.len(), "starting refresh run");

        let mut session =
            Session::connect(&self.settings.database, &self.settings.refresh).await?;
        let dune = DuneClient::new(&self.settings.dune)?;

        // Self-healing: remove shadow debris left by a previously failed run.
        session
            .execute_group("pre-run cleanup", &cleanup::pre_run_statements(&self.registry))
            .await?;

        let baselines = validate::capture_baselines(&session, &self.registry).await?;

        let mut phase = RunPhase::Building;
        info!(%run_id, %phase, "building shadow copies");
        let shadows = ShadowMap::from_registry(&self.registry);
        for view in self.registry.build_order() {
            info!(view = %view.name, shadow = %view.shadow(), "building shadow copy");
            let statements = match &view.strategy {
                RefreshStrategy::LocalUnion { .. } => shadow::local_union_statements(view)?,
                RefreshStrategy::ExternalFetch { query_id } => {
                    let table = dune.latest_result(*query_id).await?;
                    shadow::external_fetch_statements(view, &table)?
                }
                RefreshStrategy::TemplatedQuery { .. } => shadow::templated_statements(
                    view,
                    self.registry.template(&view.name)?,
                    &shadows,
                )?,
            };
            session
                .execute_group(&format!("build {}", view.name), &statements)
                .await
                .map_err(|e| RefreshError::Build(view.name.clone(), e.to_string()))?;

            // Uniqueness gate: bad data fails here, before promotion.
            if let Some(index) = indexes::unique_index_statement(view) {
                session
                    .execute_group(&format!("index {}", view.name), &[index])
                    .await
                    .map_err(|e| RefreshError::Build(view.name.clone(), e.to_string()))?;
            }
        }

        phase = phase.next();
        info!(%run_id, %phase, "all shadow copies built and indexed");

        if self.settings.refresh.strict_validation {
            validate::strict_gate(&session, &self.registry, &baselines).await?;
            info!(%run_id, "strict pre-swap validation passed");
        }

        phase = phase.next();
        info!(%run_id, %phase, "performing atomic swap of all views");
        session
            .execute_group("promotion swap", &swap::swap_statements(&self.registry))
            .await
            .map_err(|e| RefreshError::Swap(e.to_string()))?;

        phase = phase.next();
        info!(%run_id, %phase, "all views promoted");
        self.sentinel_check(&session, "post-swap").await;

        let outcomes = validate::compare_after_swap(&session, &self.registry, &baselines).await?;

        phase = phase.next();
        info!(%run_id, %phase, "dropping demoted copies");
        session
            .execute_group("post-run cleanup", &cleanup::post_run_statements(&self.registry))
            .await?;
        self.sentinel_check(&session, "post-cleanup").await;

        phase = phase.next();
        info!(%run_id, %phase, elapsed_secs = start.elapsed().as_secs_f64(), "refresh run complete");

        Ok(RunReport {
            run_id,
            started_at,
            duration: start.elapsed(),
            outcomes,
        })
    }

    /// Best-effort health log for the configured sentinel view.
    async fn sentinel_check(&self, session: &Session, stage: &str) {
        let Some((schema, name)) = &self.settings.refresh.sentinel_view else {
            return;
        };
        match session.matview_exists(schema, name).await {
            Ok(true) => match session.row_count(schema, name).await {
                Ok(rows) => {
                    info!(stage, view = %format!("{}.{}", schema, name), rows, "sentinel view healthy")
                }
                Err(e) => warn!(stage, "sentinel row count failed: {}", e),
            },
            Ok(false) => {
                warn!(stage, view = %format!("{}.{}", schema, name), "sentinel view does not exist")
            }
            Err(e) => warn!(stage, "sentinel existence check failed: {}", e),
        }
    }
}
