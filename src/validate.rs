//! Validator
//!
//! Captures a per-view baseline total before building and compares it with
//! the post-swap total. The domain expectation is monotonic accumulation,
//! so a decrease signals probable data loss upstream and is logged as a
//! warning. The comparison runs after the promotion has already committed
//! and is strictly advisory; the optional strict gate instead checks the
//! shadow copies before promotion and aborts on regression.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::error::{RefreshError, RefreshResult};
use crate::registry::Registry;
use crate::session::Session;

/// Direction of a view's total between two runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TotalDelta {
    Regressed,
    Unchanged,
    Grew,
}

pub fn classify(old_total: f64, new_total: f64) -> TotalDelta {
    if new_total < old_total {
        TotalDelta::Regressed
    } else if new_total > old_total {
        TotalDelta::Grew
    } else {
        TotalDelta::Unchanged
    }
}

/// Per-view validation result for the run report
#[derive(Debug, Clone)]
pub struct ViewOutcome {
    pub view: String,
    pub old_total: Option<f64>,
    pub new_total: Option<f64>,
    pub delta: Option<TotalDelta>,
}

/// Sum each view's amount expression over its current live copy. An
/// absent live copy yields no baseline, not an error.
pub async fn capture_baselines(
    session: &Session,
    registry: &Registry,
) -> RefreshResult<HashMap<String, Option<f64>>> {
    let mut baselines = HashMap::new();
    for view in registry.views() {
        let Some(expression) = &view.amount_expression else {
            continue;
        };
        let total = session.sum_total(&view.qualified(), expression).await?;
        match total {
            Some(total) => info!(view = %view.name, total, "captured baseline total"),
            None => info!(view = %view.name, "no baseline (live copy absent)"),
        }
        baselines.insert(view.name.clone(), total);
    }
    Ok(baselines)
}

/// Recompute totals over the promoted live copies and log the comparison.
/// Never aborts: the swap has already committed.
pub async fn compare_after_swap(
    session: &Session,
    registry: &Registry,
    baselines: &HashMap<String, Option<f64>>,
) -> RefreshResult<Vec<ViewOutcome>> {
    let mut outcomes = Vec::new();
    for view in registry.views() {
        let Some(expression) = &view.amount_expression else {
            continue;
        };
        let new_total = session.sum_total(&view.qualified(), expression).await?;
        let old_total = baselines.get(&view.name).copied().flatten();

        let delta = match (old_total, new_total) {
            (Some(old), Some(new)) => {
                let delta = classify(old, new);
                match delta {
                    TotalDelta::Regressed => warn!(
                        view = %view.name,
                        old, new, "total amount has decreased"
                    ),
                    TotalDelta::Grew => info!(
                        view = %view.name,
                        old, new, "total amount has increased"
                    ),
                    TotalDelta::Unchanged => info!(
                        view = %view.name,
                        total = new, "total amount remains unchanged"
                    ),
                }
                Some(delta)
            }
            _ => {
                info!(view = %view.name, ?new_total, "no baseline comparison available");
                None
            }
        };

        outcomes.push(ViewOutcome {
            view: view.name.clone(),
            old_total,
            new_total,
            delta,
        });
    }
    Ok(outcomes)
}

/// Stricter alternative run before the swap: compare baselines against the
/// shadow copies and abort the run on any regression.
pub async fn strict_gate(
    session: &Session,
    registry: &Registry,
    baselines: &HashMap<String, Option<f64>>,
) -> RefreshResult<()> {
    for view in registry.views() {
        let Some(expression) = &view.amount_expression else {
            continue;
        };
        let Some(Some(baseline)) = baselines.get(&view.name) else {
            continue;
        };
        let shadow_total = session
            .sum_total(&view.shadow(), expression)
            .await?
            .unwrap_or(0.0);
        if shadow_total < *baseline {
            return Err(RefreshError::Validation(format!(
                "total for '{}' would decrease {} -> {}",
                view.name, baseline, shadow_total
            )));
        }
    }
    Ok(())
}
