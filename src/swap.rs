//! Swap Coordinator
//!
//! Promotes every shadow copy to live status in one transaction. The
//! statement group demotes the current live copy to `<name>_old` and
//! renames `<name>_new` into its place for the whole fleet at once, so an
//! external reader never observes a half-refreshed set of views. If any
//! statement fails, the database rolls back every rename.

use std::fmt;

use crate::registry::Registry;

/// Phases of a refresh run, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Building,
    Built,
    Swapping,
    Swapped,
    CleaningUp,
    Done,
}

impl RunPhase {
    pub fn next(self) -> RunPhase {
        match self {
            RunPhase::Building => RunPhase::Built,
            RunPhase::Built => RunPhase::Swapping,
            RunPhase::Swapping => RunPhase::Swapped,
            RunPhase::Swapped => RunPhase::CleaningUp,
            RunPhase::CleaningUp | RunPhase::Done => RunPhase::Done,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Building => "building",
            RunPhase::Built => "built",
            RunPhase::Swapping => "swapping",
            RunPhase::Swapped => "swapped",
            RunPhase::CleaningUp => "cleaning-up",
            RunPhase::Done => "done",
        };
        f.write_str(s)
    }
}

/// The single-transaction promotion group for the whole fleet.
///
/// Per view: drop any leftover demoted copy, demote the current live copy
/// (if present) together with its unique index, then promote the shadow
/// copy and its index. Index renames keep the canonical `<name>_idx` name
/// on whatever relation is currently live.
pub fn swap_statements(registry: &Registry) -> Vec<String> {
    let mut statements = Vec::new();
    for view in registry.views() {
        statements.push(format!(
            "DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;",
            view.demoted()
        ));
        statements.push(format!(
            "ALTER MATERIALIZED VIEW IF EXISTS {} RENAME TO {}_old;",
            view.qualified(),
            view.name
        ));
        if !view.identity_columns.is_empty() {
            statements.push(format!(
                "ALTER INDEX IF EXISTS {}.{}_idx RENAME TO {}_old_idx;",
                view.schema, view.name, view.name
            ));
        }
        statements.push(format!(
            "ALTER MATERIALIZED VIEW {} RENAME TO {};",
            view.shadow(),
            view.name
        ));
        if !view.identity_columns.is_empty() {
            statements.push(format!(
                "ALTER INDEX IF EXISTS {}.{}_new_idx RENAME TO {}_idx;",
                view.schema, view.name, view.name
            ));
        }
    }
    statements
}
