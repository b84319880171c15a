//! Index Builder
//!
//! Integrity gate for the refresh: each shadow copy with declared identity
//! columns gets a unique index before the swap examines it. If the freshly
//! built data violates uniqueness, index creation fails and the run aborts
//! with nothing promoted.

use crate::registry::ViewDefinition;

/// Unique-index statement for a view's shadow copy, or `None` when the
/// view declares no identity columns.
///
/// The index is created under the shadow name (`<name>_new_idx`); the swap
/// transaction renames it to `<name>_idx` together with the relation, so
/// the live copy always carries the canonical index name.
pub fn unique_index_statement(view: &ViewDefinition) -> Option<String> {
    if view.identity_columns.is_empty() {
        return None;
    }
    Some(format!(
        "CREATE UNIQUE INDEX {name}_new_idx ON {shadow} ({columns});",
        name = view.name,
        shadow = view.shadow(),
        columns = view.identity_columns.join(", "),
    ))
}
