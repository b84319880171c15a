//! Cleanup
//!
//! Pre-run: drop any `_new` leftovers from a previously failed run, so a
//! crashed refresh is self-healing on the next invocation. Post-run: drop
//! the `_old` copies demoted by the swap. Both use `IF EXISTS` semantics;
//! a missing object is never an error.

use crate::registry::Registry;

/// Drop every view's shadow copy, tolerating absence.
pub fn pre_run_statements(registry: &Registry) -> Vec<String> {
    registry
        .views()
        .map(|view| {
            format!(
                "DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;",
                view.shadow()
            )
        })
        .collect()
}

/// Drop every view's demoted copy, tolerating absence.
pub fn post_run_statements(registry: &Registry) -> Vec<String> {
    registry
        .views()
        .map(|view| {
            format!(
                "DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;",
                view.demoted()
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RefreshStrategy, ViewDefinition, ViewKind};
    use crate::template::{QueryTemplate, SubstitutionMode};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn registry() -> Registry {
        let views = vec![
            ViewDefinition {
                name: "donations".to_string(),
                kind: ViewKind::Base,
                schema: "public".to_string(),
                identity_columns: vec!["id".to_string()],
                ordering_hint: None,
                amount_expression: None,
                strategy: RefreshStrategy::ExternalFetch { query_id: 1 },
            },
            ViewDefinition {
                name: "gmv_events".to_string(),
                kind: ViewKind::Dependent,
                schema: "experimental_views".to_string(),
                identity_columns: Vec::new(),
                ordering_hint: None,
                amount_expression: None,
                strategy: RefreshStrategy::TemplatedQuery {
                    template_path: PathBuf::from("gmv_events.sql"),
                    substitution: SubstitutionMode::TokenRewrite,
                },
            },
        ];
        let mut templates = HashMap::new();
        templates.insert(
            "gmv_events".to_string(),
            QueryTemplate::parse(
                "SELECT * FROM donations".to_string(),
                &["donations".to_string()],
            )
            .unwrap(),
        );
        Registry::with_templates(views, templates).unwrap()
    }

    #[test]
    fn test_pre_run_drops_shadow_copies_in_every_schema() {
        assert_eq!(
            pre_run_statements(&registry()),
            vec![
                "DROP MATERIALIZED VIEW IF EXISTS public.donations_new CASCADE;".to_string(),
                "DROP MATERIALIZED VIEW IF EXISTS experimental_views.gmv_events_new CASCADE;"
                    .to_string(),
            ]
        );
    }

    #[test]
    fn test_post_run_drops_demoted_copies() {
        assert_eq!(
            post_run_statements(&registry()),
            vec![
                "DROP MATERIALIZED VIEW IF EXISTS public.donations_old CASCADE;".to_string(),
                "DROP MATERIALIZED VIEW IF EXISTS experimental_views.gmv_events_old CASCADE;"
                    .to_string(),
            ]
        );
    }
}
