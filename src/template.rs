//! Query template abstraction for dependent views
//!
//! A dependent view is defined by an externally-maintained SQL template.
//! While a refresh run is in flight, the template must read the *shadow*
//! content of every view it references, never the stale live content. The
//! template is parsed once for upstream references, and substitution is
//! driven by an explicit name-to-shadow mapping resolved per run.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{RefreshError, RefreshResult};
use crate::registry::Registry;

/// How upstream references are redirected to shadow relations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstitutionMode {
    /// Rewrite `FROM x` / `JOIN x` tokens to the schema-qualified shadow,
    /// e.g. `FROM schema.x_new`
    TokenRewrite,
    /// Inject `x AS (SELECT * FROM schema.x_new)` aliases at the head of
    /// the query's WITH clause, leaving the template body untouched
    CteInjection,
}

/// Per-run mapping from view name to its shadow relation
#[derive(Debug, Clone, Default)]
pub struct ShadowMap {
    /// view name -> schema hosting it
    entries: HashMap<String, String>,
}

impl ShadowMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_registry(registry: &Registry) -> Self {
        let entries = registry
            .views()
            .map(|v| (v.name.clone(), v.schema.clone()))
            .collect();
        Self { entries }
    }

    pub fn insert(&mut self, name: impl Into<String>, schema: impl Into<String>) {
        self.entries.insert(name.into(), schema.into());
    }

    /// Schema-qualified shadow relation, e.g. `public.donations_new`
    pub fn qualified_shadow(&self, name: &str) -> Option<String> {
        self.entries
            .get(name)
            .map(|schema| format!("{}.{}_new", schema, name))
    }
}

/// A parsed dependent-view query template
#[derive(Debug, Clone)]
pub struct QueryTemplate {
    text: String,
    references: Vec<String>,
}

impl QueryTemplate {
    /// Read and parse a template file, discovering which of `known` view
    /// names it references.
    pub fn load(path: &Path, known: &[String]) -> RefreshResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            RefreshError::Config(format!(
                "cannot read query template {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(text, known)
    }

    /// Parse template text. References are matched as whole relation-name
    /// tokens after FROM/JOIN, so `orders_detail` never counts as a
    /// reference to `orders`.
    pub fn parse(text: String, known: &[String]) -> RefreshResult<Self> {
        let mut references = Vec::new();
        for name in known {
            if relation_token_regex(name)?.is_match(&text) {
                references.push(name.clone());
            }
        }
        Ok(Self { text, references })
    }

    /// Views this template reads, in registry declaration order
    pub fn references(&self) -> &[String] {
        &self.references
    }

    /// Resolve the template so every reference reads shadow content.
    pub fn resolve(&self, mode: SubstitutionMode, shadows: &ShadowMap) -> RefreshResult<String> {
        match mode {
            SubstitutionMode::TokenRewrite => self.rewrite_tokens(shadows),
            SubstitutionMode::CteInjection => self.inject_ctes(shadows),
        }
    }

    fn rewrite_tokens(&self, shadows: &ShadowMap) -> RefreshResult<String> {
        let mut sql = self.text.clone();
        for name in &self.references {
            let shadow = shadows.qualified_shadow(name).ok_or_else(|| {
                RefreshError::Template(format!("no shadow mapping for referenced view '{}'", name))
            })?;
            let re = relation_token_regex(name)?;
            let replacement = format!("${{kw}} {}", shadow);
            sql = re.replace_all(&sql, replacement.as_str()).into_owned();
        }
        Ok(sql)
    }

    fn inject_ctes(&self, shadows: &ShadowMap) -> RefreshResult<String> {
        static WITH_RE: Lazy<Regex> =
            Lazy::new(|| Regex::new(r"(?i)\bWITH\b").expect("static regex"));

        let mut aliases = Vec::new();
        for name in &self.references {
            let qualified = shadows.qualified_shadow(name).ok_or_else(|| {
                RefreshError::Template(format!("no shadow mapping for referenced view '{}'", name))
            })?;
            aliases.push(format!("{} AS (SELECT * FROM {})", name, qualified));
        }
        if aliases.is_empty() {
            return Ok(self.text.clone());
        }
        let alias_block = aliases.join(",\n    ");

        match WITH_RE.find(&self.text) {
            Some(m) => {
                let (head, tail) = self.text.split_at(m.end());
                Ok(format!("{}\n    {},{}", head, alias_block, tail))
            }
            None => Ok(format!("WITH {}\n{}", alias_block, self.text)),
        }
    }
}

/// Matches `FROM <name>` or `JOIN <name>` as whole tokens, case-insensitive
fn relation_token_regex(name: &str) -> RefreshResult<Regex> {
    Regex::new(&format!(
        r"(?i)\b(?P<kw>FROM|JOIN)\s+{}\b",
        regex::escape(name)
    ))
    .map_err(|e| RefreshError::Template(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn known(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn shadows(pairs: &[(&str, &str)]) -> ShadowMap {
        let mut map = ShadowMap::new();
        for (name, schema) in pairs {
            map.insert(*name, *schema);
        }
        map
    }

    #[test]
    fn test_token_rewrite_matches_whole_tokens_only() {
        let template = QueryTemplate::parse(
            "SELECT o.id FROM orders o JOIN orders_detail d ON d.order_id = o.id".to_string(),
            &known(&["orders"]),
        )
        .unwrap();

        let sql = template
            .resolve(SubstitutionMode::TokenRewrite, &shadows(&[("orders", "public")]))
            .unwrap();
        assert_eq!(
            sql,
            "SELECT o.id FROM public.orders_new o JOIN orders_detail d ON d.order_id = o.id"
        );
    }

    #[test]
    fn test_token_rewrite_qualifies_with_the_hosting_schema() {
        let template = QueryTemplate::parse(
            "SELECT * FROM leaderboard_events".to_string(),
            &known(&["leaderboard_events"]),
        )
        .unwrap();

        let sql = template
            .resolve(
                SubstitutionMode::TokenRewrite,
                &shadows(&[("leaderboard_events", "experimental_views")]),
            )
            .unwrap();
        assert_eq!(sql, "SELECT * FROM experimental_views.leaderboard_events_new");
    }

    #[test]
    fn test_token_rewrite_covers_joins_and_is_case_insensitive() {
        let template = QueryTemplate::parse(
            "select * from donations d\nleft join rounds r on r.id = d.round_id".to_string(),
            &known(&["donations", "rounds"]),
        )
        .unwrap();

        let sql = template
            .resolve(
                SubstitutionMode::TokenRewrite,
                &shadows(&[("donations", "public"), ("rounds", "public")]),
            )
            .unwrap();
        assert_eq!(
            sql,
            "select * from public.donations_new d\nleft join public.rounds_new r on r.id = d.round_id"
        );
    }

    #[test]
    fn test_reference_discovery_ignores_prefix_collisions() {
        let template = QueryTemplate::parse(
            "SELECT * FROM orders_detail".to_string(),
            &known(&["orders", "orders_detail"]),
        )
        .unwrap();
        assert_eq!(template.references(), &["orders_detail".to_string()]);
    }

    #[test]
    fn test_cte_injection_after_with() {
        let template = QueryTemplate::parse(
            "WITH totals AS (SELECT round_id, SUM(gmv) FROM donations GROUP BY 1)\n\
             SELECT * FROM totals"
                .to_string(),
            &known(&["donations"]),
        )
        .unwrap();

        let sql = template
            .resolve(SubstitutionMode::CteInjection, &shadows(&[("donations", "public")]))
            .unwrap();
        assert!(sql.starts_with("WITH\n    donations AS (SELECT * FROM public.donations_new),"));
        // The template body is left untouched.
        assert!(sql.contains("totals AS (SELECT round_id, SUM(gmv) FROM donations GROUP BY 1)"));
    }

    #[test]
    fn test_cte_injection_wraps_templates_without_with() {
        let template = QueryTemplate::parse(
            "SELECT * FROM events e".to_string(),
            &known(&["events"]),
        )
        .unwrap();

        let sql = template
            .resolve(
                SubstitutionMode::CteInjection,
                &shadows(&[("events", "experimental_views")]),
            )
            .unwrap();
        assert!(
            sql.starts_with("WITH events AS (SELECT * FROM experimental_views.events_new)")
        );
        assert!(sql.ends_with("SELECT * FROM events e"));
    }

    #[test]
    fn test_resolve_requires_shadow_mapping() {
        let template = QueryTemplate::parse(
            "SELECT * FROM donations".to_string(),
            &known(&["donations"]),
        )
        .unwrap();

        let err = template
            .resolve(SubstitutionMode::TokenRewrite, &ShadowMap::new())
            .unwrap_err();
        assert!(matches!(err, RefreshError::Template(_)));
    }

    #[test]
    fn test_missing_template_file_is_a_config_error() {
        let err = QueryTemplate::load(Path::new("/nonexistent/q.sql"), &known(&[])).unwrap_err();
        assert!(matches!(err, RefreshError::Config(_)));
    }
}
