//! View Registry
//!
//! Declarative description of every materialized view the refresher
//! maintains, validated once at startup. The registry also owns the
//! deterministic build order: views are topologically sorted so that a
//! dependent view is always built after every view its template references.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{RefreshError, RefreshResult};
use crate::template::{QueryTemplate, SubstitutionMode};

/// View classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewKind {
    /// Built directly from source relations or an external service
    Base,
    /// Built from a query template referencing other registered views
    Dependent,
}

/// Partition excluded from every local-union feed (test-network rows)
#[derive(Debug, Clone)]
pub struct PartitionFilter {
    pub column: String,
    pub value: i64,
}

/// How a view's shadow copy is produced
#[derive(Debug, Clone)]
pub enum RefreshStrategy {
    /// Union of a live feed and a static snapshot of the same relation,
    /// deduplicated by identity columns with the live row winning.
    LocalUnion {
        live_source: String,
        static_source: String,
        excluded_partition: PartitionFilter,
    },
    /// Latest tabular result of a fixed external analytics query,
    /// materialized as literal values.
    ExternalFetch { query_id: u64 },
    /// Parameterized query template with upstream references resolved to
    /// shadow relations.
    TemplatedQuery {
        template_path: PathBuf,
        substitution: SubstitutionMode,
    },
}

/// Immutable per-run description of a single view
#[derive(Debug, Clone)]
pub struct ViewDefinition {
    pub name: String,
    pub kind: ViewKind,
    pub schema: String,
    /// Ordered column set that must be unique within the live copy;
    /// may be empty for dependent views, which then skip the index gate.
    pub identity_columns: Vec<String>,
    pub ordering_hint: Option<String>,
    /// Expression summed for the advisory before/after total comparison
    pub amount_expression: Option<String>,
    pub strategy: RefreshStrategy,
}

impl ViewDefinition {
    /// The live relation visible to consumers
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }

    /// The shadow relation built during a run
    pub fn shadow(&self) -> String {
        format!("{}.{}_new", self.schema, self.name)
    }

    /// The demoted relation left behind by a swap
    pub fn demoted(&self) -> String {
        format!("{}.{}_old", self.schema, self.name)
    }
}

/// The full validated view fleet with its build order
#[derive(Debug)]
pub struct Registry {
    views: Vec<ViewDefinition>,
    templates: HashMap<String, QueryTemplate>,
    order: Vec<usize>,
}

impl Registry {
    /// The production view fleet, with dependent-view templates loaded
    /// from `queries_dir`.
    pub fn standard(queries_dir: &Path) -> RefreshResult<Self> {
        Self::assemble(standard_views(queries_dir))
    }

    /// Load templates for every templated view, then validate and order.
    pub fn assemble(views: Vec<ViewDefinition>) -> RefreshResult<Self> {
        let names: Vec<String> = views.iter().map(|v| v.name.clone()).collect();
        let mut templates = HashMap::new();
        for view in &views {
            if let RefreshStrategy::TemplatedQuery { template_path, .. } = &view.strategy {
                // A template never depends on the view it defines.
                let known: Vec<String> = names
                    .iter()
                    .filter(|n| *n != &view.name)
                    .cloned()
                    .collect();
                let template = QueryTemplate::load(template_path, &known)?;
                templates.insert(view.name.clone(), template);
            }
        }
        Self::with_templates(views, templates)
    }

    /// Assemble from pre-parsed templates keyed by view name.
    pub fn with_templates(
        views: Vec<ViewDefinition>,
        templates: HashMap<String, QueryTemplate>,
    ) -> RefreshResult<Self> {
        validate(&views, &templates)?;
        let order = build_order(&views, &templates)?;
        Ok(Self {
            views,
            templates,
            order,
        })
    }

    /// All registered views in declaration order
    pub fn views(&self) -> impl Iterator<Item = &ViewDefinition> {
        self.views.iter()
    }

    /// Views in dependency-safe build order
    pub fn build_order(&self) -> impl Iterator<Item = &ViewDefinition> {
        self.order.iter().map(|&i| &self.views[i])
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    pub fn template(&self, name: &str) -> RefreshResult<&QueryTemplate> {
        self.templates.get(name).ok_or_else(|| {
            RefreshError::Config(format!("no query template loaded for view '{}'", name))
        })
    }

    /// Upstream views referenced by a dependent view's template
    pub fn references(&self, name: &str) -> &[String] {
        self.templates
            .get(name)
            .map(|t| t.references())
            .unwrap_or(&[])
    }
}

fn validate(
    views: &[ViewDefinition],
    templates: &HashMap<String, QueryTemplate>,
) -> RefreshResult<()> {
    let mut seen = HashMap::new();
    for view in views {
        if view.name.is_empty() || view.schema.is_empty() {
            return Err(RefreshError::Config(
                "view definitions require a non-empty name and schema".to_string(),
            ));
        }
        if !is_identifier(&view.name) || !is_identifier(&view.schema) {
            return Err(RefreshError::Config(format!(
                "'{}' is not a valid relation identifier",
                view.qualified()
            )));
        }
        if seen.insert(view.name.as_str(), ()).is_some() {
            return Err(RefreshError::Config(format!(
                "duplicate view definition '{}'",
                view.name
            )));
        }
        match (&view.kind, &view.strategy) {
            (ViewKind::Base, RefreshStrategy::TemplatedQuery { .. }) => {
                return Err(RefreshError::Config(format!(
                    "base view '{}' cannot use a templated query strategy",
                    view.name
                )));
            }
            (ViewKind::Base, _) if view.identity_columns.is_empty() => {
                return Err(RefreshError::Config(format!(
                    "base view '{}' must declare identity columns",
                    view.name
                )));
            }
            (ViewKind::Base, RefreshStrategy::ExternalFetch { query_id }) if *query_id == 0 => {
                return Err(RefreshError::Config(format!(
                    "view '{}' has no external query identifier",
                    view.name
                )));
            }
            (ViewKind::Dependent, RefreshStrategy::TemplatedQuery { .. }) => {
                if !templates.contains_key(&view.name) {
                    return Err(RefreshError::Config(format!(
                        "dependent view '{}' has no loaded query template",
                        view.name
                    )));
                }
            }
            (ViewKind::Dependent, _) => {
                return Err(RefreshError::Config(format!(
                    "dependent view '{}' must use a templated query strategy",
                    view.name
                )));
            }
            _ => {}
        }
    }

    // Every declared reference must name a registered view.
    for (name, template) in templates {
        for referenced in template.references() {
            if !seen.contains_key(referenced.as_str()) {
                return Err(RefreshError::Config(format!(
                    "view '{}' references unknown view '{}'",
                    name, referenced
                )));
            }
        }
    }
    Ok(())
}

/// Kahn-style topological sort, stable with respect to declaration order.
fn build_order(
    views: &[ViewDefinition],
    templates: &HashMap<String, QueryTemplate>,
) -> RefreshResult<Vec<usize>> {
    let index: HashMap<&str, usize> = views
        .iter()
        .enumerate()
        .map(|(i, v)| (v.name.as_str(), i))
        .collect();
    let mut placed = vec![false; views.len()];
    let mut order = Vec::with_capacity(views.len());

    while order.len() < views.len() {
        let mut progressed = false;
        for (i, view) in views.iter().enumerate() {
            if placed[i] {
                continue;
            }
            let deps = templates
                .get(&view.name)
                .map(|t| t.references())
                .unwrap_or(&[]);
            let ready = deps
                .iter()
                .all(|d| index.get(d.as_str()).map(|&j| placed[j]).unwrap_or(true));
            if ready {
                placed[i] = true;
                order.push(i);
                progressed = true;
            }
        }
        if !progressed {
            return Err(RefreshError::Config(
                "dependency cycle detected among registered views".to_string(),
            ));
        }
    }
    Ok(order)
}

pub(crate) fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// The production fleet. Base views mirror the indexer feeds; dependent
/// views are defined by the SQL templates under `queries_dir`.
fn standard_views(queries_dir: &Path) -> Vec<ViewDefinition> {
    const LIVE_SOURCE: &str = "indexer";
    const STATIC_SOURCE: &str = "static_indexer_chain_data_75";
    // Sepolia rows never belong in production views.
    const EXCLUDED_CHAIN_ID: i64 = 11_155_111;

    let local_union = |name: &str,
                       identity: &[&str],
                       ordering: &str,
                       amount: Option<&str>| ViewDefinition {
        name: name.to_string(),
        kind: ViewKind::Base,
        schema: "public".to_string(),
        identity_columns: identity.iter().map(|c| c.to_string()).collect(),
        ordering_hint: Some(ordering.to_string()),
        amount_expression: amount.map(|a| a.to_string()),
        strategy: RefreshStrategy::LocalUnion {
            live_source: LIVE_SOURCE.to_string(),
            static_source: STATIC_SOURCE.to_string(),
            excluded_partition: PartitionFilter {
                column: "chain_id".to_string(),
                value: EXCLUDED_CHAIN_ID,
            },
        },
    };

    let templated = |name: &str,
                     schema: &str,
                     template: &str,
                     substitution: SubstitutionMode,
                     amount: Option<&str>| ViewDefinition {
        name: name.to_string(),
        kind: ViewKind::Dependent,
        schema: schema.to_string(),
        identity_columns: Vec::new(),
        ordering_hint: None,
        amount_expression: amount.map(|a| a.to_string()),
        strategy: RefreshStrategy::TemplatedQuery {
            template_path: queries_dir.join(template),
            substitution,
        },
    };

    vec![
        local_union(
            "applications",
            &["id", "chain_id", "round_id"],
            "id DESC, chain_id DESC, round_id DESC",
            None,
        ),
        local_union(
            "rounds",
            &["id", "chain_id"],
            "id DESC, chain_id DESC",
            Some(
                "total_amount_donated_in_usd + CASE WHEN matching_distribution \
                 IS NOT NULL THEN match_amount_in_usd ELSE 0 END",
            ),
        ),
        local_union("donations", &["id"], "id DESC", Some("amount_in_usd")),
        local_union(
            "applications_payouts",
            &["id"],
            "id DESC",
            Some("amount_in_usd"),
        ),
        local_union(
            "round_roles",
            &["chain_id", "round_id", "address", "role"],
            "chain_id DESC, round_id DESC, address DESC, role DESC",
            None,
        ),
        ViewDefinition {
            name: "allov2_distribution_events_for_leaderboard".to_string(),
            kind: ViewKind::Base,
            schema: "public".to_string(),
            identity_columns: vec!["tx_timestamp".to_string(), "event_signature".to_string()],
            ordering_hint: Some("tx_timestamp DESC, event_signature DESC".to_string()),
            amount_expression: None,
            strategy: RefreshStrategy::ExternalFetch {
                query_id: 4_118_421,
            },
        },
        templated(
            "indexer_matching",
            "public",
            "indexer_matching.sql",
            SubstitutionMode::TokenRewrite,
            Some("match_amount_in_usd"),
        ),
        templated(
            "all_donations",
            "public",
            "all_donations.sql",
            SubstitutionMode::TokenRewrite,
            Some("amount_in_usd"),
        ),
        templated(
            "all_matching",
            "public",
            "all_matching.sql",
            SubstitutionMode::TokenRewrite,
            Some("match_amount_in_usd"),
        ),
        templated(
            "allo_gmv_leaderboard_events",
            "experimental_views",
            "allo_gmv_with_ens.sql",
            SubstitutionMode::CteInjection,
            Some("gmv"),
        ),
    ]
}
