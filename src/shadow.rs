//! Shadow Builder
//!
//! Produces the `<name>_new` copy of each view under one of three
//! strategies: a local union of the live and static feeds deduplicated by
//! identity columns, a literal-value materialization of an external
//! analytics result, or a templated query over other views' shadow copies.

use std::cmp::Ordering;

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::dune::FetchedTable;
use crate::error::{RefreshError, RefreshResult};
use crate::registry::{RefreshStrategy, ViewDefinition};
use crate::template::{QueryTemplate, ShadowMap};

/// Key tuple that fixes row order before sequence numbers are assigned
const FETCH_SORT_KEY: [&str; 4] = ["tx_timestamp", "role", "address", "gmv"];

/// Columns hashed (with the sequence number) into `event_signature`
const SIGNATURE_COLUMNS: [&str; 5] = ["tx_timestamp", "tx_hash", "address", "gmv", "role"];

/// Statements building a local-union shadow copy.
///
/// The live feed and the static snapshot carry the same logical entity;
/// when both have a row for one identity, the live row wins. The static
/// snapshot only fills gaps where live data is absent.
pub fn local_union_statements(view: &ViewDefinition) -> RefreshResult<Vec<String>> {
    let (live_source, static_source, partition) = match &view.strategy {
        RefreshStrategy::LocalUnion {
            live_source,
            static_source,
            excluded_partition,
        } => (live_source, static_source, excluded_partition),
        _ => {
            return Err(RefreshError::Config(format!(
                "view '{}' does not use the local-union strategy",
                view.name
            )))
        }
    };

    let identity = view.identity_columns.join(", ");
    let ordering = view
        .ordering_hint
        .as_deref()
        .map(|hint| format!("\nORDER BY {}", hint))
        .unwrap_or_default();

    let select = format!(
        "WITH ranked_data AS (
    SELECT *,
           ROW_NUMBER() OVER (
               PARTITION BY {identity}
               ORDER BY CASE
                   WHEN source = 'live' THEN 1
                   WHEN source = 'static' THEN 2
               END
           ) AS row_num
    FROM (
        (SELECT *, 'live' AS source
         FROM {live}.{name}
         WHERE {column} != {value})
        UNION ALL
        (SELECT *, 'static' AS source
         FROM {static_src}.{name}
         WHERE {column} != {value})
    ) combined_data
)
SELECT * FROM ranked_data WHERE row_num = 1{ordering};",
        identity = identity,
        live = live_source,
        static_src = static_source,
        name = view.name,
        column = partition.column,
        value = partition.value,
        ordering = ordering,
    );

    Ok(vec![
        format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;", view.shadow()),
        format!("CREATE MATERIALIZED VIEW {} AS\n{}", view.shadow(), select),
    ])
}

/// Statements materializing an external fetch result as a literal-value
/// shadow copy.
///
/// Rows are sorted by a fixed key tuple for determinism, numbered, and
/// given a derived `event_signature` identity since the source has no
/// natural primary key.
pub fn external_fetch_statements(
    view: &ViewDefinition,
    table: &FetchedTable,
) -> RefreshResult<Vec<String>> {
    let mut rows: Vec<&serde_json::Map<String, Value>> = table.rows.iter().collect();
    rows.sort_by(|a, b| {
        FETCH_SORT_KEY
            .iter()
            .map(|&key| compare_values(field(a, key), field(b, key)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });

    let mut value_rows = Vec::with_capacity(rows.len());
    for (i, row) in rows.iter().enumerate() {
        let row_number = i + 1;
        let signature = event_signature(row, row_number);
        let mut literals: Vec<String> = table
            .columns
            .iter()
            .map(|column| sql_literal(field(row, column)))
            .collect();
        literals.push(row_number.to_string());
        literals.push(format!("'{}'", signature));
        value_rows.push(format!("({})", literals.join(", ")));
    }

    let mut columns: Vec<String> = table.columns.iter().map(|c| quote_ident(c)).collect();
    columns.push(quote_ident("row_number"));
    columns.push(quote_ident("event_signature"));

    Ok(vec![
        format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;", view.shadow()),
        format!(
            "CREATE MATERIALIZED VIEW {} AS\nSELECT * FROM (\n    VALUES {}\n) AS t({});",
            view.shadow(),
            value_rows.join(",\n           "),
            columns.join(", "),
        ),
    ])
}

/// Statements building a dependent view from its resolved template.
pub fn templated_statements(
    view: &ViewDefinition,
    template: &QueryTemplate,
    shadows: &ShadowMap,
) -> RefreshResult<Vec<String>> {
    let substitution = match &view.strategy {
        RefreshStrategy::TemplatedQuery { substitution, .. } => *substitution,
        _ => {
            return Err(RefreshError::Config(format!(
                "view '{}' does not use the templated-query strategy",
                view.name
            )))
        }
    };

    let query = template.resolve(substitution, shadows)?;
    Ok(vec![
        format!("DROP MATERIALIZED VIEW IF EXISTS {} CASCADE;", view.shadow()),
        format!(
            "CREATE MATERIALIZED VIEW {} AS\n{}",
            view.shadow(),
            query.trim_end().trim_end_matches(';')
        ) + ";",
    ])
}

/// Stable identity for an external row: sha256 over a fixed column
/// subset plus the row's sequence number.
fn event_signature(row: &serde_json::Map<String, Value>, row_number: usize) -> String {
    let mut hasher = Sha256::new();
    for column in SIGNATURE_COLUMNS {
        hasher.update(render_scalar(field(row, column)).as_bytes());
    }
    hasher.update(row_number.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

static NULL: Value = Value::Null;

fn field<'a>(row: &'a serde_json::Map<String, Value>, key: &str) -> &'a Value {
    row.get(key).unwrap_or(&NULL)
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => render_scalar(a).cmp(&render_scalar(b)),
    }
}

/// Plain-text rendering used for sorting fallbacks and signature input
fn render_scalar(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// SQL literal rendering for the VALUES materialization
fn sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", s.replace('\'', "''")),
        other => format!("'{}'", other.to_string().replace('\'', "''")),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PartitionFilter, ViewKind};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::path::PathBuf;

    fn union_view() -> ViewDefinition {
        ViewDefinition {
            name: "donations".to_string(),
            kind: ViewKind::Base,
            schema: "public".to_string(),
            identity_columns: vec!["id".to_string()],
            ordering_hint: Some("id DESC".to_string()),
            amount_expression: Some("amount_in_usd".to_string()),
            strategy: RefreshStrategy::LocalUnion {
                live_source: "indexer".to_string(),
                static_source: "static_indexer_chain_data_75".to_string(),
                excluded_partition: PartitionFilter {
                    column: "chain_id".to_string(),
                    value: 11_155_111,
                },
            },
        }
    }

    fn fetch_view() -> ViewDefinition {
        ViewDefinition {
            name: "allov2_distribution_events_for_leaderboard".to_string(),
            kind: ViewKind::Base,
            schema: "public".to_string(),
            identity_columns: vec!["tx_timestamp".to_string(), "event_signature".to_string()],
            ordering_hint: None,
            amount_expression: None,
            strategy: RefreshStrategy::ExternalFetch { query_id: 4_118_421 },
        }
    }

    fn row(ts: &str, tx_hash: &str, address: &str, gmv: f64, role: &str) -> serde_json::Map<String, Value> {
        json!({
            "tx_timestamp": ts,
            "tx_hash": tx_hash,
            "address": address,
            "gmv": gmv,
            "role": role,
        })
        .as_object()
        .unwrap()
        .clone()
    }

    fn table(rows: Vec<serde_json::Map<String, Value>>) -> FetchedTable {
        FetchedTable {
            columns: vec![
                "tx_timestamp".to_string(),
                "tx_hash".to_string(),
                "address".to_string(),
                "gmv".to_string(),
                "role".to_string(),
            ],
            rows,
        }
    }

    #[test]
    fn test_local_union_ranks_live_feed_over_static() {
        let statements = local_union_statements(&union_view()).unwrap();
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("DROP MATERIALIZED VIEW IF EXISTS public.donations_new"));

        let create = &statements[1];
        assert!(create.contains("CREATE MATERIALIZED VIEW public.donations_new"));
        assert!(create.contains("PARTITION BY id"));
        // Live rows rank first within an identity group, and only the
        // top-ranked row survives.
        assert!(create.contains("WHEN source = 'live' THEN 1"));
        assert!(create.contains("WHEN source = 'static' THEN 2"));
        assert!(create.contains("WHERE row_num = 1"));
        assert!(create.contains("FROM indexer.donations"));
        assert!(create.contains("FROM static_indexer_chain_data_75.donations"));
        assert!(create.contains("ORDER BY id DESC"));
    }

    #[test]
    fn test_local_union_excludes_partition_from_both_feeds() {
        let statements = local_union_statements(&union_view()).unwrap();
        let filters = statements[1].matches("chain_id != 11155111").count();
        assert_eq!(filters, 2);
    }

    #[test]
    fn test_local_union_rejects_other_strategies() {
        let err = local_union_statements(&fetch_view()).unwrap_err();
        assert!(matches!(err, RefreshError::Config(_)));
    }

    #[test]
    fn test_external_fetch_is_deterministic_across_input_order() {
        let a = row("2024-10-01", "0xaa", "0x01", 10.0, "grantee");
        let b = row("2024-10-02", "0xbb", "0x02", 20.0, "donor");
        let c = row("2024-10-02", "0xcc", "0x03", 30.0, "donor");

        let forward = external_fetch_statements(
            &fetch_view(),
            &table(vec![a.clone(), b.clone(), c.clone()]),
        )
        .unwrap();
        let shuffled =
            external_fetch_statements(&fetch_view(), &table(vec![c, a, b])).unwrap();
        assert_eq!(forward, shuffled);
    }

    #[test]
    fn test_event_signature_determinism() {
        let r = row("2024-10-01", "0xaa", "0x01", 10.0, "grantee");
        assert_eq!(event_signature(&r, 1), event_signature(&r.clone(), 1));
        // Sequence position participates in the identity.
        assert_ne!(event_signature(&r, 1), event_signature(&r, 2));
    }

    #[test]
    fn test_external_fetch_adds_sequence_and_signature_columns() {
        let statements = external_fetch_statements(
            &fetch_view(),
            &table(vec![row("2024-10-01", "0xaa", "0x01", 10.0, "grantee")]),
        )
        .unwrap();
        let create = &statements[1];
        assert!(create.contains("\"row_number\", \"event_signature\""));
        assert!(create.contains("VALUES ('2024-10-01', '0xaa', '0x01', 10.0, 'grantee', 1, '"));
    }

    #[test]
    fn test_sql_literal_rendering() {
        assert_eq!(sql_literal(&json!("O'Brien")), "'O''Brien'");
        assert_eq!(sql_literal(&Value::Null), "NULL");
        assert_eq!(sql_literal(&json!(42)), "42");
        assert_eq!(sql_literal(&json!(true)), "TRUE");
    }

    #[test]
    fn test_templated_statements_resolve_references() {
        let view = ViewDefinition {
            name: "all_donations".to_string(),
            kind: ViewKind::Dependent,
            schema: "public".to_string(),
            identity_columns: Vec::new(),
            ordering_hint: None,
            amount_expression: Some("amount_in_usd".to_string()),
            strategy: RefreshStrategy::TemplatedQuery {
                template_path: PathBuf::from("all_donations.sql"),
                substitution: crate::template::SubstitutionMode::TokenRewrite,
            },
        };
        let template = QueryTemplate::parse(
            "SELECT * FROM donations d".to_string(),
            &["donations".to_string()],
        )
        .unwrap();
        let mut shadows = ShadowMap::new();
        shadows.insert("donations", "public");

        let statements = templated_statements(&view, &template, &shadows).unwrap();
        assert!(statements[1].contains("CREATE MATERIALIZED VIEW public.all_donations_new"));
        assert!(statements[1].contains("FROM public.donations_new d"));
    }
}
