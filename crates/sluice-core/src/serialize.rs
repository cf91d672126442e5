//! Conversion of runtime values into transmission-safe shapes, plus result
//! extraction over a whole namespace.
//!
//! Every value is classified exactly once into the closed
//! [`SerializedValue`] set; downstream code switches on the tag and never
//! probes shapes again. Chart identity is pointer identity: two names bound
//! to the same underlying chart yield one entry, keyed by the
//! highest-priority name. `Missing` and `Null` both collapse to the single
//! transmission null.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Value as Json};
use sluice_script::{ChartSpec, Namespace, RuntimeValue, SerializedValue, Table};

/// Payload-bounding knobs.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, Serialize)]
#[serde(default)]
pub struct SerializeConfig {
    /// Tables are sampled to this many rows; `total_rows` still reports the
    /// full count.
    pub table_row_limit: usize,
}

impl Default for SerializeConfig {
    fn default() -> Self {
        Self {
            table_row_limit: 100,
        }
    }
}

/// Names that win chart-identity dedup, most preferred first.
const CHART_NAME_PRIORITY: [&str; 6] = ["fig", "figure", "plot", "chart", "result", "output"];

/// Names scanned, in order, for the turn's primary result.
const PRIMARY_PRIORITY: [&str; 5] = ["result", "output", "summary", "analysis", "answer"];

/// Serialized bindings of one execution, in namespace insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSet {
    pub values: IndexMap<String, SerializedValue>,
    /// Name of the primary result binding, when one qualified.
    pub primary: Option<String>,
}

impl ResultSet {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Classify one runtime value. Idempotent: an already-serialized value is
/// returned as-is.
pub fn serialize_value(value: &RuntimeValue, config: &SerializeConfig) -> SerializedValue {
    match value {
        RuntimeValue::Serialized(done) => done.clone(),
        RuntimeValue::Null | RuntimeValue::Missing => SerializedValue::Null,
        RuntimeValue::Float(v) if !v.is_finite() => SerializedValue::Null,
        RuntimeValue::Table(table) => serialize_table(table, config),
        RuntimeValue::Chart(spec) => serialize_chart(spec),
        other => match to_json(other) {
            Ok(value) => SerializedValue::Scalar { value },
            Err(type_name) => SerializedValue::Unrepresentable { type_name },
        },
    }
}

/// Serialize a whole namespace: chart dedup, then per-value classification,
/// then the primary-result scan.
pub fn extract_results(namespace: &Namespace, config: &SerializeConfig) -> ResultSet {
    // Group chart bindings by pointer identity and pick each group's
    // winning name.
    let mut chart_groups: Vec<(*const ChartSpec, Vec<&str>)> = Vec::new();
    for (name, value) in namespace.iter() {
        if let RuntimeValue::Chart(spec) = value {
            let ptr = Arc::as_ptr(spec);
            match chart_groups.iter_mut().find(|(p, _)| *p == ptr) {
                Some((_, names)) => names.push(name),
                None => chart_groups.push((ptr, vec![name])),
            }
        }
    }
    let winners: Vec<(*const ChartSpec, &str)> = chart_groups
        .iter()
        .map(|(ptr, names)| (*ptr, pick_chart_name(names)))
        .collect();

    let mut values = IndexMap::new();
    for (name, value) in namespace.iter() {
        if let RuntimeValue::Chart(spec) = value {
            let ptr = Arc::as_ptr(spec);
            let winner = winners
                .iter()
                .find(|(p, _)| *p == ptr)
                .map(|(_, n)| *n)
                .unwrap_or(name.as_str());
            if winner != name {
                continue; // alias of a chart already emitted under its winner
            }
        }
        values.insert(name.clone(), serialize_value(value, config));
    }

    let primary = PRIMARY_PRIORITY.iter().find_map(|name| {
        if values
            .get(*name)
            .is_some_and(|v| !matches!(v, SerializedValue::Null))
        {
            return Some((*name).to_string());
        }
        // A chart alias that deduped away still qualifies; it resolves to
        // the entry emitted under its winning name.
        chart_groups
            .iter()
            .find(|(_, names)| names.iter().any(|n| n == name))
            .and_then(|(ptr, _)| winners.iter().find(|(p, _)| p == ptr))
            .map(|(_, winner)| (*winner).to_string())
    });

    ResultSet { values, primary }
}

/// Priority rank first, then binding order.
fn pick_chart_name<'a>(names: &[&'a str]) -> &'a str {
    let rank = |name: &str| {
        CHART_NAME_PRIORITY
            .iter()
            .position(|p| *p == name)
            .unwrap_or(usize::MAX)
    };
    names
        .iter()
        .min_by_key(|name| rank(name))
        .copied()
        .unwrap_or("")
}

fn serialize_table(table: &Table, config: &SerializeConfig) -> SerializedValue {
    let rows = table
        .rows
        .iter()
        .take(config.table_row_limit)
        .map(|row| {
            table
                .columns
                .iter()
                .zip(row.iter())
                .map(|(col, cell)| (col.clone(), cell_to_json(cell)))
                .collect::<IndexMap<String, Json>>()
        })
        .collect();
    SerializedValue::Table {
        columns: table.columns.clone(),
        rows,
        total_rows: table.len(),
    }
}

fn serialize_chart(spec: &ChartSpec) -> SerializedValue {
    let spec_json = json!({
        "kind": spec.kind,
        "title": spec.title,
        "x": spec.x.iter().map(cell_to_json).collect::<Vec<_>>(),
        "y": spec.y.iter().map(cell_to_json).collect::<Vec<_>>(),
    });
    let markup = format!(
        "<figure class=\"sluice-chart\" data-spec=\"{}\"></figure>",
        html_escape(&spec_json.to_string())
    );
    SerializedValue::Chart {
        spec: spec_json,
        markup,
    }
}

/// Cell conversion: absent and non-finite both become JSON null; nested
/// charts/tables inside a cell degrade to null rather than ballooning the
/// payload.
fn cell_to_json(value: &RuntimeValue) -> Json {
    to_json(value).unwrap_or(Json::Null)
}

/// Strict conversion for scalar classification: a nested chart or table
/// makes the whole value unrepresentable.
fn to_json(value: &RuntimeValue) -> Result<Json, String> {
    match value {
        RuntimeValue::Int(v) => Ok(json!(v)),
        RuntimeValue::Float(v) => {
            if v.is_finite() {
                Ok(json!(v))
            } else {
                Ok(Json::Null)
            }
        }
        RuntimeValue::Bool(v) => Ok(json!(v)),
        RuntimeValue::Str(s) => Ok(json!(s)),
        RuntimeValue::Null | RuntimeValue::Missing => Ok(Json::Null),
        RuntimeValue::List(items) => items
            .iter()
            .map(to_json)
            .collect::<Result<Vec<_>, _>>()
            .map(Json::Array),
        RuntimeValue::Map(entries) => {
            let mut out = serde_json::Map::new();
            for (key, item) in entries {
                out.insert(key.clone(), to_json(item)?);
            }
            Ok(Json::Object(out))
        }
        RuntimeValue::Table(_) | RuntimeValue::Chart(_) | RuntimeValue::Serialized(_) => {
            Err(value.type_name().to_string())
        }
    }
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SerializeConfig {
        SerializeConfig::default()
    }

    fn chart() -> Arc<ChartSpec> {
        Arc::new(ChartSpec {
            kind: "bar".into(),
            title: None,
            x: vec![RuntimeValue::Str("a".into())],
            y: vec![RuntimeValue::Int(1)],
        })
    }

    #[test]
    fn test_missing_and_null_collapse() {
        assert_eq!(serialize_value(&RuntimeValue::Null, &cfg()), SerializedValue::Null);
        assert_eq!(
            serialize_value(&RuntimeValue::Missing, &cfg()),
            SerializedValue::Null
        );
    }

    #[test]
    fn test_non_finite_floats_become_null() {
        assert_eq!(
            serialize_value(&RuntimeValue::Float(f64::NAN), &cfg()),
            SerializedValue::Null
        );
        assert_eq!(
            serialize_value(&RuntimeValue::Float(f64::INFINITY), &cfg()),
            SerializedValue::Null
        );
    }

    #[test]
    fn test_serialization_is_idempotent() {
        let once = serialize_value(&RuntimeValue::Int(42), &cfg());
        let twice = serialize_value(&RuntimeValue::Serialized(once.clone()), &cfg());
        assert_eq!(once, twice);
    }

    #[test]
    fn test_table_rows_are_keyed_and_capped() {
        let table = Table {
            columns: vec!["v".into()],
            rows: (0..10).map(|i| vec![RuntimeValue::Int(i)]).collect(),
        };
        let config = SerializeConfig { table_row_limit: 3 };
        match serialize_value(&RuntimeValue::Table(table), &config) {
            SerializedValue::Table {
                columns,
                rows,
                total_rows,
            } => {
                assert_eq!(columns, vec!["v"]);
                assert_eq!(rows.len(), 3);
                assert_eq!(total_rows, 10);
                assert_eq!(rows[2].get("v"), Some(&json!(2)));
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn test_absent_cells_become_null() {
        let table = Table {
            columns: vec!["v".into()],
            rows: vec![
                vec![RuntimeValue::Missing],
                vec![RuntimeValue::Null],
                vec![RuntimeValue::Float(f64::NAN)],
            ],
        };
        match serialize_value(&RuntimeValue::Table(table), &cfg()) {
            SerializedValue::Table { rows, .. } => {
                for row in rows {
                    assert_eq!(row.get("v"), Some(&Json::Null));
                }
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    #[test]
    fn test_chart_has_spec_and_markup() {
        match serialize_value(&RuntimeValue::Chart(chart()), &cfg()) {
            SerializedValue::Chart { spec, markup } => {
                assert_eq!(spec["kind"], json!("bar"));
                assert!(markup.contains("sluice-chart"));
            }
            other => panic!("expected chart, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_chart_is_unrepresentable() {
        let value = RuntimeValue::List(vec![RuntimeValue::Chart(chart())]);
        match serialize_value(&value, &cfg()) {
            SerializedValue::Unrepresentable { type_name } => assert_eq!(type_name, "chart"),
            other => panic!("expected unrepresentable, got {other:?}"),
        }
    }

    #[test]
    fn test_aliased_charts_dedup_to_priority_name() {
        let shared = chart();
        let mut ns = Namespace::new();
        ns.set("result", RuntimeValue::Chart(shared.clone()));
        ns.set("fig", RuntimeValue::Chart(shared));
        ns.set("output", RuntimeValue::Str("done".into()));

        let results = extract_results(&ns, &cfg());
        assert!(results.values.contains_key("fig"));
        assert!(!results.values.contains_key("result"));
        // `result` outranks `output` and resolves to the chart's winner.
        assert_eq!(results.primary.as_deref(), Some("fig"));
    }

    #[test]
    fn test_primary_resolves_chart_aliases_to_their_winner() {
        let shared = chart();
        let mut ns = Namespace::new();
        ns.set("fig", RuntimeValue::Chart(shared.clone()));
        ns.set("result", RuntimeValue::Chart(shared.clone()));
        ns.set("output", RuntimeValue::Chart(shared));

        let results = extract_results(&ns, &cfg());
        assert_eq!(results.values.len(), 1);
        assert!(matches!(
            results.values.get("fig"),
            Some(SerializedValue::Chart { .. })
        ));
        assert_eq!(results.primary.as_deref(), Some("fig"));
    }

    #[test]
    fn test_deep_copied_charts_stay_separate() {
        let original = RuntimeValue::Chart(chart());
        let copy = original.deep_copy();
        let mut ns = Namespace::new();
        ns.set("fig", original);
        ns.set("plot", copy);

        let results = extract_results(&ns, &cfg());
        assert!(results.values.contains_key("fig"));
        assert!(results.values.contains_key("plot"));
    }

    #[test]
    fn test_primary_result_priority() {
        let mut ns = Namespace::new();
        ns.set("answer", RuntimeValue::Int(1));
        ns.set("summary", RuntimeValue::Str("s".into()));
        let results = extract_results(&ns, &cfg());
        assert_eq!(results.primary.as_deref(), Some("summary"));
    }

    #[test]
    fn test_null_binding_does_not_win_primary() {
        let mut ns = Namespace::new();
        ns.set("result", RuntimeValue::Null);
        ns.set("output", RuntimeValue::Int(3));
        let results = extract_results(&ns, &cfg());
        assert_eq!(results.primary.as_deref(), Some("output"));
    }
}
