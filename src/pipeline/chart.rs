use crate::pipeline::executor::ExecutionResult;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;

const MAX_AXIS_POINTS: usize = 50;
const MAX_PIE_SEGMENTS: usize = 20;
const MAX_SCATTER_POINTS: usize = 100;
const MAX_TABLE_ROWS: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct Series {
    pub name: String,
    pub data: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PieSegment {
    pub label: String,
    pub value: f64,
}

/// Chart suggestion derived from the question and the result shape.
/// Purely a function of its inputs.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChartSpec {
    Line {
        x_axis: Vec<String>,
        series: Vec<Series>,
    },
    Bar {
        x_axis: Vec<String>,
        series: Vec<Series>,
    },
    Pie {
        segments: Vec<PieSegment>,
    },
    Scatter {
        points: Vec<(f64, f64)>,
    },
    Table {
        columns: Vec<String>,
        rows: Vec<Vec<JsonValue>>,
    },
}

const TREND_WORDS: [&str; 7] = [
    "trend", "over time", "monthly", "weekly", "daily", "growth", "change",
];
const SHARE_WORDS: [&str; 5] = ["share", "percentage", "proportion", "ratio", "breakdown"];
const RANK_WORDS: [&str; 7] = ["top", "rank", "ranking", "highest", "lowest", "most", "least"];
const RELATION_WORDS: [&str; 5] = ["relationship", "correlation", "versus", " vs ", "against"];

/// Question-keyword rules take priority over shape-based inference.
pub fn recommend(question: &str, result: &ExecutionResult) -> ChartSpec {
    let lowered = format!(" {} ", question.to_lowercase());
    let contains = |words: &[&str]| words.iter().any(|w| lowered.contains(w));

    let spec = if contains(&TREND_WORDS) {
        axis_chart(result, true)
    } else if contains(&SHARE_WORDS) {
        pie_chart(result)
    } else if contains(&RANK_WORDS) {
        axis_chart(result, false)
    } else if contains(&RELATION_WORDS) {
        scatter_chart(result)
    } else if numeric_columns(result).len() >= 2 {
        scatter_chart(result)
    } else {
        None
    };

    spec.unwrap_or_else(|| table_chart(result))
}

fn numeric_columns(result: &ExecutionResult) -> Vec<usize> {
    (0..result.columns.len())
        .filter(|&i| {
            let mut any = false;
            for row in &result.rows {
                match row.get(i) {
                    Some(JsonValue::Number(_)) => any = true,
                    Some(JsonValue::Null) => {}
                    _ => return false,
                }
            }
            any
        })
        .collect()
}

fn as_f64(value: &JsonValue) -> f64 {
    value.as_f64().unwrap_or(0.0)
}

fn label_of(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn axis_chart(result: &ExecutionResult, line: bool) -> Option<ChartSpec> {
    let numeric = numeric_columns(result);
    // First non-numeric column is the axis; fall back to column 0
    let axis_idx = (0..result.columns.len()).find(|i| !numeric.contains(i)).unwrap_or(0);
    let value_idxs: Vec<usize> = numeric.into_iter().filter(|&i| i != axis_idx).collect();

    if value_idxs.is_empty() || result.rows.is_empty() {
        return None;
    }

    let rows = &result.rows[..result.rows.len().min(MAX_AXIS_POINTS)];
    let x_axis = rows.iter().map(|r| label_of(&r[axis_idx])).collect();
    let series = value_idxs
        .iter()
        .map(|&i| Series {
            name: result.columns[i].clone(),
            data: rows.iter().map(|r| as_f64(&r[i])).collect(),
        })
        .collect();

    debug!("Axis chart over {} points", rows.len());
    Some(if line {
        ChartSpec::Line { x_axis, series }
    } else {
        ChartSpec::Bar { x_axis, series }
    })
}

fn pie_chart(result: &ExecutionResult) -> Option<ChartSpec> {
    let numeric = numeric_columns(result);
    let value_idx = *numeric.first()?;
    let label_idx = (0..result.columns.len()).find(|i| !numeric.contains(i)).unwrap_or(0);

    if result.rows.is_empty() || label_idx == value_idx {
        return None;
    }

    let segments = result
        .rows
        .iter()
        .take(MAX_PIE_SEGMENTS)
        .map(|r| PieSegment {
            label: label_of(&r[label_idx]),
            value: as_f64(&r[value_idx]),
        })
        .collect();

    Some(ChartSpec::Pie { segments })
}

fn scatter_chart(result: &ExecutionResult) -> Option<ChartSpec> {
    let numeric = numeric_columns(result);
    if numeric.len() < 2 || result.rows.is_empty() {
        return None;
    }
    let (x, y) = (numeric[0], numeric[1]);

    let points = result
        .rows
        .iter()
        .take(MAX_SCATTER_POINTS)
        .map(|r| (as_f64(&r[x]), as_f64(&r[y])))
        .collect();

    Some(ChartSpec::Scatter { points })
}

fn table_chart(result: &ExecutionResult) -> ChartSpec {
    ChartSpec::Table {
        columns: result.columns.clone(),
        rows: result.rows.iter().take(MAX_TABLE_ROWS).cloned().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(columns: &[&str], rows: Vec<Vec<JsonValue>>) -> ExecutionResult {
        ExecutionResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            row_count: rows.len(),
            rows,
            total_rows: None,
            execution_time_ms: 1,
            from_cache: false,
        }
    }

    fn monthly_counts(n: usize) -> ExecutionResult {
        let rows = (0..n)
            .map(|i| vec![JsonValue::String(format!("2024-{:02}", i + 1)), JsonValue::from(i as i64 * 10)])
            .collect();
        result(&["month", "count"], rows)
    }

    #[test]
    fn trend_question_yields_line_with_full_axis() {
        let spec = recommend("show monthly order count trend", &monthly_counts(12));
        match spec {
            ChartSpec::Line { x_axis, series } => {
                assert_eq!(x_axis.len(), 12);
                assert_eq!(series.len(), 1);
                assert_eq!(series[0].name, "count");
            }
            other => panic!("expected line, got {:?}", other),
        }
    }

    #[test]
    fn ranking_question_yields_bar() {
        let spec = recommend("top 5 customers by revenue", &monthly_counts(5));
        assert!(matches!(spec, ChartSpec::Bar { .. }));
    }

    #[test]
    fn share_question_yields_pie_capped_at_twenty() {
        let spec = recommend("revenue share by region", &monthly_counts(30));
        match spec {
            ChartSpec::Pie { segments } => assert_eq!(segments.len(), 20),
            other => panic!("expected pie, got {:?}", other),
        }
    }

    #[test]
    fn two_numeric_columns_fall_back_to_scatter() {
        let rows = (0..5)
            .map(|i| vec![JsonValue::from(i), JsonValue::from(i * i)])
            .collect();
        let spec = recommend("orders data", &result(&["a", "b"], rows));
        assert!(matches!(spec, ChartSpec::Scatter { .. }));
    }

    #[test]
    fn keyword_rule_beats_shape_inference() {
        let rows = (0..5)
            .map(|i| vec![JsonValue::from(i), JsonValue::from(i * 2)])
            .collect();
        let spec = recommend("price versus quantity", &result(&["price", "qty"], rows));
        assert!(matches!(spec, ChartSpec::Scatter { .. }));

        let rows = (0..5)
            .map(|i| vec![JsonValue::from(i), JsonValue::from(i * 2)])
            .collect();
        let spec = recommend("count trend by week", &result(&["week", "count"], rows));
        assert!(matches!(spec, ChartSpec::Line { .. }));
    }

    #[test]
    fn text_only_result_becomes_table() {
        let rows = vec![vec![JsonValue::String("x".into()), JsonValue::String("y".into())]];
        let spec = recommend("list names", &result(&["a", "b"], rows));
        assert!(matches!(spec, ChartSpec::Table { .. }));
    }

    #[test]
    fn empty_result_becomes_table() {
        let spec = recommend("share of nothing", &result(&["a"], vec![]));
        assert!(matches!(spec, ChartSpec::Table { .. }));
    }

    #[test]
    fn axis_points_are_capped() {
        let spec = recommend("daily count trend", &monthly_counts(80));
        match spec {
            ChartSpec::Line { x_axis, .. } => assert_eq!(x_axis.len(), 50),
            other => panic!("expected line, got {:?}", other),
        }
    }
}
