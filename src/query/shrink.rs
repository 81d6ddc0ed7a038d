/// Row shrinking
///
/// Keeps what is handed back to an agent inside a fixed budget: a row cap,
/// a field cap per row, a per-value character cap and a total serialized size.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::config::ShrinkConfig;

/// Column name -> value, in select-list order.
pub type Row = Map<String, Value>;

const ELLIPSIS: char = '…';

/// Rows after shrinking plus enough bookkeeping to tell the caller what was cut.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RowSet {
    pub rows: Vec<Row>,
    /// Rows in `rows`
    pub returned: usize,
    /// Rows the statement produced
    pub total: usize,
    pub truncated: bool,
}

impl RowSet {
    /// True when the statement produced nothing. Rows cut by the budgets
    /// still count as data.
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Apply the row, field, value and total budgets, in that order.
pub fn shrink_rows(rows: Vec<Row>, config: &ShrinkConfig) -> RowSet {
    let total = rows.len();
    let mut truncated = false;
    let mut used = 0usize;
    let mut kept = Vec::with_capacity(total.min(config.max_rows));

    for row in rows.into_iter().take(config.max_rows) {
        let (row, cut) = shrink_row(row, config);
        truncated |= cut;

        let size = serialized_len(&row) + 1;
        if used + size > config.max_total_chars {
            truncated = true;
            break;
        }
        used += size;
        kept.push(row);
    }

    if total > config.max_rows {
        truncated = true;
    }

    RowSet {
        returned: kept.len(),
        rows: kept,
        total,
        truncated,
    }
}

fn shrink_row(row: Row, config: &ShrinkConfig) -> (Row, bool) {
    let mut cut = row.len() > config.max_fields;
    let mut out = Row::new();

    for (key, value) in row.into_iter().take(config.max_fields) {
        match value {
            Value::Array(_) | Value::Object(_) => cut = true,
            Value::String(s) => {
                let (s, shortened) = clip(s, config.max_chars_per_value);
                cut |= shortened;
                out.insert(key, Value::String(s));
            }
            Value::Number(n) => {
                // numerics rendered as very long literals still obey the value cap
                let text = n.to_string();
                if text.chars().count() > config.max_chars_per_value {
                    let (s, _) = clip(text, config.max_chars_per_value);
                    cut = true;
                    out.insert(key, Value::String(s));
                } else {
                    out.insert(key, Value::Number(n));
                }
            }
            other => {
                out.insert(key, other);
            }
        }
    }
    (out, cut)
}

/// Cut `s` to at most `max` characters, the ellipsis included.
fn clip(s: String, max: usize) -> (String, bool) {
    if s.chars().count() <= max {
        return (s, false);
    }
    if max == 0 {
        return (String::new(), true);
    }
    let mut out: String = s.chars().take(max - 1).collect();
    out.push(ELLIPSIS);
    (out, true)
}

fn serialized_len(row: &Row) -> usize {
    serde_json::to_string(row)
        .map(|s| s.chars().count())
        .unwrap_or(usize::MAX / 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_small_result_passes_through() {
        let rows = vec![
            row(json!({"id": 1, "title": "Raise quorum", "passed": true, "body": null})),
            row(json!({"id": 2, "title": "Fund grants", "passed": false, "body": null})),
        ];
        let set = shrink_rows(rows.clone(), &ShrinkConfig::default());
        assert_eq!(set.rows, rows);
        assert_eq!(set.returned, 2);
        assert_eq!(set.total, 2);
        assert!(!set.truncated);
    }

    #[test]
    fn test_field_cap_keeps_first_keys_and_drops_nested() {
        let mut r = Row::new();
        r.insert("tags".to_string(), json!(["a", "b"]));
        r.insert("meta".to_string(), json!({"k": 1}));
        for i in 0..20 {
            r.insert(format!("c{:02}", i), json!(i));
        }
        let set = shrink_rows(vec![r], &ShrinkConfig::default());
        let kept = &set.rows[0];

        // first 16 keys are tags, meta, c00..c13; the nested two are dropped
        assert_eq!(kept.len(), 14);
        assert!(!kept.contains_key("tags"));
        assert!(!kept.contains_key("meta"));
        assert_eq!(kept.keys().next().map(String::as_str), Some("c00"));
        assert!(kept.contains_key("c13"));
        assert!(!kept.contains_key("c14"));
        assert!(set.truncated);
    }

    #[test]
    fn test_long_value_is_clipped_with_ellipsis() {
        let long = "ü".repeat(800);
        let set = shrink_rows(vec![row(json!({"body": long}))], &ShrinkConfig::default());
        let body = set.rows[0]["body"].as_str().unwrap();
        assert_eq!(body.chars().count(), 500);
        assert!(body.ends_with('…'));
        assert!(set.truncated);
    }

    #[test]
    fn test_total_budget_drops_tail_rows() {
        let config = ShrinkConfig {
            max_total_chars: 100,
            ..ShrinkConfig::default()
        };
        let rows: Vec<Row> = (0..10)
            .map(|i| row(json!({"id": i, "text": "x".repeat(20)})))
            .collect();
        let set = shrink_rows(rows, &config);

        // {"id":0,"text":"xxxxxxxxxxxxxxxxxxxx"} is 38 chars plus a newline
        assert_eq!(set.returned, 2);
        assert_eq!(set.total, 10);
        assert!(set.truncated);
    }

    #[test]
    fn test_oversized_first_row_is_dropped_but_counted() {
        let config = ShrinkConfig {
            max_total_chars: 10,
            ..ShrinkConfig::default()
        };
        let set = shrink_rows(vec![row(json!({"title": "a fairly long title"}))], &config);
        assert!(set.rows.is_empty());
        assert_eq!(set.returned, 0);
        assert_eq!(set.total, 1);
        assert!(set.truncated);
        assert!(!set.is_empty());

        assert!(shrink_rows(Vec::new(), &config).is_empty());
    }

    #[test]
    fn test_huge_result_fits_every_budget() {
        let config = ShrinkConfig::default();
        let value = "v".repeat(2_000);
        let rows: Vec<Row> = (0..1_000)
            .map(|_| {
                (0..50)
                    .map(|f| (format!("field_{}", f), Value::String(value.clone())))
                    .collect::<Row>()
            })
            .collect();

        let set = shrink_rows(rows, &config);

        assert!(set.rows.len() <= 20);
        assert_eq!(set.total, 1_000);
        assert!(set.truncated);
        let mut total_chars = 0;
        for r in &set.rows {
            assert!(r.len() <= 16);
            for v in r.values() {
                assert!(v.as_str().unwrap().chars().count() <= 500);
            }
            total_chars += serde_json::to_string(r).unwrap().chars().count() + 1;
        }
        assert!(total_chars <= 20_000, "{}", total_chars);
        assert!(!set.rows.is_empty());
    }
}
