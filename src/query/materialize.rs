/// Template materialization
///
/// Turns a `QueryTemplate` into runnable SQL. With an embedding, every form of
/// the placeholder (`{prompt_vector}`, `'{prompt_vector}'`, either with a
/// `::vector` cast) becomes one `'[...]'::vector` literal. Without one, the
/// distance expressions are neutralized, similarity ordering is removed and a
/// recency ordering over the configured timestamp columns takes its place.

use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

use crate::config::MaterializeConfig;
use super::sql::{commas_at_depth, depth_map, find_keywords, find_top_level, scope_end, strip_terminator};
use super::{MaterializedQuery, QueryTemplate, PLACEHOLDER};

/// Placeholder in any of the spellings the synthesizer produces.
const PLACEHOLDER_FORMS: &str = r"'?\{prompt_vector\}'?(?:\s*::\s*vector)?";

/// Operand next to a distance operator: a (qualified) column or a flat parenthesized expression.
const OPERAND: &str = r"(?:[A-Za-z_][A-Za-z0-9_.]*(?:\s*::\s*vector)?|\([^()]*\))";

const DISTANCE_OPS: &str = r"(?:<->|<=>|<#>)";

const AGGREGATES: &[&str] = &[
    "count", "sum", "avg", "min", "max", "array_agg", "string_agg", "json_agg", "jsonb_agg",
    "bool_and", "bool_or", "every", "stddev", "variance", "percentile_cont", "percentile_disc",
];

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(PLACEHOLDER_FORMS).unwrap())
}

fn distance_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"{op}\s*{ops}\s*{ph}|{ph}\s*{ops}\s*{op}",
            op = OPERAND,
            ops = DISTANCE_OPS,
            ph = PLACEHOLDER_FORMS
        ))
        .unwrap()
    })
}

/// `<expr containing the placeholder> AS alias` within one select item.
fn similarity_alias_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)\{prompt_vector\}[^,]*?\bAS\s+"?([A-Za-z_][A-Za-z0-9_]*)"?"#).unwrap()
    })
}

/// Render an embedding as a pgvector literal.
pub fn vector_literal(embedding: &[f32]) -> String {
    let body = embedding
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("'[{}]'::vector", body)
}

#[derive(Debug, Clone)]
pub struct Materializer {
    recency_columns: Vec<String>,
}

impl Materializer {
    pub fn new(config: &MaterializeConfig) -> Self {
        Materializer {
            recency_columns: config.recency_columns.clone(),
        }
    }

    /// The ordering used when similarity ranking is unavailable.
    pub fn fallback_ordering(&self) -> String {
        if self.recency_columns.len() == 1 {
            format!("{} DESC", self.recency_columns[0])
        } else {
            format!("COALESCE({}) DESC", self.recency_columns.join(", "))
        }
    }

    /// Produce runnable SQL from `template`.
    ///
    /// An embedding that is empty or holds non-finite values counts as absent.
    pub fn materialize(&self, template: &QueryTemplate, embedding: Option<&[f32]>) -> MaterializedQuery {
        let mut text = strip_terminator(template.raw_text().trim()).to_string();
        let usable = embedding.filter(|v| !v.is_empty() && v.iter().all(|x| x.is_finite()));

        let mut embedding_dims = None;
        let mut dropped_similarity = false;

        if template.has_similarity_placeholder() {
            match usable {
                Some(vector) => {
                    let literal = vector_literal(vector);
                    text = placeholder_re()
                        .replace_all(&text, regex::NoExpand(&literal))
                        .into_owned();
                    embedding_dims = Some(vector.len());
                }
                None => {
                    text = self.drop_similarity_ordering(&text);
                    text = distance_re().replace_all(&text, "0").into_owned();
                    // Any leftover placeholder sits outside a distance expression
                    text = placeholder_re().replace_all(&text, "NULL::vector").into_owned();
                    dropped_similarity = true;
                }
            }
        }

        let (text, recency_fallback) = self.ensure_ordering(text, dropped_similarity);

        MaterializedQuery {
            text,
            embedding_dims,
            recency_fallback,
        }
    }

    /// Remove ORDER BY items that rank by the placeholder or by an alias of a
    /// placeholder expression, at every depth. A clause left with nothing is
    /// removed, except inside a subquery that still limits its rows: that one
    /// gets the recency ordering so the limit keeps picking the newest rows.
    fn drop_similarity_ordering(&self, text: &str) -> String {
        let aliases: Vec<String> = similarity_alias_re()
            .captures_iter(text)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_ascii_lowercase())
            .collect();

        let mut text = text.to_string();
        let clauses = find_keywords(&text, &depth_map(&text), &["ORDER", "BY"]).len();

        // back to front: an edit only touches text after the clause it rewrites
        for k in (0..clauses).rev() {
            let depths = depth_map(&text);
            let Some(&(start, keyword_end, depth)) = find_keywords(&text, &depths, &["ORDER", "BY"]).get(k) else {
                continue;
            };
            if let Some(edited) = self.rewrite_order_clause(&text, &depths, (start, keyword_end, depth), &aliases) {
                text = edited;
            }
        }
        text
    }

    /// `None` when no item of the clause ranks by similarity.
    fn rewrite_order_clause(
        &self,
        text: &str,
        depths: &[Option<u32>],
        (start, keyword_end, depth): (usize, usize, u32),
        aliases: &[String],
    ) -> Option<String> {
        let close = scope_end(text, depths, keyword_end, depth);
        let limit = tail_clause_at(text, depths, keyword_end..close, depth);
        let clause_end = limit.unwrap_or(close);

        let items = split_items(text, depths, keyword_end..clause_end, depth);
        let kept: Vec<&str> = items
            .iter()
            .copied()
            .filter(|item| !item.contains(PLACEHOLDER))
            .filter(|item| {
                let key = sort_key(item).trim_matches('"').to_ascii_lowercase();
                !aliases.contains(&key)
            })
            .collect();
        if kept.len() == items.len() {
            return None;
        }

        let mut out = text[..start].trim_end().to_string();
        if !kept.is_empty() {
            out.push_str(" ORDER BY ");
            out.push_str(&kept.join(", "));
        } else if depth > 0 && limit.is_some() {
            out.push_str(" ORDER BY ");
            out.push_str(&self.fallback_ordering());
        }
        let rest = text[clause_end..].trim_start();
        if !rest.is_empty() && !rest.starts_with(')') {
            out.push(' ');
        }
        out.push_str(rest);
        Some(out)
    }

    /// Append or extend the recency ordering where required.
    fn ensure_ordering(&self, text: String, dropped_similarity: bool) -> (String, bool) {
        let depths = depth_map(&text);
        let fallback = self.fallback_ordering();

        match find_top_level(&text, &depths, &["ORDER", "BY"]).last() {
            Some(&(_, keyword_end)) => {
                if !dropped_similarity {
                    return (text, false);
                }
                let clause_end = tail_clause_start(&text, &depths, keyword_end).unwrap_or(text.len());
                let items = &text[keyword_end..clause_end];
                if self.mentions_recency_column(items) {
                    return (text, false);
                }
                let head = text[..clause_end].trim_end();
                let tail = text[clause_end..].trim_start();
                (join_clause(&format!("{}, {}", head, fallback), tail), true)
            }
            None => {
                if !dropped_similarity && is_aggregate_only(&text, &depths) {
                    return (text, false);
                }
                let at = tail_clause_start(&text, &depths, 0).unwrap_or(text.len());
                let head = text[..at].trim_end();
                let tail = text[at..].trim_start();
                (join_clause(&format!("{} ORDER BY {}", head, fallback), tail), true)
            }
        }
    }

    fn mentions_recency_column(&self, items: &str) -> bool {
        let lower = items.to_ascii_lowercase();
        self.recency_columns.iter().any(|col| {
            let col = col.to_ascii_lowercase();
            lower.match_indices(&col).any(|(i, _)| {
                let before = lower[..i].chars().next_back();
                let after = lower[i + col.len()..].chars().next();
                !before.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
                    && !after.is_some_and(|c| c.is_ascii_alphanumeric() || c == '_')
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Clause helpers
// ---------------------------------------------------------------------------

/// Start of the first top-level LIMIT / OFFSET / FETCH at or after `from`.
fn tail_clause_start(text: &str, depths: &[Option<u32>], from: usize) -> Option<usize> {
    tail_clause_at(text, depths, from..text.len(), 0)
}

/// First LIMIT / OFFSET / FETCH at `depth` starting inside `range`.
fn tail_clause_at(text: &str, depths: &[Option<u32>], range: Range<usize>, depth: u32) -> Option<usize> {
    ["LIMIT", "OFFSET", "FETCH"]
        .iter()
        .flat_map(|kw| find_keywords(text, depths, &[kw]))
        .filter(|&(start, _, d)| d == depth && range.contains(&start))
        .map(|(start, _, _)| start)
        .min()
}

fn split_items<'a>(text: &'a str, depths: &[Option<u32>], range: Range<usize>, depth: u32) -> Vec<&'a str> {
    let mut items = Vec::new();
    let mut start = range.start;
    for comma in commas_at_depth(text, depths, range.clone(), depth) {
        items.push(text[start..comma].trim());
        start = comma + 1;
    }
    items.push(text[start..range.end].trim());
    items.into_iter().filter(|s| !s.is_empty()).collect()
}

/// Sort expression of an ORDER BY item, without direction or NULLS placement.
fn sort_key(item: &str) -> &str {
    let mut key = item.trim();
    loop {
        let lower = key.to_ascii_lowercase();
        let stripped = ["nulls first", "nulls last", "asc", "desc"]
            .iter()
            .find(|suffix| {
                lower.ends_with(*suffix)
                    && lower[..lower.len() - suffix.len()]
                        .ends_with(|c: char| c.is_whitespace())
            })
            .map(|suffix| key[..key.len() - suffix.len()].trim_end());
        match stripped {
            Some(rest) => key = rest,
            None => return key,
        }
    }
}

fn join_clause(head: &str, tail: &str) -> String {
    if tail.is_empty() {
        head.to_string()
    } else {
        format!("{} {}", head, tail)
    }
}

/// Statements where a row ordering is meaningless or would be rejected:
/// grouped or pure-aggregate selects, DISTINCT, set operations, no FROM.
fn is_aggregate_only(text: &str, depths: &[Option<u32>]) -> bool {
    if !find_top_level(text, depths, &["GROUP", "BY"]).is_empty() {
        return true;
    }
    if ["UNION", "INTERSECT", "EXCEPT"]
        .iter()
        .any(|kw| !find_top_level(text, depths, &[kw]).is_empty())
    {
        return true;
    }

    let Some(&(_, select_end)) = find_top_level(text, depths, &["SELECT"]).first() else {
        return true;
    };
    let Some(&(from_start, _)) = find_top_level(text, depths, &["FROM"])
        .iter()
        .find(|(start, _)| *start > select_end)
    else {
        return true;
    };

    let list = text[select_end..from_start].trim_start();
    if list.get(..8).is_some_and(|head| head.eq_ignore_ascii_case("DISTINCT")) {
        return true;
    }

    let items = split_items(text, depths, select_end..from_start, 0);
    !items.is_empty()
        && items.iter().all(|item| {
            let lower = item.to_ascii_lowercase();
            AGGREGATES.iter().any(|agg| {
                lower
                    .strip_prefix(agg)
                    .is_some_and(|rest| rest.trim_start().starts_with('('))
            })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn materializer() -> Materializer {
        Materializer::new(&MaterializeConfig::default())
    }

    const FALLBACK: &str = "ORDER BY COALESCE(created_at, created, start_timestamp, start_date) DESC";

    #[test]
    fn test_embedding_replaces_every_placeholder_form() {
        let template = QueryTemplate::new(
            "SELECT title, 1 - (embedding <=> '{prompt_vector}'::vector) AS similarity \
             FROM proposals ORDER BY embedding <=> {prompt_vector} LIMIT 5;",
        );
        let q = materializer().materialize(&template, Some(&[0.5, -1.0, 0.25]));

        assert_eq!(q.embedding_dims, Some(3));
        assert!(!q.recency_fallback);
        assert!(!q.text.contains(PLACEHOLDER));
        assert_eq!(q.text.matches("'[0.5,-1,0.25]'::vector").count(), 2, "{}", q.text);
        assert!(!q.text.contains("::vector::vector"));
        assert!(q.text.ends_with("LIMIT 5"));
    }

    #[test]
    fn test_no_embedding_replaces_similarity_order_with_recency() {
        let template = QueryTemplate::new(
            "SELECT title FROM proposals ORDER BY embedding <=> '{prompt_vector}'::vector LIMIT 5",
        );
        let q = materializer().materialize(&template, None);

        assert_eq!(q.embedding_dims, None);
        assert!(q.recency_fallback);
        assert_eq!(q.text, format!("SELECT title FROM proposals {} LIMIT 5", FALLBACK));
    }

    #[test]
    fn test_no_embedding_neutralizes_distance_in_select_and_where() {
        let template = QueryTemplate::new(
            "SELECT title, 1 - (p.embedding <=> '{prompt_vector}') AS similarity FROM proposals p \
             WHERE '{prompt_vector}'::vector <-> p.embedding < 0.8 ORDER BY similarity DESC LIMIT 10",
        );
        let q = materializer().materialize(&template, None);

        assert!(!q.text.contains(PLACEHOLDER), "{}", q.text);
        assert!(q.text.contains("1 - (0) AS similarity"), "{}", q.text);
        assert!(q.text.contains("WHERE 0 < 0.8"), "{}", q.text);
        assert!(!q.text.contains("similarity DESC"), "{}", q.text);
        assert!(q.text.contains(FALLBACK));
        assert!(q.text.ends_with("LIMIT 10"));
    }

    #[test]
    fn test_no_embedding_keeps_other_order_items() {
        let template = QueryTemplate::new(
            "SELECT * FROM votes ORDER BY embedding <-> {prompt_vector}, voting_power DESC",
        );
        let q = materializer().materialize(&template, None);
        assert_eq!(
            q.text,
            "SELECT * FROM votes ORDER BY voting_power DESC, \
             COALESCE(created_at, created, start_timestamp, start_date) DESC"
        );

        let already_recent = QueryTemplate::new(
            "SELECT * FROM votes ORDER BY embedding <-> {prompt_vector}, created_at DESC LIMIT 3",
        );
        let q = materializer().materialize(&already_recent, None);
        assert_eq!(q.text, "SELECT * FROM votes ORDER BY created_at DESC LIMIT 3");
        assert!(!q.recency_fallback);
    }

    #[test]
    fn test_no_embedding_rewrites_nested_similarity_ordering() {
        let cte = QueryTemplate::new(
            "WITH top AS (SELECT proposal_id FROM internal.unified_embeddings \
             ORDER BY embedding <-> '{prompt_vector}'::vector LIMIT 10) \
             SELECT p.title FROM top JOIN internal.unified_proposals p ON p.proposal_id = top.proposal_id",
        );
        let q = materializer().materialize(&cte, None);
        assert!(q.recency_fallback);
        assert!(!q.text.contains("ORDER BY 0"), "{}", q.text);
        assert_eq!(
            q.text,
            format!(
                "WITH top AS (SELECT proposal_id FROM internal.unified_embeddings {} LIMIT 10) \
                 SELECT p.title FROM top JOIN internal.unified_proposals p ON p.proposal_id = top.proposal_id {}",
                FALLBACK, FALLBACK
            )
        );

        let unlimited = QueryTemplate::new(
            "SELECT s.title, row_number() OVER (ORDER BY s.embedding <=> {prompt_vector}) AS rank \
             FROM (SELECT title, embedding FROM proposals ORDER BY embedding <=> {prompt_vector}) s",
        );
        let q = materializer().materialize(&unlimited, None);
        assert_eq!(
            q.text,
            format!(
                "SELECT s.title, row_number() OVER () AS rank \
                 FROM (SELECT title, embedding FROM proposals) s {}",
                FALLBACK
            )
        );
    }

    #[test]
    fn test_non_ascii_select_list() {
        let q = materializer().materialize(&QueryTemplate::new("SELECT categoría FROM proposals"), None);
        assert!(q.recency_fallback);
        assert_eq!(q.text, format!("SELECT categoría FROM proposals {}", FALLBACK));

        let distinct = "SELECT DISTINCT categoría FROM proposals";
        let q = materializer().materialize(&QueryTemplate::new(distinct), None);
        assert_eq!(q.text, distinct);
        assert!(!q.recency_fallback);
    }

    #[test]
    fn test_unordered_statement_gets_fallback_before_limit() {
        let template = QueryTemplate::new("SELECT id, title FROM proposals WHERE state = 'active' LIMIT 20;");
        let q = materializer().materialize(&template, None);
        assert!(q.recency_fallback);
        assert_eq!(
            q.text,
            format!("SELECT id, title FROM proposals WHERE state = 'active' {} LIMIT 20", FALLBACK)
        );
    }

    #[test]
    fn test_aggregate_statements_are_left_alone() {
        let m = materializer();
        for sql in [
            "SELECT count(*) FROM proposals",
            "SELECT dao_id, count(*) FROM proposals GROUP BY dao_id",
            "SELECT DISTINCT dao_id FROM proposals",
            "SELECT 1",
        ] {
            let q = m.materialize(&QueryTemplate::new(sql), None);
            assert_eq!(q.text, sql);
            assert!(!q.recency_fallback, "{}", sql);
        }
    }

    #[test]
    fn test_subquery_limit_is_not_the_insertion_point() {
        let template = QueryTemplate::new(
            "SELECT * FROM (SELECT * FROM proposals ORDER BY id LIMIT 50) p WHERE p.state = 'closed'",
        );
        let q = materializer().materialize(&template, None);
        assert!(q.text.ends_with(FALLBACK), "{}", q.text);
        assert!(q.text.contains("ORDER BY id LIMIT 50)"));
    }

    #[test]
    fn test_template_is_unchanged_and_non_finite_embedding_ignored() {
        let raw = "SELECT * FROM t ORDER BY v <=> {prompt_vector} LIMIT 1";
        let template = QueryTemplate::new(raw);
        let q = materializer().materialize(&template, Some(&[f32::NAN, 1.0]));
        assert_eq!(template.raw_text(), raw);
        assert!(template.has_similarity_placeholder());
        assert_eq!(q.embedding_dims, None);
        assert!(q.recency_fallback);

        let empty = materializer().materialize(&template, Some(&[]));
        assert_eq!(empty.text, q.text);
    }

    #[test]
    fn test_redacted_rendering_hides_vector() {
        let template = QueryTemplate::new("SELECT * FROM t ORDER BY v <=> {prompt_vector}");
        let vector: Vec<f32> = (0..64).map(|i| i as f32 / 64.0).collect();
        let q = materializer().materialize(&template, Some(&vector));
        let shown = q.redacted();
        assert!(shown.contains("[REDACTED_EMBEDDING]"), "{}", shown);
        assert!(!shown.contains("0.015625"));
    }

    #[test]
    fn test_sort_key_strips_direction() {
        assert_eq!(sort_key("similarity DESC NULLS LAST"), "similarity");
        assert_eq!(sort_key("created_at asc"), "created_at");
        assert_eq!(sort_key("description"), "description");
    }
}
