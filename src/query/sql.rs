/// Lightweight SQL text utilities
///
/// Not a parser. The scanner only knows enough PostgreSQL lexical structure
/// (string literals, quoted identifiers, dollar quotes, comments, parentheses)
/// to locate top-level clauses and to keep keyword checks out of literals.

use regex::Regex;
use std::sync::OnceLock;

/// Keywords that must never appear in an agent-issued statement.
/// `INTO` covers `SELECT ... INTO new_table`, which creates a table.
const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "MERGE", "GRANT",
    "REVOKE", "COPY", "EXEC", "EXECUTE", "CALL", "VACUUM", "INTO",
];

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Per-byte parenthesis depth of `sql`.
///
/// Bytes inside string literals, quoted identifiers, dollar-quoted bodies and
/// comments map to `None`.
pub fn depth_map(sql: &str) -> Vec<Option<u32>> {
    let bytes = sql.as_bytes();
    let mut out = vec![None; bytes.len()];
    let mut depth: u32 = 0;
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b'\'' | b'"' => {
                let end = skip_quoted(bytes, i, b);
                i = end;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut nesting = 1;
                i += 2;
                while i < bytes.len() && nesting > 0 {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                        nesting += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        nesting -= 1;
                        i += 2;
                    } else {
                        i += 1;
                    }
                }
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(tag) => {
                    let body_start = i + tag.len();
                    i = find_subslice(bytes, body_start, tag)
                        .map(|p| p + tag.len())
                        .unwrap_or(bytes.len());
                }
                None => {
                    out[i] = Some(depth);
                    i += 1;
                }
            },
            b'(' => {
                out[i] = Some(depth);
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                out[i] = Some(depth);
                i += 1;
            }
            _ => {
                out[i] = Some(depth);
                i += 1;
            }
        }
    }
    out
}

/// Index just past the closing quote; doubled quotes are escapes.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$tag$` opener at `i`, if any. Positional parameters like `$1` are not tags.
fn dollar_tag(bytes: &[u8], i: usize) -> Option<&[u8]> {
    let mut j = i + 1;
    while j < bytes.len() && (bytes[j].is_ascii_alphabetic() || bytes[j] == b'_') {
        j += 1;
    }
    if j < bytes.len() && bytes[j] == b'$' {
        Some(&bytes[i..=j])
    } else {
        None
    }
}

fn find_subslice(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// End index of `word` if it appears at `i` as a whole word outside literals.
fn word_at(bytes: &[u8], depths: &[Option<u32>], i: usize, word: &str) -> Option<usize> {
    let w = word.as_bytes();
    let end = i + w.len();
    if end > bytes.len() {
        return None;
    }
    if i > 0 && is_ident_byte(bytes[i - 1]) {
        return None;
    }
    if end < bytes.len() && is_ident_byte(bytes[end]) {
        return None;
    }
    if depths[i].is_none() || !bytes[i..end].eq_ignore_ascii_case(w) {
        return None;
    }
    Some(end)
}

/// Occurrences of a keyword sequence such as `["ORDER", "BY"]` at any depth.
///
/// Returns `(start, end, depth)`; every word of the sequence sits at `depth`.
pub fn find_keywords(sql: &str, depths: &[Option<u32>], words: &[&str]) -> Vec<(usize, usize, u32)> {
    let bytes = sql.as_bytes();
    let mut found = Vec::new();
    let Some(first) = words.first() else {
        return found;
    };

    for i in 0..bytes.len() {
        let Some(depth) = depths[i] else {
            continue;
        };
        let Some(mut end) = word_at(bytes, depths, i, first) else {
            continue;
        };
        let mut matched = true;
        for word in &words[1..] {
            while end < bytes.len() && depths[end] == Some(depth) && bytes[end].is_ascii_whitespace() {
                end += 1;
            }
            match word_at(bytes, depths, end, word) {
                Some(next) if depths[end] == Some(depth) => end = next,
                _ => {
                    matched = false;
                    break;
                }
            }
        }
        if matched {
            found.push((i, end, depth));
        }
    }
    found
}

/// Top-level (depth 0) occurrences of a keyword sequence.
///
/// Returns `(start, end)` byte ranges covering the whole sequence.
pub fn find_top_level(sql: &str, depths: &[Option<u32>], words: &[&str]) -> Vec<(usize, usize)> {
    find_keywords(sql, depths, words)
        .into_iter()
        .filter(|&(_, _, depth)| depth == 0)
        .map(|(start, end, _)| (start, end))
        .collect()
}

/// Byte offsets of commas at `depth` within `range`.
pub fn commas_at_depth(sql: &str, depths: &[Option<u32>], range: std::ops::Range<usize>, depth: u32) -> Vec<usize> {
    let bytes = sql.as_bytes();
    range
        .filter(|&i| bytes[i] == b',' && depths[i] == Some(depth))
        .collect()
}

/// End of the parenthesized scope at `depth` that contains `from`: the index of
/// its closing parenthesis, or the end of `sql` at depth 0.
pub fn scope_end(sql: &str, depths: &[Option<u32>], from: usize, depth: u32) -> usize {
    (from..sql.len())
        .find(|&i| depths[i].is_some_and(|d| d < depth))
        .unwrap_or(sql.len())
}

/// Drop trailing whitespace and statement terminators.
pub fn strip_terminator(sql: &str) -> &str {
    sql.trim_end().trim_end_matches(';').trim_end()
}

// ---------------------------------------------------------------------------
// Statement guard
// ---------------------------------------------------------------------------

/// Accept only a single read-only SELECT (optionally led by WITH).
///
/// Returns the rejection reason on failure.
pub fn validate_select(sql: &str) -> Result<(), String> {
    let body = strip_terminator(sql.trim());
    if body.is_empty() {
        return Err("empty statement".to_string());
    }

    let depths = depth_map(body);
    let bytes = body.as_bytes();

    if bytes
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b';' && depths[i].is_some())
    {
        return Err("expected a single statement, found several".to_string());
    }

    let first_word = first_keyword(body, &depths).unwrap_or_default().to_ascii_uppercase();
    match first_word.as_str() {
        "SELECT" => {}
        "WITH" => {
            if find_top_level(body, &depths, &["SELECT"]).is_empty() {
                return Err("WITH clause without a top-level SELECT".to_string());
            }
        }
        other => {
            return Err(format!("only SELECT statements are allowed, found '{}'", other));
        }
    }

    for i in 0..bytes.len() {
        if depths[i].is_none() || !bytes[i].is_ascii_alphabetic() {
            continue;
        }
        for keyword in FORBIDDEN_KEYWORDS {
            if word_at(bytes, &depths, i, keyword).is_some() {
                return Err(format!("forbidden keyword {}", keyword));
            }
        }
    }

    Ok(())
}

/// First word outside comments and literals, skipping opening parentheses.
fn first_keyword<'a>(sql: &'a str, depths: &[Option<u32>]) -> Option<&'a str> {
    let bytes = sql.as_bytes();
    let start = (0..bytes.len()).find(|&i| depths[i].is_some() && bytes[i].is_ascii_alphabetic())?;
    let end = (start..bytes.len())
        .find(|&i| !is_ident_byte(bytes[i]))
        .unwrap_or(bytes.len());
    Some(&sql[start..end])
}

// ---------------------------------------------------------------------------
// Model output
// ---------------------------------------------------------------------------

/// Pull the first SQL statement out of free-form model output.
///
/// Prefers a ```sql fenced block, then any fenced block, then the raw text.
pub fn extract_sql(text: &str) -> Option<String> {
    static SQL_FENCE: OnceLock<Regex> = OnceLock::new();
    static ANY_FENCE: OnceLock<Regex> = OnceLock::new();
    let sql_fence = SQL_FENCE.get_or_init(|| Regex::new(r"(?is)```sql\s*(.*?)\s*```").unwrap());
    let any_fence = ANY_FENCE.get_or_init(|| Regex::new(r"(?s)```[a-zA-Z]*\s*(.*?)\s*```").unwrap());

    let candidate = sql_fence
        .captures(text)
        .or_else(|| any_fence.captures(text))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(text)
        .trim();

    let depths = depth_map(candidate);
    let first_end = candidate
        .bytes()
        .enumerate()
        .find(|&(i, b)| b == b';' && depths[i].is_some())
        .map(|(i, _)| i)
        .unwrap_or(candidate.len());

    let statement = candidate[..first_end].trim();
    if statement.is_empty() {
        None
    } else {
        Some(statement.to_string())
    }
}

// ---------------------------------------------------------------------------
// Redaction
// ---------------------------------------------------------------------------

/// Replace inlined embedding literals with a marker, keeping the SQL shape.
pub fn redact_vector_literals(sql: &str) -> String {
    static QUOTED: OnceLock<Regex> = OnceLock::new();
    static BARE: OnceLock<Regex> = OnceLock::new();
    static NUMERIC_LIST: OnceLock<Regex> = OnceLock::new();
    let quoted = QUOTED.get_or_init(|| Regex::new(r"'\[[^\]]*\]'\s*::\s*vector").unwrap());
    let bare = BARE.get_or_init(|| Regex::new(r"\[[^\]']*\]\s*::\s*vector").unwrap());
    let numeric_list = NUMERIC_LIST.get_or_init(|| Regex::new(r"\[[\s0-9eE,.\-]{20,}\]").unwrap());

    let redacted = quoted.replace_all(sql, "'[REDACTED_EMBEDDING]'::vector");
    let redacted = bare.replace_all(&redacted, "'[REDACTED_EMBEDDING]'::vector");
    numeric_list
        .replace_all(&redacted, "[REDACTED_EMBEDDING]")
        .into_owned()
}

/// Mask credentials in connection URLs and `password=` pairs.
pub fn redact_secrets(text: &str) -> String {
    static URL_PASSWORD: OnceLock<Regex> = OnceLock::new();
    static KV_PASSWORD: OnceLock<Regex> = OnceLock::new();
    let url_password = URL_PASSWORD
        .get_or_init(|| Regex::new(r"(postgres(?:ql)?://[^:/@\s]+:)[^@\s]+@").unwrap());
    let kv_password =
        KV_PASSWORD.get_or_init(|| Regex::new(r"(?i)(password\s*=\s*)('[^']*'|\S+)").unwrap());

    let masked = url_password.replace_all(text, "${1}***@");
    kv_password.replace_all(&masked, "${1}***").into_owned()
}

/// Everything that may be logged or surfaced goes through here.
pub fn redact(text: &str) -> String {
    redact_secrets(&redact_vector_literals(text))
}
