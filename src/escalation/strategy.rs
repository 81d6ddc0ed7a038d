/// Escalation strategies
///
/// The ladder is a closed, ordered set. Each rung is planned by a pure
/// function of the question and what the previous rung produced; planning
/// never touches the database or a provider.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::config::FuzzyIdConfig;
use crate::errors::VecqueryError;
use crate::query::{sql, QueryTemplate};
use crate::synthesis::Constraint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Original,
    Broadened,
    NoSimilarity,
    FuzzyIdentifier,
}

impl Strategy {
    /// Every strategy, in the order the ladder tries them.
    pub const LADDER: [Strategy; 4] = [
        Strategy::Original,
        Strategy::Broadened,
        Strategy::NoSimilarity,
        Strategy::FuzzyIdentifier,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Original => write!(f, "original"),
            Strategy::Broadened => write!(f, "broadened"),
            Strategy::NoSimilarity => write!(f, "no_similarity"),
            Strategy::FuzzyIdentifier => write!(f, "fuzzy_identifier"),
        }
    }
}

/// What the previous rung left behind.
#[derive(Debug, Clone, Default)]
pub struct Prior<'a> {
    /// Most recent template, original or re-synthesized
    pub template: Option<&'a QueryTemplate>,
    /// Redacted statement last sent to the database
    pub statement: Option<&'a str>,
    /// Why the last attempt did not produce rows
    pub reason: Option<&'a str>,
}

/// What a strategy asks the controller to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Synthesize { constraint: Constraint, context: String },
    Execute(QueryTemplate),
    Skip(&'static str),
}

/// Plan one rung. The first rung is handled by the controller (its synthesis
/// overlaps with the embedding call), so it is always a plain synthesis here.
pub fn plan(strategy: Strategy, question: &str, prior: &Prior<'_>, identifiers: &IdentifierMatcher) -> Plan {
    match strategy {
        Strategy::Original => Plan::Synthesize {
            constraint: Constraint::None,
            context: String::new(),
        },
        Strategy::Broadened => Plan::Synthesize {
            constraint: Constraint::Broaden,
            context: retry_context(prior),
        },
        Strategy::NoSimilarity => match prior.template {
            Some(t) if t.has_similarity_placeholder() => Plan::Synthesize {
                constraint: Constraint::ForbidSimilarity,
                context: retry_context(prior),
            },
            _ => Plan::Skip("previous template does not use similarity"),
        },
        Strategy::FuzzyIdentifier => match identifiers.detect(question) {
            Some(found) => Plan::Execute(identifiers.template(&found)),
            None => Plan::Skip("question names no identifier"),
        },
    }
}

/// Context handed to a re-synthesis: the previous statement and why it failed.
pub fn retry_context(prior: &Prior<'_>) -> String {
    let mut context = String::new();
    if let Some(statement) = prior.statement {
        context.push_str("Previous SQL:\n");
        context.push_str(&sql::redact(statement));
        context.push('\n');
    }
    if let Some(reason) = prior.reason {
        context.push_str("Previous attempt: ");
        context.push_str(&sql::redact(reason));
        context.push('\n');
    }
    context
}

// ---------------------------------------------------------------------------
// Identifier lookup
// ---------------------------------------------------------------------------

/// Identifier (and optional scope) found in a question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdentifierMatch {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Builds the deterministic substring lookup for questions naming a record.
#[derive(Debug, Clone)]
pub struct IdentifierMatcher {
    config: FuzzyIdConfig,
    pattern: Option<Regex>,
    scope_pattern: Option<Regex>,
}

fn sql_identifier_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?$").unwrap())
}

fn check_identifier(field: &str, value: &str) -> Result<(), VecqueryError> {
    if sql_identifier_re().is_match(value) {
        Ok(())
    } else {
        Err(VecqueryError::Config(format!(
            "escalation.fuzzy_id.{}: '{}' is not a plain SQL identifier",
            field, value
        )))
    }
}

impl IdentifierMatcher {
    /// Compile the configured patterns and check every configured name.
    pub fn new(config: &FuzzyIdConfig) -> Result<Self, VecqueryError> {
        check_identifier("table", &config.table)?;
        check_identifier("id_column", &config.id_column)?;
        check_identifier("order_column", &config.order_column)?;
        for column in &config.columns {
            check_identifier("columns", column)?;
        }
        if let Some(link) = &config.link_column {
            check_identifier("link_column", link)?;
            if !config.link_segment.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | '.')) {
                return Err(VecqueryError::Config(format!(
                    "escalation.fuzzy_id.link_segment: '{}' may only hold URL path characters",
                    config.link_segment
                )));
            }
        }
        if let Some(scope) = &config.scope_column {
            check_identifier("scope_column", scope)?;
        }

        let compile = |field: &str, pattern: &str, group: &str| -> Result<Regex, VecqueryError> {
            let re = Regex::new(pattern).map_err(|e| {
                VecqueryError::Config(format!("escalation.fuzzy_id.{}: {}", field, e))
            })?;
            if !re.capture_names().any(|n| n == Some(group)) {
                return Err(VecqueryError::Config(format!(
                    "escalation.fuzzy_id.{} needs a named `{}` group",
                    field, group
                )));
            }
            Ok(re)
        };

        let pattern = if config.enabled {
            Some(compile("pattern", &config.pattern, "id")?)
        } else {
            None
        };
        let scope_pattern = match (&config.scope_pattern, &config.scope_column) {
            (Some(p), Some(_)) if config.enabled => Some(compile("scope_pattern", p, "scope")?),
            _ => None,
        };

        Ok(IdentifierMatcher {
            config: config.clone(),
            pattern,
            scope_pattern,
        })
    }

    /// Matcher that never fires.
    pub fn disabled() -> Self {
        IdentifierMatcher {
            config: FuzzyIdConfig {
                enabled: false,
                ..FuzzyIdConfig::default()
            },
            pattern: None,
            scope_pattern: None,
        }
    }

    pub fn detect(&self, question: &str) -> Option<IdentifierMatch> {
        let id = self
            .pattern
            .as_ref()?
            .captures(question)?
            .name("id")
            .map(|m| sanitize_token(m.as_str()))
            .filter(|id| !id.is_empty())?;

        let scope = self
            .scope_pattern
            .as_ref()
            .and_then(|re| re.captures(question))
            .and_then(|c| c.name("scope").map(|m| sanitize_token(m.as_str()).to_lowercase()))
            .filter(|s| !s.is_empty());

        Some(IdentifierMatch { id, scope })
    }

    /// Substring lookup on the identifier column (and link column), newest first.
    pub fn template(&self, found: &IdentifierMatch) -> QueryTemplate {
        let c = &self.config;
        let id = escape_like(&found.id);

        let mut id_terms = vec![
            format!("{}::text = '{}'", c.id_column, found.id),
            format!("{}::text LIKE '%{}%' ESCAPE '\\'", c.id_column, id),
        ];
        if let Some(link) = &c.link_column {
            id_terms.push(format!(
                "{} LIKE '%{}{}%' ESCAPE '\\'",
                link,
                escape_like(&c.link_segment),
                id
            ));
        }

        let mut predicates = vec![format!("({})", id_terms.join(" OR "))];
        if let (Some(scope), Some(column)) = (&found.scope, &c.scope_column) {
            predicates.push(format!("{}::text ILIKE '%{}%' ESCAPE '\\'", column, escape_like(scope)));
        }

        let columns = if c.columns.is_empty() {
            "*".to_string()
        } else {
            c.columns.join(", ")
        };

        QueryTemplate::new(format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} DESC NULLS LAST LIMIT {}",
            columns,
            c.table,
            predicates.join(" AND "),
            c.order_column,
            c.limit.max(1)
        ))
    }
}

/// Keep only characters that cannot break out of a string literal.
pub fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        .collect()
}

/// Escape LIKE wildcards (and the escape character itself).
pub fn escape_like(token: &str) -> String {
    let mut out = String::with_capacity(token.len());
    for c in token.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
