/// Query templates, materialized statements and row sets
///
/// A `QueryTemplate` is what the synthesizer hands back: SQL text that may
/// contain the `{prompt_vector}` placeholder standing for "the embedding of
/// the current question". Templates are immutable; materialization always
/// produces a new `MaterializedQuery`, so the same template can be replayed
/// with a different embedding or after a different strategy.

pub mod materialize;
pub mod shrink;
pub mod sql;

use serde::Serialize;

pub use materialize::Materializer;
pub use shrink::{Row, RowSet, shrink_rows};

/// Literal token the synthesizer uses for the question embedding.
pub const PLACEHOLDER: &str = "{prompt_vector}";

/// Synthesized SQL, possibly holding the similarity placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryTemplate {
    raw_text: String,
    has_similarity_placeholder: bool,
}

impl QueryTemplate {
    pub fn new(raw_text: impl Into<String>) -> Self {
        let raw_text = raw_text.into();
        let has_similarity_placeholder = raw_text.contains(PLACEHOLDER);
        QueryTemplate {
            raw_text,
            has_similarity_placeholder,
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn has_similarity_placeholder(&self) -> bool {
        self.has_similarity_placeholder
    }
}

/// A statement ready to run.
///
/// Rows are read over the simple-query protocol, so the embedding is inlined
/// as a `'[...]'::vector` literal rather than bound; `embedding_dims` records
/// that it is there. Use `redacted()` for anything that leaves the process.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedQuery {
    pub text: String,
    /// Dimension of the inlined embedding, if similarity ordering is active
    pub embedding_dims: Option<usize>,
    /// True when the recency fallback ordering was added
    pub recency_fallback: bool,
}

impl MaterializedQuery {
    pub fn redacted(&self) -> String {
        sql::redact(&self.text)
    }
}
