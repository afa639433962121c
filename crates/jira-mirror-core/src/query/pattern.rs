//! Pattern front-end: case-insensitive regular expressions over text fields.
//!
//! The pattern is validated in full before any row is scanned. Evaluation
//! is bounded by the caller's deadline, which the stores check per row.

use regex::{Regex, RegexBuilder};
use regex_syntax::ast::parse::Parser as AstParser;

use crate::fields::{Field, FieldCatalog};

use super::{CompiledQuery, Predicate, QueryError, QueryFrontend, QueryMode, Ranking, SortSpec};

/// Compiled-program size cap; larger patterns are rejected as syntax errors.
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// A compiled pattern and the fields it is applied to.
#[derive(Debug, Clone)]
pub struct PatternQuery {
    pub regex: Regex,
    pub fields: Vec<Field>,
}

impl PatternQuery {
    pub fn new(raw: &str, fields: Vec<Field>) -> Result<Self, QueryError> {
        Ok(Self {
            regex: compile_regex(raw)?,
            fields,
        })
    }
}

/// Validate and compile `raw`, reporting the byte offset of the first error.
pub fn compile_regex(raw: &str) -> Result<Regex, QueryError> {
    if raw.is_empty() {
        return Err(QueryError::syntax(0, "empty pattern"));
    }
    if let Err(e) = AstParser::new().parse(raw) {
        return Err(QueryError::syntax(e.span().start.offset, e.kind().to_string()));
    }
    RegexBuilder::new(raw)
        .case_insensitive(true)
        .size_limit(REGEX_SIZE_LIMIT)
        .build()
        .map_err(|e| QueryError::syntax(0, e.to_string()))
}

/// Pattern front-end.
pub struct Pattern;

impl QueryFrontend for Pattern {
    fn mode(&self) -> QueryMode {
        QueryMode::Regex
    }

    fn compile(&self, raw: &str, catalog: &FieldCatalog) -> Result<CompiledQuery, QueryError> {
        let query = PatternQuery::new(raw, Field::pattern_defaults(catalog))?;
        Ok(CompiledQuery {
            mode: QueryMode::Regex,
            source: raw.to_string(),
            predicate: Predicate::Pattern(query),
            ranking: Ranking::Sort(SortSpec::updated_desc()),
        })
    }
}
