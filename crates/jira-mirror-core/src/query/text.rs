//! Free-text front-end and Okapi BM25 scoring.
//!
//! Scores follow the usual BM25 definition (k1 = 1.2, b = 0.75), with
//! `idf = ln(1 + (N - n + 0.5) / (n + 0.5))`. SQLite's FTS5 `bm25()` uses
//! the same k1 and b but drops the `1 +` and floors idf at a tiny positive
//! value, so absolute scores differ between stores and multi-term
//! orderings can occasionally differ too.

use std::collections::HashMap;

use crate::fields::FieldCatalog;
use crate::models::NormalizedIssue;
use crate::normalize::is_issue_key;

use super::{CompiledQuery, Predicate, QueryError, QueryFrontend, QueryMode, Ranking};

pub const BM25_K1: f64 = 1.2;
pub const BM25_B: f64 = 0.75;

/// Words in a snippet, and how many of them precede the first match.
const SNIPPET_WORDS: usize = 16;
const SNIPPET_LEAD: usize = 4;

/// Split text into lowercase alphanumeric runs. Issue-key-like words
/// (`PROJ-12`) stay one token.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in text.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        if word.is_empty() {
            continue;
        }
        if is_issue_key(&word.to_uppercase()) {
            tokens.push(word.to_lowercase());
            continue;
        }
        tokens.extend(
            word.split('-')
                .filter(|w| !w.is_empty())
                .map(str::to_lowercase),
        );
    }
    tokens
}

/// A parsed free-text query: all terms must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextQuery {
    pub terms: Vec<String>,
    /// Treat the last term as a prefix (type-ahead).
    pub prefix_last: bool,
    /// Upper-cased issue key when the query names one; it matches the key
    /// exactly and ranks first.
    pub key_hint: Option<String>,
}

impl TextQuery {
    pub fn parse(raw: &str, prefix_last: bool) -> Self {
        let terms = tokenize(raw);
        let key_hint = terms
            .iter()
            .map(|t| t.to_uppercase())
            .find(|t| is_issue_key(t));
        Self {
            terms,
            prefix_last,
            key_hint,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    fn term_matches(&self, idx: usize, token: &str) -> bool {
        let term = &self.terms[idx];
        if self.prefix_last && idx + 1 == self.terms.len() {
            token.starts_with(term.as_str())
        } else {
            token == term
        }
    }

    /// Whether every term occurs in `tokens`.
    pub fn matches_tokens(&self, tokens: &[String]) -> bool {
        !self.terms.is_empty()
            && (0..self.terms.len()).all(|i| tokens.iter().any(|t| self.term_matches(i, t)))
    }

    fn hits(&self, token: &str) -> bool {
        (0..self.terms.len()).any(|i| self.term_matches(i, token))
    }

    /// An excerpt of the issue's own text around the first matching word,
    /// matches wrapped in `>>>` and `<<<`. Summary, then description, then
    /// comments; `None` when only the key matched.
    pub fn snippet(&self, issue: &NormalizedIssue) -> Option<String> {
        let comments = issue.comments_text();
        let sources = [
            Some(issue.summary.as_str()),
            issue.description.as_deref(),
            Some(comments.as_str()),
        ];
        for text in sources.into_iter().flatten() {
            let words: Vec<&str> = text.split_whitespace().collect();
            let marked: Vec<bool> = words
                .iter()
                .map(|w| tokenize(w).iter().any(|t| self.hits(t)))
                .collect();
            let Some(first) = marked.iter().position(|m| *m) else {
                continue;
            };
            let start = first.saturating_sub(SNIPPET_LEAD);
            let end = (start + SNIPPET_WORDS).min(words.len());
            let body = (start..end)
                .map(|i| {
                    if marked[i] {
                        format!(">>>{}<<<", words[i])
                    } else {
                        words[i].to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(" ");
            return Some(format!(
                "{}{}{}",
                if start > 0 { "..." } else { "" },
                body,
                if end < words.len() { "..." } else { "" }
            ));
        }
        None
    }

    /// Render as an FTS5 MATCH expression: quoted phrases joined by AND,
    /// the last one with `*` for prefix queries.
    pub fn fts_expression(&self) -> String {
        let last = self.terms.len().saturating_sub(1);
        self.terms
            .iter()
            .enumerate()
            .map(|(i, t)| {
                let quoted = format!("\"{}\"", t.replace('"', "\"\""));
                if self.prefix_last && i == last {
                    format!("{}*", quoted)
                } else {
                    quoted
                }
            })
            .collect::<Vec<_>>()
            .join(" AND ")
    }
}

/// Document statistics for BM25 over an in-memory corpus.
#[derive(Debug, Clone, Default)]
pub struct CorpusStats {
    pub doc_count: usize,
    pub avg_len: f64,
    doc_freq: HashMap<String, usize>,
}

impl CorpusStats {
    pub fn build<'a>(docs: impl IntoIterator<Item = &'a [String]>) -> Self {
        let mut stats = CorpusStats::default();
        let mut total_len = 0usize;
        for doc in docs {
            stats.doc_count += 1;
            total_len += doc.len();
            let mut unique: Vec<&String> = doc.iter().collect();
            unique.sort();
            unique.dedup();
            for t in unique {
                *stats.doc_freq.entry(t.clone()).or_insert(0) += 1;
            }
        }
        if stats.doc_count > 0 {
            stats.avg_len = total_len as f64 / stats.doc_count as f64;
        }
        stats
    }

    fn idf(&self, docs_with_term: usize) -> f64 {
        let n = self.doc_count as f64;
        let df = docs_with_term as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    fn docs_matching(&self, query: &TextQuery, idx: usize) -> usize {
        self.doc_freq
            .iter()
            .filter(|(t, _)| query.term_matches(idx, t))
            .map(|(_, n)| *n)
            .max()
            .unwrap_or(0)
    }
}

/// BM25 score of one document (already tokenized) for `query`. Higher is
/// more relevant.
pub fn bm25(query: &TextQuery, doc: &[String], stats: &CorpusStats) -> f64 {
    if doc.is_empty() || stats.avg_len == 0.0 {
        return 0.0;
    }
    let len_norm = 1.0 - BM25_B + BM25_B * doc.len() as f64 / stats.avg_len;
    (0..query.terms.len())
        .map(|i| {
            let tf = doc.iter().filter(|t| query.term_matches(i, t)).count() as f64;
            if tf == 0.0 {
                return 0.0;
            }
            let idf = stats.idf(stats.docs_matching(query, i));
            idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * len_norm)
        })
        .sum()
}

/// Free-text front-end.
pub struct FreeText;

impl FreeText {
    fn build(raw: &str, prefix_last: bool) -> CompiledQuery {
        let query = TextQuery::parse(raw, prefix_last);
        let predicate = if query.is_empty() {
            Predicate::Nothing
        } else {
            Predicate::Text(query.clone())
        };
        CompiledQuery {
            mode: QueryMode::Natural,
            source: raw.to_string(),
            predicate,
            ranking: Ranking::Relevance(query),
        }
    }
}

impl QueryFrontend for FreeText {
    fn mode(&self) -> QueryMode {
        QueryMode::Natural
    }

    fn compile(&self, raw: &str, _catalog: &FieldCatalog) -> Result<CompiledQuery, QueryError> {
        Ok(Self::build(raw, false))
    }

    fn compile_suggest(
        &self,
        prefix: &str,
        _catalog: &FieldCatalog,
    ) -> Result<CompiledQuery, QueryError> {
        Ok(Self::build(prefix, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(s: &str) -> Vec<String> {
        tokenize(s)
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(
            toks("Login fails, see PROJ-12 (re-opened)"),
            vec!["login", "fails", "see", "proj-12", "re", "opened"]
        );
        assert!(toks("  ,,, ").is_empty());
    }

    #[test]
    fn test_key_hint() {
        let q = TextQuery::parse("proj-7 crash", false);
        assert_eq!(q.key_hint.as_deref(), Some("PROJ-7"));
        assert_eq!(TextQuery::parse("crash", false).key_hint, None);
    }

    #[test]
    fn test_fts_expression() {
        assert_eq!(
            TextQuery::parse("login saf", true).fts_expression(),
            "\"login\" AND \"saf\"*"
        );
    }

    #[test]
    fn test_matches_prefix_last() {
        let doc = toks("Login fails on Safari");
        assert!(TextQuery::parse("login saf", true).matches_tokens(&doc));
        assert!(!TextQuery::parse("login saf", false).matches_tokens(&doc));
        assert!(!TextQuery::parse("", false).matches_tokens(&doc));
    }

    fn normalized(summary: &str, description: &str) -> NormalizedIssue {
        let raw = crate::models::RawIssue(serde_json::json!({
            "key": "PROJ-7",
            "fields": {
                "summary": summary,
                "description": description,
                "created": "2024-01-01T00:00:00.000+0000",
                "updated": "2024-01-01T00:00:00.000+0000",
            }
        }));
        crate::normalize::normalize(&raw, &FieldCatalog::default()).unwrap()
    }

    #[test]
    fn test_snippet_keeps_stored_text() {
        let issue = normalized(
            "Crash report",
            "Safari shows a Blank Page, then crashes. Reload does not help and the console \
             stays empty for every user we asked about it so far.",
        );
        assert_eq!(
            TextQuery::parse("blank", false).snippet(&issue).as_deref(),
            Some("Safari shows a >>>Blank<<< Page, then crashes. Reload does not help and the console stays empty...")
        );
        assert_eq!(
            TextQuery::parse("crash", false).snippet(&issue).as_deref(),
            Some(">>>Crash<<< report")
        );
        let late = TextQuery::parse("asked", false).snippet(&issue).unwrap();
        assert!(late.starts_with("...for every user we >>>asked<<< about"), "got {late}");
        assert_eq!(TextQuery::parse("proj-7", false).snippet(&issue), None);
    }

    #[test]
    fn test_bm25_prefers_term_frequency_and_rarity() {
        let docs = vec![
            toks("crash crash on startup"),
            toks("crash when saving"),
            toks("typo in settings page"),
        ];
        let stats = CorpusStats::build(docs.iter().map(|d| d.as_slice()));
        let q = TextQuery::parse("crash", false);
        let s0 = bm25(&q, &docs[0], &stats);
        let s1 = bm25(&q, &docs[1], &stats);
        assert!(s0 > s1);
        assert_eq!(bm25(&q, &docs[2], &stats), 0.0);

        let rare = TextQuery::parse("saving", false);
        assert!(bm25(&rare, &docs[1], &stats) > s1);
    }

    #[test]
    fn test_empty_query_matches_nothing() {
        let compiled = FreeText
            .compile("   ", &FieldCatalog::default())
            .unwrap();
        assert!(matches!(compiled.predicate, Predicate::Nothing));
    }
}
