//! Extraction Engine
//!
//! Recovers a single candidate SQL statement from raw generator text. The
//! generator is asked for structured JSON but frequently answers with fenced
//! code blocks, prose, or a bare statement, so extraction runs an ordered
//! list of strategies and keeps the best-confidence candidate.
//!
//! Pure transformation: no side effects beyond logging.

use crate::models::SqlQueryResponse;
use crate::schema;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

lazy_static! {
    static ref RE_SQL_BLOCK: Regex = Regex::new(r"(?is)```sql\s*(.*?)\s*```").unwrap();
    static ref RE_GENERIC_BLOCK: Regex = Regex::new(r"(?is)```\s*(SELECT.*?)\s*```").unwrap();
    static ref RE_SELECT: Regex =
        Regex::new(r"(?is)\b(SELECT\s+.*?(?:LIMIT\s+\d+|;|$))").unwrap();
    static ref RE_MULTILINE_SELECT: Regex =
        Regex::new(r#"(?is)(SELECT\s+[^"]*?(?:LIMIT\s+\d+|;|$))"#).unwrap();
    static ref RE_JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
    static ref RE_JSON_SQL_TIGHT: Regex =
        Regex::new(r#"(?s)\{[^{}]*"sql_query"[^{}]*\}"#).unwrap();
    static ref RE_JSON_SQL_LOOSE: Regex =
        Regex::new(r#"(?s)\{.*?"sql_query".*?\}"#).unwrap();

    // Cleanup patterns applied before a candidate is accepted.
    static ref RE_LINE_COMMENT: Regex = Regex::new(r"(?m)\s*--[^\n]*").unwrap();
    static ref RE_BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    // Only strip a tail that is recognizably the rest of the JSON contract;
    // a bare quote-comma-quote would eat double-quoted identifiers.
    static ref RE_JSON_TAIL: Regex = Regex::new(
        r#"(?s)"\s*,\s*"(?:query_type|confidence|explanation|table_mapping|field_mapping|estimated_results|warnings)".*$"#
    )
    .unwrap();
    static ref RE_WHITESPACE: Regex = Regex::new(r"\s+").unwrap();

    static ref RE_LIMIT: Regex = Regex::new(r"(?i)\bLIMIT\b").unwrap();
    static ref RE_WHERE: Regex = Regex::new(r"(?i)\bWHERE\b").unwrap();
    static ref RE_FROM: Regex = Regex::new(r"(?i)\bFROM\b").unwrap();
    static ref RE_SELECT_STAR: Regex = Regex::new(r"(?i)SELECT\s+\*").unwrap();
}

/// Strategy that produced an accepted candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    /// Full structured response matching the expected JSON contract.
    StructuredJson,
    /// `sql_query` field inside a loosely matched JSON fragment.
    JsonSqlField,
    /// Fenced block tagged ```sql.
    SqlCodeBlock,
    /// Generic fenced block whose content begins with SELECT.
    GenericCodeBlock,
    /// Bare SELECT statement up to a terminator or LIMIT clause.
    SelectStatement,
    /// Multi-line SELECT recovered from surrounding prose.
    MultilineSelect,
}

impl ExtractionMethod {
    /// Base confidence weight of the strategy.
    pub fn weight(&self) -> f64 {
        match self {
            ExtractionMethod::StructuredJson => 1.0,
            ExtractionMethod::JsonSqlField => 0.9,
            ExtractionMethod::SqlCodeBlock => 0.8,
            ExtractionMethod::GenericCodeBlock => 0.7,
            ExtractionMethod::SelectStatement => 0.6,
            ExtractionMethod::MultilineSelect => 0.5,
        }
    }
}

/// Candidate recovered by one strategy.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub sql: String,
    pub method: ExtractionMethod,
    pub confidence: f64,
    /// Structured metadata, present only when the full contract parsed.
    pub structured: Option<SqlQueryResponse>,
}

/// Outcome of one extraction pass. Immutable once produced.
#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub success: bool,
    pub sql_query: Option<String>,
    pub method: Option<ExtractionMethod>,
    pub confidence: f64,
    pub raw_response: String,
    pub error_message: Option<String>,
    pub structured: Option<SqlQueryResponse>,
}

type Strategy = fn(&str) -> Option<Candidate>;

/// Ordered strategies, highest confidence weight first.
const STRATEGIES: [Strategy; 6] = [
    try_structured_json,
    try_json_sql_field,
    try_sql_code_block,
    try_generic_code_block,
    try_select_statement,
    try_multiline_select,
];

/// Stateless extraction engine.
#[derive(Debug, Clone, Default)]
pub struct SqlExtractor;

impl SqlExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Extract the best SQL candidate from a raw generator response.
    ///
    /// Strategies run in order; the fold keeps the highest-confidence
    /// accepted candidate and stops early once confidence reaches 0.9.
    pub fn extract(&self, response: &str) -> ExtractionResult {
        debug!(response_len = response.len(), "starting SQL extraction");

        let mut best: Option<Candidate> = None;
        for strategy in STRATEGIES {
            if let Some(candidate) = strategy(response) {
                debug!(
                    method = ?candidate.method,
                    confidence = candidate.confidence,
                    "strategy produced candidate"
                );
                let better = best
                    .as_ref()
                    .map(|b| candidate.confidence > b.confidence)
                    .unwrap_or(true);
                if better {
                    best = Some(candidate);
                }
                if best.as_ref().map(|b| b.confidence).unwrap_or(0.0) >= 0.9 {
                    break;
                }
            }
        }

        match best {
            Some(candidate) => ExtractionResult {
                success: true,
                sql_query: Some(candidate.sql),
                method: Some(candidate.method),
                confidence: candidate.confidence,
                raw_response: response.to_string(),
                error_message: None,
                structured: candidate.structured,
            },
            None => ExtractionResult {
                success: false,
                sql_query: None,
                method: None,
                confidence: 0.0,
                raw_response: response.to_string(),
                error_message: Some(
                    "no strategy recovered a valid read-only SQL statement \
                     (tried structured JSON, sql_query field, fenced blocks, bare SELECT)"
                        .to_string(),
                ),
                structured: None,
            },
        }
    }

    /// All distinct accepted candidates, best first. Used by diagnostics.
    pub fn extract_candidates(&self, response: &str) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for strategy in STRATEGIES {
            if let Some(candidate) = strategy(response) {
                let duplicate = candidates
                    .iter()
                    .any(|c| c.sql.eq_ignore_ascii_case(&candidate.sql));
                if !duplicate {
                    candidates.push(candidate);
                }
            }
        }
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }
}

/// Normalize a raw candidate: strip comments, trailing JSON fragments, the
/// trailing statement terminator, and collapse whitespace.
pub fn clean_sql(sql: &str) -> String {
    let mut cleaned = sql.trim().to_string();
    cleaned = RE_LINE_COMMENT.replace_all(&cleaned, "\n").to_string();
    cleaned = RE_BLOCK_COMMENT.replace_all(&cleaned, "").to_string();
    cleaned = RE_JSON_TAIL.replace_all(&cleaned, "").to_string();
    cleaned = RE_WHITESPACE.replace_all(&cleaned, " ").to_string();
    cleaned = cleaned.trim().trim_end_matches(';').trim().to_string();
    cleaned
}

/// Acceptance gate every candidate must pass: non-trivial length, read-only
/// prefix, a FROM clause, and no write/DDL keyword.
pub fn is_valid_sql_shape(sql: &str) -> bool {
    if sql.len() < 10 {
        return false;
    }
    let upper = sql.trim().to_uppercase();
    if !upper.starts_with("SELECT") {
        return false;
    }
    if !RE_FROM.is_match(sql) {
        return false;
    }
    schema::find_forbidden_keyword(sql).is_none()
}

/// Nudge the base weight upward for quality signals, bounded at 1.0.
fn pattern_confidence(sql: &str, method: ExtractionMethod) -> f64 {
    let mut bonus = 0.0;
    if RE_LIMIT.is_match(sql) {
        bonus += 0.1;
    }
    if RE_WHERE.is_match(sql) {
        bonus += 0.1;
    }
    if !RE_SELECT_STAR.is_match(sql) {
        bonus += 0.05;
    }
    if (20..=500).contains(&sql.len()) {
        bonus += 0.05;
    }
    (method.weight() + bonus).min(1.0)
}

fn try_structured_json(response: &str) -> Option<Candidate> {
    let json_str = RE_JSON_OBJECT.find(response)?.as_str();
    let parsed: SqlQueryResponse = serde_json::from_str(json_str).ok()?;
    if !parsed.is_plausible() {
        return None;
    }
    let sql = clean_sql(&parsed.sql_query);
    if !is_valid_sql_shape(&sql) {
        return None;
    }
    Some(Candidate {
        sql,
        method: ExtractionMethod::StructuredJson,
        confidence: ExtractionMethod::StructuredJson.weight(),
        structured: Some(parsed),
    })
}

fn try_json_sql_field(response: &str) -> Option<Candidate> {
    for pattern in [&*RE_JSON_SQL_TIGHT, &*RE_JSON_SQL_LOOSE] {
        for m in pattern.find_iter(response) {
            let Ok(value) = serde_json::from_str::<serde_json::Value>(m.as_str()) else {
                continue;
            };
            let Some(raw_sql) = value.get("sql_query").and_then(|v| v.as_str()) else {
                continue;
            };
            if raw_sql.trim().is_empty() {
                continue;
            }
            let sql = clean_sql(raw_sql);
            if is_valid_sql_shape(&sql) {
                return Some(Candidate {
                    sql,
                    method: ExtractionMethod::JsonSqlField,
                    confidence: ExtractionMethod::JsonSqlField.weight(),
                    structured: None,
                });
            }
        }
    }
    None
}

fn try_sql_code_block(response: &str) -> Option<Candidate> {
    extract_with_pattern(response, &RE_SQL_BLOCK, ExtractionMethod::SqlCodeBlock)
}

fn try_generic_code_block(response: &str) -> Option<Candidate> {
    extract_with_pattern(response, &RE_GENERIC_BLOCK, ExtractionMethod::GenericCodeBlock)
}

fn try_select_statement(response: &str) -> Option<Candidate> {
    if bare_recovery_disqualified(response) {
        return None;
    }
    extract_with_pattern(response, &RE_SELECT, ExtractionMethod::SelectStatement)
}

fn try_multiline_select(response: &str) -> Option<Candidate> {
    if bare_recovery_disqualified(response) {
        return None;
    }
    extract_with_pattern(response, &RE_MULTILINE_SELECT, ExtractionMethod::MultilineSelect)
}

/// Bare-pattern recovery has no trusted boundary around the statement, so a
/// write/DDL keyword anywhere in the surrounding text disqualifies the whole
/// response. Fenced blocks and JSON fields carry their own boundaries and
/// are checked per candidate instead.
fn bare_recovery_disqualified(response: &str) -> bool {
    schema::find_forbidden_keyword(response).is_some()
}

fn extract_with_pattern(
    response: &str,
    pattern: &Regex,
    method: ExtractionMethod,
) -> Option<Candidate> {
    for caps in pattern.captures_iter(response) {
        let raw = caps.get(1)?.as_str();
        let sql = clean_sql(raw);
        if is_valid_sql_shape(&sql) {
            let confidence = pattern_confidence(&sql, method);
            return Some(Candidate {
                sql,
                method,
                confidence,
                structured: None,
            });
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> SqlExtractor {
        SqlExtractor::new()
    }

    #[test]
    fn test_structured_json_response() {
        let response = r#"Here is the query you asked for:
        {
            "sql_query": "SELECT kcstmr, mname FROM CO01M WHERE mname LIKE '%test%' LIMIT 10",
            "query_type": "patient_info",
            "confidence": "high",
            "explanation": "patient lookup by name"
        }"#;
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::StructuredJson));
        assert_eq!(result.confidence, 1.0);
        assert!(result.structured.is_some());
        assert!(result.sql_query.unwrap().starts_with("SELECT"));
    }

    #[test]
    fn test_json_sql_field_without_full_contract() {
        let response = r#"{"sql_query": "SELECT kcstmr, mname FROM CO01M LIMIT 5", "note": "partial"}"#;
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::JsonSqlField));
        assert_eq!(result.confidence, 0.9);
    }

    #[test]
    fn test_sql_code_block() {
        let response = "Sure, here you go:\n```sql\nSELECT kcstmr, hval FROM CO18H WHERE hitem = 'GLU' LIMIT 100\n```\nHope that helps.";
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::SqlCodeBlock));
        assert!(result.confidence >= 0.8);
    }

    #[test]
    fn test_generic_code_block() {
        let response = "```\nSELECT mname, msex FROM CO01M LIMIT 20\n```";
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::GenericCodeBlock));
    }

    #[test]
    fn test_bare_select_statement() {
        let response =
            "You can run SELECT kcstmr, mname FROM CO01M WHERE msex = '1' LIMIT 50 to get them.";
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::SelectStatement));
        // LIMIT + WHERE + explicit columns + reasonable length bonuses apply
        assert!(result.confidence > 0.6);
    }

    #[test]
    fn test_comment_and_terminator_cleanup() {
        let response = "```sql\nSELECT kcstmr, mname -- patient name\nFROM CO01M /* main table */ LIMIT 10;\n```";
        let result = extractor().extract(response);
        assert!(result.success);
        let sql = result.sql_query.unwrap();
        assert!(!sql.contains("--"));
        assert!(!sql.contains("/*"));
        assert!(!sql.ends_with(';'));
        assert_eq!(sql, "SELECT kcstmr, mname FROM CO01M LIMIT 10");
    }

    #[test]
    fn test_rejects_write_statements() {
        let result = extractor().extract("```sql\nDROP TABLE CO01M\n```");
        assert!(!result.success);
        assert!(result.error_message.is_some());

        let result = extractor().extract("DELETE FROM CO01M WHERE kcstmr = '1'");
        assert!(!result.success);
    }

    #[test]
    fn test_rejects_mixed_write_and_read() {
        // A destructive statement glued onto a SELECT in bare text means the
        // whole response is untrustworthy; nothing may be recovered from it.
        let result = extractor().extract("DROP TABLE CO01M; SELECT kcstmr FROM CO01M LIMIT 5");
        assert!(!result.success);
        assert!(result.sql_query.is_none());

        let result =
            extractor().extract("first TRUNCATE CO01M, then SELECT mname FROM CO01M LIMIT 9");
        assert!(!result.success);
    }

    #[test]
    fn test_fenced_block_unaffected_by_surrounding_prose_keywords() {
        // The fence is a trusted boundary: prose mentioning a write keyword
        // outside it does not disqualify the fenced statement.
        let response =
            "Never run DROP on this data. Use:\n```sql\nSELECT kcstmr FROM CO01M LIMIT 5\n```";
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::SqlCodeBlock));
        assert_eq!(result.sql_query.unwrap(), "SELECT kcstmr FROM CO01M LIMIT 5");
    }

    #[test]
    fn test_double_quoted_identifiers_survive_cleanup() {
        let response = "```sql\nSELECT \"kcstmr\", \"mname\" FROM CO01M LIMIT 5\n```";
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(
            result.sql_query.unwrap(),
            "SELECT \"kcstmr\", \"mname\" FROM CO01M LIMIT 5"
        );

        // The contract tail is still stripped from loose captures.
        let cleaned =
            clean_sql("SELECT kcstmr FROM CO01M\", \"query_type\": \"patient_info\"}");
        assert_eq!(cleaned, "SELECT kcstmr FROM CO01M");
    }

    #[test]
    fn test_rejects_short_and_garbage_input() {
        assert!(!extractor().extract("SELECT 1").success);
        assert!(!extractor().extract("I cannot generate SQL for that.").success);
        assert!(!extractor().extract("").success);
    }

    #[test]
    fn test_accepted_candidates_always_read_only() {
        // Property over adversarial inputs: every accepted candidate starts
        // with SELECT and carries no write/DDL keyword.
        let inputs = [
            "```sql\nSELECT kcstmr FROM CO01M LIMIT 3\n```",
            "maybe TRUNCATE CO01M but also SELECT mname, msex FROM CO01M LIMIT 9",
            r#"{"sql_query": "SELECT hval FROM CO18H WHERE hitem='HbA1c' LIMIT 10"}"#,
            "INSERT INTO CO01M VALUES ('x'); nothing else",
            "```\nSELECT * FROM CO18H\n```",
        ];
        for input in inputs {
            let result = extractor().extract(input);
            if result.success {
                let sql = result.sql_query.unwrap();
                assert!(sql.to_uppercase().starts_with("SELECT"), "input: {}", input);
                assert!(
                    schema::find_forbidden_keyword(&sql).is_none(),
                    "input: {}",
                    input
                );
            }
        }
    }

    #[test]
    fn test_best_candidate_wins() {
        // Both a code block and a structured response present: the
        // structured response has the higher weight and must win.
        let response = r#"
```sql
SELECT mname FROM CO01M LIMIT 5
```
{"sql_query": "SELECT kcstmr, mname FROM CO01M WHERE msex = '0' LIMIT 10",
 "query_type": "patient_info", "confidence": "high", "explanation": "female patients"}
"#;
        let result = extractor().extract(response);
        assert!(result.success);
        assert_eq!(result.method, Some(ExtractionMethod::StructuredJson));
    }

    #[test]
    fn test_extract_candidates_sorted_and_deduped() {
        let response = "```sql\nSELECT kcstmr, mname FROM CO01M WHERE msex='1' LIMIT 5\n```";
        let candidates = extractor().extract_candidates(response);
        assert!(!candidates.is_empty());
        for pair in candidates.windows(2) {
            assert!(pair[0].confidence >= pair[1].confidence);
        }
        let mut seen: Vec<String> = Vec::new();
        for c in &candidates {
            let upper = c.sql.to_uppercase();
            assert!(!seen.contains(&upper));
            seen.push(upper);
        }
    }
}
