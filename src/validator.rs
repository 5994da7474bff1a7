//! Security Validator
//!
//! AST-based validation of an extracted SQL statement against the fixed
//! schema policy: read-only prefix, single statement, keyword blacklist,
//! table whitelist, sensitive-field blacklist. Table whitelisting fails
//! closed on anything unanticipated; blacklisting dangerous tables would
//! fail open.
//!
//! `validate` is a pure function of the statement text: same input, same
//! outcome, no side effects.

use crate::schema;
use serde::{Deserialize, Serialize};
use sqlparser::ast::{
    visit_relations, Expr, FunctionArg, FunctionArgExpr, Query, SelectItem, SetExpr, Statement,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::collections::BTreeSet;
use std::ops::ControlFlow;
use tracing::debug;

/// Why a statement was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationKind {
    EmptyStatement,
    NotReadOnly,
    MultipleStatements,
    ForbiddenKeyword,
    UnknownTable,
    SensitiveField,
}

/// Result of validating one statement. Derived deterministically from the
/// SQL text; callers inspect fields instead of catching errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub is_syntactically_valid: bool,
    pub is_policy_safe: bool,
    pub violation: Option<ViolationKind>,
    pub message: Option<String>,
    pub suggestions: Vec<String>,
    pub resolved_tables: BTreeSet<String>,
    pub resolved_fields: BTreeSet<String>,
}

impl ValidationOutcome {
    fn rejected(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            is_syntactically_valid: true,
            is_policy_safe: false,
            violation: Some(kind),
            message: Some(message.into()),
            suggestions: Vec::new(),
            resolved_tables: BTreeSet::new(),
            resolved_fields: BTreeSet::new(),
        }
    }

    fn syntax_error(message: impl Into<String>) -> Self {
        Self {
            is_syntactically_valid: false,
            is_policy_safe: false,
            violation: None,
            message: Some(message.into()),
            suggestions: vec!["check the SQL grammar and resubmit".to_string()],
            resolved_tables: BTreeSet::new(),
            resolved_fields: BTreeSet::new(),
        }
    }
}

/// Stateless AST validator.
#[derive(Debug, Clone, Default)]
pub struct SqlValidator;

impl SqlValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate a statement against the read-only policy.
    pub fn validate(&self, sql: &str) -> ValidationOutcome {
        debug!(sql = %sql.chars().take(120).collect::<String>(), "validating SQL");

        // Step 1: cheap rejections before paying for a parse.
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return ValidationOutcome::rejected(ViolationKind::EmptyStatement, "empty SQL statement");
        }
        if !trimmed.to_uppercase().starts_with("SELECT") {
            return ValidationOutcome::rejected(
                ViolationKind::NotReadOnly,
                "only SELECT statements are permitted",
            );
        }
        if trimmed.matches(';').count() > 1 || trimmed.trim_end_matches(';').contains(';') {
            return ValidationOutcome::rejected(
                ViolationKind::MultipleStatements,
                "multiple statements are not permitted",
            );
        }
        if let Some(keyword) = schema::find_forbidden_keyword(trimmed) {
            return ValidationOutcome::rejected(
                ViolationKind::ForbiddenKeyword,
                format!("forbidden keyword: {}", keyword),
            );
        }

        // Step 2: parse. Failure here is a syntax outcome, not a security
        // outcome, so the retry layer can ask the generator to fix grammar.
        let dialect = GenericDialect {};
        let statements = match Parser::parse_sql(&dialect, trimmed) {
            Ok(statements) => statements,
            Err(err) => return ValidationOutcome::syntax_error(format!("parse failed: {}", err)),
        };
        if statements.is_empty() {
            return ValidationOutcome::rejected(ViolationKind::EmptyStatement, "empty SQL statement");
        }
        if statements.len() > 1 {
            return ValidationOutcome::rejected(
                ViolationKind::MultipleStatements,
                "multiple statements are not permitted",
            );
        }
        let query = match &statements[0] {
            Statement::Query(query) => query,
            other => {
                return ValidationOutcome::rejected(
                    ViolationKind::NotReadOnly,
                    format!("statement is not a query: {}", statement_kind(other)),
                )
            }
        };

        // Step 3: every keyword token anywhere in the statement, not just
        // the prefix, is checked against the blacklist.
        if let Some(keyword) = self.scan_keyword_tokens(trimmed) {
            return ValidationOutcome::rejected(
                ViolationKind::ForbiddenKeyword,
                format!("forbidden keyword: {}", keyword),
            );
        }

        // Step 4: table whitelist, exact case-insensitive match.
        let tables = collect_tables(query);
        for table in &tables {
            if !schema::is_allowed_table(table) {
                return ValidationOutcome::rejected(
                    ViolationKind::UnknownTable,
                    format!(
                        "table '{}' is not permitted; allowed tables: {}",
                        table,
                        schema::ALLOWED_TABLES.join(", ")
                    ),
                );
            }
        }

        // Step 5: sensitive fields in the projection.
        let fields = collect_projection_fields(query);
        for field in &fields {
            if schema::is_sensitive_field(field) {
                return ValidationOutcome::rejected(
                    ViolationKind::SensitiveField,
                    format!("field '{}' is protected and cannot be selected", field),
                );
            }
        }

        // Step 6: non-fatal advisories.
        let mut suggestions = Vec::new();
        if query.limit.is_none() {
            suggestions.push("add a LIMIT clause to bound the result set".to_string());
        }
        if !query_has_filter(query) {
            suggestions.push("add a WHERE clause to narrow the query".to_string());
        }
        if projection_is_wildcard(query) {
            suggestions.push("select explicit columns instead of *".to_string());
        }

        ValidationOutcome {
            is_syntactically_valid: true,
            is_policy_safe: true,
            violation: None,
            message: None,
            suggestions,
            resolved_tables: tables,
            resolved_fields: fields,
        }
    }

    /// Walk every keyword token and report the first blacklisted one.
    fn scan_keyword_tokens(&self, sql: &str) -> Option<String> {
        let dialect = GenericDialect {};
        let tokens = Tokenizer::new(&dialect, sql).tokenize().ok()?;
        for token in tokens {
            if let Token::Word(word) = token {
                let upper = word.value.to_uppercase();
                if schema::FORBIDDEN_KEYWORDS.contains(&upper.as_str()) {
                    return Some(upper);
                }
            }
        }
        None
    }
}

fn statement_kind(statement: &Statement) -> &'static str {
    match statement {
        Statement::Insert { .. } => "INSERT",
        Statement::Update { .. } => "UPDATE",
        Statement::Delete { .. } => "DELETE",
        Statement::Drop { .. } => "DROP",
        Statement::CreateTable { .. } => "CREATE TABLE",
        _ => "non-SELECT",
    }
}

/// Every table reference anywhere in the query, normalized to uppercase.
/// The AST visitor reaches relations inside joins, derived tables, set
/// operations, and subqueries in any expression position (WHERE, HAVING,
/// projection, GROUP BY, ORDER BY). CTE names surface as relations too, so
/// the whitelist fails closed on them.
fn collect_tables(query: &Query) -> BTreeSet<String> {
    let mut tables = BTreeSet::new();
    let _ = visit_relations(query, |name| {
        if let Some(ident) = name.0.last() {
            tables.insert(ident.value.to_uppercase());
        }
        ControlFlow::<()>::Continue(())
    });
    tables
}

/// Column identifiers in the projection, normalized to lowercase. For
/// `table.column` references only the column part is kept.
fn collect_projection_fields(query: &Query) -> BTreeSet<String> {
    let mut fields = BTreeSet::new();
    collect_fields_from_set_expr(&query.body, &mut fields);
    fields
}

fn collect_fields_from_set_expr(body: &SetExpr, fields: &mut BTreeSet<String>) {
    match body {
        SetExpr::Select(select) => {
            for item in &select.projection {
                match item {
                    SelectItem::UnnamedExpr(expr) => collect_expr_fields(expr, fields),
                    SelectItem::ExprWithAlias { expr, .. } => collect_expr_fields(expr, fields),
                    SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _) => {}
                }
            }
        }
        SetExpr::Query(query) => collect_fields_from_set_expr(&query.body, fields),
        SetExpr::SetOperation { left, right, .. } => {
            collect_fields_from_set_expr(left, fields);
            collect_fields_from_set_expr(right, fields);
        }
        _ => {}
    }
}

fn collect_expr_fields(expr: &Expr, fields: &mut BTreeSet<String>) {
    match expr {
        Expr::Identifier(ident) => {
            fields.insert(ident.value.to_lowercase());
        }
        Expr::CompoundIdentifier(idents) => {
            if let Some(last) = idents.last() {
                fields.insert(last.value.to_lowercase());
            }
        }
        Expr::Function(func) => {
            for arg in &func.args {
                let arg_expr = match arg {
                    FunctionArg::Unnamed(inner) => inner,
                    FunctionArg::Named { arg, .. } => arg,
                };
                if let FunctionArgExpr::Expr(inner) = arg_expr {
                    collect_expr_fields(inner, fields);
                }
            }
        }
        Expr::BinaryOp { left, right, .. } => {
            collect_expr_fields(left, fields);
            collect_expr_fields(right, fields);
        }
        Expr::UnaryOp { expr, .. } | Expr::Nested(expr) | Expr::Cast { expr, .. } => {
            collect_expr_fields(expr, fields);
        }
        // A subquery in the projection projects its inner columns outward,
        // so its projection is part of ours.
        Expr::Subquery(query) => {
            collect_fields_from_set_expr(&query.body, fields);
        }
        Expr::InSubquery { expr, subquery, .. } => {
            collect_expr_fields(expr, fields);
            collect_fields_from_set_expr(&subquery.body, fields);
        }
        Expr::Exists { subquery, .. } => {
            collect_fields_from_set_expr(&subquery.body, fields);
        }
        Expr::Case {
            operand,
            conditions,
            results,
            else_result,
        } => {
            if let Some(operand) = operand {
                collect_expr_fields(operand, fields);
            }
            for condition in conditions {
                collect_expr_fields(condition, fields);
            }
            for result in results {
                collect_expr_fields(result, fields);
            }
            if let Some(else_result) = else_result {
                collect_expr_fields(else_result, fields);
            }
        }
        _ => {}
    }
}

fn query_has_filter(query: &Query) -> bool {
    match query.body.as_ref() {
        SetExpr::Select(select) => select.selection.is_some(),
        _ => false,
    }
}

fn projection_is_wildcard(query: &Query) -> bool {
    match query.body.as_ref() {
        SetExpr::Select(select) => select
            .projection
            .iter()
            .any(|item| matches!(item, SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(_, _))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> SqlValidator {
        SqlValidator::new()
    }

    #[test]
    fn test_valid_patient_query() {
        let outcome = validator()
            .validate("SELECT kcstmr, mname FROM CO01M WHERE mname LIKE '%李%' LIMIT 10");
        assert!(outcome.is_syntactically_valid);
        assert!(outcome.is_policy_safe);
        assert!(outcome.suggestions.is_empty());
        assert!(outcome.resolved_tables.contains("CO01M"));
        assert!(outcome.resolved_fields.contains("mname"));
    }

    #[test]
    fn test_rejects_non_select_prefix() {
        let outcome = validator().validate("UPDATE CO01M SET mname = 'x'");
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::NotReadOnly));
    }

    #[test]
    fn test_rejects_multiple_statements() {
        let outcome =
            validator().validate("SELECT kcstmr FROM CO01M; SELECT kcstmr FROM CO02M");
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::MultipleStatements));
    }

    #[test]
    fn test_rejects_forbidden_keyword_anywhere() {
        let outcome =
            validator().validate("SELECT kcstmr FROM CO01M WHERE mname = 'x'; DROP TABLE CO01M");
        assert!(!outcome.is_policy_safe);
        // Caught as either multiple statements or forbidden keyword; both
        // are policy rejections and never a pass.
        assert!(outcome.violation.is_some());
    }

    #[test]
    fn test_rejects_unknown_table() {
        let outcome = validator().validate("SELECT name FROM sqlite_master LIMIT 5");
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));
        // Table names are normalized to uppercase before reporting.
        assert!(outcome
            .message
            .unwrap()
            .to_lowercase()
            .contains("sqlite_master"));
    }

    #[test]
    fn test_rejects_unknown_table_in_join() {
        let outcome = validator().validate(
            "SELECT a.kcstmr FROM CO01M a JOIN secrets s ON a.kcstmr = s.kcstmr LIMIT 5",
        );
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));
    }

    #[test]
    fn test_rejects_unknown_table_in_subquery() {
        let outcome = validator()
            .validate("SELECT kcstmr FROM (SELECT kcstmr FROM hidden_table) t LIMIT 5");
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));
    }

    #[test]
    fn test_rejects_unknown_table_in_where_subquery() {
        let outcome = validator().validate(
            "SELECT mname FROM CO01M WHERE kcstmr IN (SELECT name FROM sqlite_master) LIMIT 5",
        );
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));

        let outcome = validator().validate(
            "SELECT mname FROM CO01M WHERE EXISTS (SELECT 1 FROM secrets) LIMIT 5",
        );
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));
    }

    #[test]
    fn test_rejects_unknown_table_in_projection_subquery() {
        let outcome = validator().validate(
            "SELECT (SELECT name FROM sqlite_master LIMIT 1) AS n FROM CO01M LIMIT 5",
        );
        assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable));
    }

    #[test]
    fn test_rejects_sensitive_field() {
        let outcome =
            validator().validate("SELECT mname, mpersonid FROM CO01M WHERE kcstmr = '1' LIMIT 1");
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::SensitiveField));
        assert!(outcome.message.unwrap().contains("mpersonid"));
    }

    #[test]
    fn test_rejects_sensitive_field_qualified() {
        let outcome = validator()
            .validate("SELECT p.maddr FROM CO01M p WHERE p.kcstmr = '1' LIMIT 1");
        assert_eq!(outcome.violation, Some(ViolationKind::SensitiveField));
    }

    #[test]
    fn test_rejects_sensitive_field_in_projection_subquery() {
        let outcome = validator().validate(
            "SELECT (SELECT mpersonid FROM CO01M WHERE kcstmr = '0000001') AS v FROM CO01M LIMIT 1",
        );
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, Some(ViolationKind::SensitiveField));
    }

    #[test]
    fn test_parse_error_is_syntax_not_policy() {
        // Unbalanced parenthesis: no dialect parses this.
        let outcome = validator().validate("SELECT kcstmr FROM CO01M WHERE (mname = 'x'");
        assert!(!outcome.is_syntactically_valid);
        assert!(!outcome.is_policy_safe);
        assert_eq!(outcome.violation, None);
    }

    #[test]
    fn test_missing_limit_and_where_are_advisory() {
        let outcome = validator().validate("SELECT kcstmr, mname FROM CO01M");
        assert!(outcome.is_policy_safe);
        assert_eq!(outcome.suggestions.len(), 2);
        assert!(outcome.suggestions[0].contains("LIMIT"));
        assert!(outcome.suggestions[1].contains("WHERE"));
    }

    #[test]
    fn test_wildcard_projection_advisory() {
        let outcome = validator().validate("SELECT * FROM CO18H WHERE hitem = 'GLU' LIMIT 10");
        assert!(outcome.is_policy_safe);
        assert!(outcome.suggestions.iter().any(|s| s.contains('*')));
    }

    #[test]
    fn test_aggregates_allowed() {
        let outcome =
            validator().validate("SELECT msex, COUNT(*) AS n FROM CO01M GROUP BY msex LIMIT 10");
        assert!(outcome.is_policy_safe);
        assert!(outcome.resolved_fields.contains("msex"));
    }

    #[test]
    fn test_whitelist_enumeration() {
        // Every whitelisted table passes; close variants fail.
        for table in schema::ALLOWED_TABLES {
            let sql = format!("SELECT kcstmr FROM {} LIMIT 1", table);
            assert!(validator().validate(&sql).is_policy_safe, "{}", table);
            let sql = format!("SELECT kcstmr FROM {} LIMIT 1", table.to_lowercase());
            assert!(validator().validate(&sql).is_policy_safe, "{}", table);
        }
        for table in ["CO99M", "CO01", "CO01MX", "patients"] {
            let sql = format!("SELECT kcstmr FROM {} LIMIT 1", table);
            let outcome = validator().validate(&sql);
            assert_eq!(outcome.violation, Some(ViolationKind::UnknownTable), "{}", table);
        }
    }

    #[test]
    fn test_validation_is_idempotent() {
        let sql = "SELECT kcstmr, mname FROM CO01M WHERE msex = '1' LIMIT 10";
        let first = validator().validate(sql);
        let second = validator().validate(sql);
        assert_eq!(first, second);
    }

    #[test]
    fn test_policy_safe_implies_invariants() {
        let samples = [
            "SELECT kcstmr, mname FROM CO01M LIMIT 5",
            "SELECT h.hval FROM CO18H h JOIN CO01M p ON h.kcstmr = p.kcstmr LIMIT 10",
            "SELECT msex, COUNT(*) FROM CO01M GROUP BY msex",
        ];
        for sql in samples {
            let outcome = validator().validate(sql);
            if outcome.is_policy_safe {
                assert!(sql.trim().to_uppercase().starts_with("SELECT"));
                for table in &outcome.resolved_tables {
                    assert!(schema::is_allowed_table(table));
                }
                for field in &outcome.resolved_fields {
                    assert!(!schema::is_sensitive_field(field));
                }
            }
        }
    }
}
