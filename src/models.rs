//! Structured generator response contract
//!
//! The generator is asked (not guaranteed) to answer with a JSON object in
//! this shape. The extractor's highest-confidence strategy is a full parse of
//! this contract; looser strategies only recover the `sql_query` field.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Query type classification the generator reports about its own SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    PatientInfo,
    VisitRecord,
    Prescription,
    LabResult,
    Statistics,
    General,
}

/// Self-reported confidence level of the generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

/// Full structured response the generator is prompted to produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlQueryResponse {
    pub sql_query: String,
    pub query_type: QueryType,
    pub confidence: ConfidenceLevel,
    pub explanation: String,

    #[serde(default)]
    pub table_mapping: HashMap<String, String>,

    #[serde(default)]
    pub field_mapping: HashMap<String, String>,

    #[serde(default)]
    pub estimated_results: Option<u64>,

    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SqlQueryResponse {
    /// Basic shape check beyond what serde enforces: the SQL payload must be
    /// plausibly a read-only statement before we even hand it to extraction.
    pub fn is_plausible(&self) -> bool {
        let sql = self.sql_query.trim();
        sql.len() >= 10 && sql.to_uppercase().starts_with("SELECT")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_response() {
        let raw = r#"{
            "sql_query": "SELECT kcstmr, mname FROM CO01M WHERE mname LIKE '%test%' LIMIT 10",
            "query_type": "patient_info",
            "confidence": "high",
            "explanation": "look up a patient by name",
            "table_mapping": {"CO01M": "patients"},
            "estimated_results": 1
        }"#;
        let parsed: SqlQueryResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.query_type, QueryType::PatientInfo);
        assert_eq!(parsed.confidence, ConfidenceLevel::High);
        assert!(parsed.is_plausible());
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_unknown_query_type_rejected() {
        let raw = r#"{
            "sql_query": "SELECT * FROM CO01M LIMIT 5",
            "query_type": "something_else",
            "confidence": "high",
            "explanation": "x"
        }"#;
        assert!(serde_json::from_str::<SqlQueryResponse>(raw).is_err());
    }

    #[test]
    fn test_implausible_sql() {
        let resp = SqlQueryResponse {
            sql_query: "DROP TABLE CO01M".to_string(),
            query_type: QueryType::General,
            confidence: ConfidenceLevel::Low,
            explanation: "bad".to_string(),
            table_mapping: HashMap::new(),
            field_mapping: HashMap::new(),
            estimated_results: None,
            warnings: vec![],
        };
        assert!(!resp.is_plausible());
    }
}
