//! Prompt construction
//!
//! Builds the system and user instructions sent to the generator, including
//! the structured-response contract, the queryable schema, few-shot
//! examples, and — on retries — a recovery section with the previous SQL and
//! the error category's remediation hints.

use crate::retry::RetryContext;
use crate::schema;

#[derive(Debug, Clone, Default)]
pub struct PromptBuilder;

impl PromptBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Fixed system instruction: role, schema, rules, response contract.
    pub fn system_prompt(&self) -> String {
        let mut parts = Vec::new();

        parts.push(
            "You are a clinic database assistant. You translate natural-language \
             questions (Chinese or English) into a single safe SQLite SELECT statement."
                .to_string(),
        );

        parts.push("## Queryable tables".to_string());
        for table in schema::ALLOWED_TABLES {
            parts.push(format!(
                "- {}: {} — columns: {}",
                table,
                schema::table_description(table),
                schema::table_fields(table).join(", ")
            ));
        }

        parts.push("## Rules".to_string());
        parts.push(
            "1. Exactly one SELECT statement. Never use INSERT, UPDATE, DELETE, DROP, \
             CREATE, ALTER or any other write or DDL operation.\n\
             2. Query only the four tables listed above.\n\
             3. Never select protected columns (national ID, address).\n\
             4. Always end with a LIMIT clause (LIMIT 100 or less unless asked otherwise).\n\
             5. Dates are stored as YYYYMMDD text; name matching uses LIKE '%name%'."
                .to_string(),
        );

        parts.push("## Response format".to_string());
        parts.push(
            r#"Respond with a single JSON object and nothing else:
{
  "sql_query": "<the SELECT statement>",
  "query_type": "patient_info" | "visit_record" | "prescription" | "lab_result" | "statistics" | "general",
  "confidence": "high" | "medium" | "low",
  "explanation": "<one-sentence description of what the query returns>",
  "warnings": []
}"#
            .to_string(),
        );

        parts.push("## Examples".to_string());
        parts.push(
            r#"Q: 查詢病患林正日的基本資料
{"sql_query": "SELECT kcstmr, mname, msex, mbirthdt, mtelh FROM CO01M WHERE mname LIKE '%林正日%' LIMIT 10", "query_type": "patient_info", "confidence": "high", "explanation": "basic data for patients named 林正日", "warnings": []}

Q: 2023年8月的檢驗結果
{"sql_query": "SELECT kcstmr, hdate, hitem, hval, hresult FROM CO18H WHERE hdate >= '20230801' AND hdate < '20230901' ORDER BY hdate DESC LIMIT 100", "query_type": "lab_result", "confidence": "high", "explanation": "lab results recorded in August 2023", "warnings": []}

Q: 統計男性和女性病患人數
{"sql_query": "SELECT msex, COUNT(*) AS patient_count FROM CO01M GROUP BY msex LIMIT 10", "query_type": "statistics", "confidence": "high", "explanation": "patient counts grouped by sex", "warnings": []}"#
                .to_string(),
        );

        parts.join("\n\n")
    }

    /// Per-attempt user instruction. On retries the previous SQL and the
    /// last error's remediation hints are appended so the generator is
    /// steered rather than blindly re-asked.
    pub fn user_prompt(&self, user_query: &str, retry: Option<&RetryContext>) -> String {
        let mut parts = vec![format!("Question: {}", user_query)];

        if let Some(context) = retry {
            if let Some(record) = context.last_error() {
                parts.push(format!(
                    "Your previous attempt (attempt {}) failed: {}",
                    context.attempt_count, record.message
                ));
                if let Some(last_sql) = &context.last_sql {
                    parts.push(format!("Previous SQL: {}", last_sql));
                }
                if !record.remediation_hints.is_empty() {
                    parts.push(format!(
                        "Fix it as follows:\n- {}",
                        record.remediation_hints.join("\n- ")
                    ));
                }
                parts.push("Regenerate the JSON response with these corrections.".to_string());
            }
        }

        parts.join("\n\n")
    }
}
