//! Fixed Medical Schema
//!
//! The pipeline operates against exactly four clinic tables. Everything the
//! validator and the execution gateway check is defined here: the table
//! whitelist, per-table field sets, the sensitive-field blacklist, and the
//! write/DDL keyword blacklist.

use lazy_static::lazy_static;
use regex::Regex;

/// The only tables a generated query may read from.
pub const ALLOWED_TABLES: [&str; 4] = ["CO01M", "CO02M", "CO03M", "CO18H"];

/// Columns that must never appear in a result projection, regardless of table.
pub const SENSITIVE_FIELDS: [&str; 2] = [
    "mpersonid", // national ID number
    "maddr",     // unmasked free-text address
];

/// Write/DDL/administrative keywords that are rejected anywhere in a statement.
pub const FORBIDDEN_KEYWORDS: [&str; 17] = [
    "DROP",
    "DELETE",
    "UPDATE",
    "INSERT",
    "ALTER",
    "CREATE",
    "TRUNCATE",
    "EXEC",
    "EXECUTE",
    "SCRIPT",
    "PROCEDURE",
    "FUNCTION",
    "GRANT",
    "REVOKE",
    "COMMIT",
    "ROLLBACK",
    "TRANSACTION",
];

lazy_static! {
    // Word-boundary match so column names like created_at or updated_at do
    // not trip the CREATE/UPDATE checks.
    static ref FORBIDDEN_RE: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|UPDATE|INSERT|ALTER|CREATE|TRUNCATE|EXEC|EXECUTE|SCRIPT|PROCEDURE|FUNCTION|GRANT|REVOKE|COMMIT|ROLLBACK|TRANSACTION)\b"
    )
    .unwrap();
}

/// Returns the first forbidden keyword found in `sql`, if any.
pub fn find_forbidden_keyword(sql: &str) -> Option<String> {
    FORBIDDEN_RE
        .find(sql)
        .map(|m| m.as_str().to_uppercase())
}

pub fn is_allowed_table(name: &str) -> bool {
    ALLOWED_TABLES
        .iter()
        .any(|t| t.eq_ignore_ascii_case(name))
}

pub fn is_sensitive_field(name: &str) -> bool {
    SENSITIVE_FIELDS
        .iter()
        .any(|f| f.eq_ignore_ascii_case(name))
}

/// Queryable fields per table, used to build the generator prompt.
/// Sensitive columns are deliberately absent.
pub fn table_fields(table: &str) -> &'static [&'static str] {
    match table.to_uppercase().as_str() {
        "CO01M" => &[
            "kcstmr", "mname", "msex", "mbirthdt", "mtelh", "mfml", "mweight", "mheight",
            "mbegdt", "mlcasedate",
        ],
        "CO02M" => &["kcstmr", "idate", "itime", "dno", "ptp", "pfq", "ptday"],
        "CO03M" => &["kcstmr", "idate", "itime", "labno", "ipk3", "tot", "sa98"],
        "CO18H" => &[
            "kcstmr", "hdate", "htime", "hitem", "hdscp", "hval", "hresult", "hrule",
        ],
        _ => &[],
    }
}

/// Human-readable table descriptions for the prompt.
pub fn table_description(table: &str) -> &'static str {
    match table.to_uppercase().as_str() {
        "CO01M" => "patient master records (kcstmr = chart number, mname = name)",
        "CO02M" => "prescription records (dno = drug code, idate = issue date)",
        "CO03M" => "visit summaries (labno = primary diagnosis, ipk3 = physician)",
        "CO18H" => "lab results (hitem = test code, hval = value, hresult = text result)",
        _ => "",
    }
}

/// DDL for the four schema tables plus the append-only audit log.
pub const SCHEMA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS CO01M (
    kcstmr TEXT PRIMARY KEY,
    mname TEXT,
    msex TEXT,
    mbirthdt TEXT,
    mtelh TEXT,
    mfml TEXT,
    mweight REAL,
    mheight REAL,
    mbegdt TEXT,
    mlcasedate TEXT,
    maddr TEXT,
    mpersonid TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS CO02M (
    kcstmr TEXT NOT NULL,
    idate TEXT NOT NULL,
    itime TEXT NOT NULL,
    dno TEXT NOT NULL,
    ptp TEXT,
    pfq TEXT,
    ptday INTEGER,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (kcstmr, idate, itime, dno),
    FOREIGN KEY (kcstmr) REFERENCES CO01M(kcstmr)
);

CREATE TABLE IF NOT EXISTS CO03M (
    kcstmr TEXT NOT NULL,
    idate TEXT NOT NULL,
    itime TEXT NOT NULL,
    labno TEXT,
    ipk3 TEXT,
    tot REAL,
    sa98 REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (kcstmr, idate, itime),
    FOREIGN KEY (kcstmr) REFERENCES CO01M(kcstmr)
);

CREATE TABLE IF NOT EXISTS CO18H (
    kcstmr TEXT NOT NULL,
    hdate TEXT NOT NULL,
    htime TEXT NOT NULL,
    hitem TEXT NOT NULL,
    hdscp TEXT,
    hval REAL,
    hresult TEXT,
    hrule TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (kcstmr, hdate, htime, hitem),
    FOREIGN KEY (kcstmr) REFERENCES CO01M(kcstmr)
);

CREATE TABLE IF NOT EXISTS query_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT,
    query_hash TEXT,
    query_text TEXT,
    result_count INTEGER,
    execution_time REAL,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
"#;

/// Index definitions applied after table creation.
pub const SCHEMA_INDEXES: [&str; 8] = [
    "CREATE INDEX IF NOT EXISTS idx_co01m_name ON CO01M(mname)",
    "CREATE INDEX IF NOT EXISTS idx_co01m_lastcase ON CO01M(mlcasedate)",
    "CREATE INDEX IF NOT EXISTS idx_co02m_patient_date ON CO02M(kcstmr, idate)",
    "CREATE INDEX IF NOT EXISTS idx_co02m_drug ON CO02M(dno)",
    "CREATE INDEX IF NOT EXISTS idx_co03m_patient_date ON CO03M(kcstmr, idate)",
    "CREATE INDEX IF NOT EXISTS idx_co18h_patient_date ON CO18H(kcstmr, hdate)",
    "CREATE INDEX IF NOT EXISTS idx_query_log_date ON query_log(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_query_log_user ON query_log(user_id)",
];
