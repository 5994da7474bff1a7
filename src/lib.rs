pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod extractor;
pub mod llm;
pub mod models;
pub mod prompts;
pub mod retry;
pub mod schema;
pub mod validator;
