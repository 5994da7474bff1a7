use cliniq::agent::QueryAgent;
use cliniq::config::Settings;
use cliniq::db::DatabaseManager;
use cliniq::llm::OllamaClient;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cliniq")]
#[command(about = "Natural-language read-only queries over the clinic database")]
#[command(version)]
struct Args {
    /// Path to a YAML settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the schema tables, the audit log, and all indexes
    InitDb,
    /// Run one natural-language query through the pipeline
    Query {
        /// The question, in Chinese or English
        question: String,

        /// Identifier recorded in the audit log
        #[arg(long, default_value = "cli")]
        user: String,

        /// Print the full JSON outcome instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show table record counts, usage counters, and recent audit entries
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let settings = Settings::load(args.config.as_deref())?;
    let db = Arc::new(DatabaseManager::open(
        Path::new(&settings.database.path),
        &settings.database,
    )?);

    match args.command {
        Commands::InitDb => {
            db.init_schema()?;
            println!("database initialized at {}", settings.database.path);
        }
        Commands::Query { question, user, json } => {
            let generator = Arc::new(OllamaClient::new(&settings.llm)?);
            let agent = QueryAgent::new(
                generator,
                Arc::clone(&db),
                settings.retry.strategy(),
                settings.retry.request_deadline(),
            );

            let outcome = agent.process_query(&question, &user).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else if outcome.success {
                if let Some(execution) = &outcome.execution {
                    info!(
                        attempts = outcome.attempts,
                        elapsed_ms = outcome.elapsed.as_millis() as u64,
                        "query complete"
                    );
                    if let Some(sql) = &outcome.sql {
                        println!("SQL: {}", sql);
                    }
                    println!("{}", outcome.interpretation);
                    for row in &execution.rows {
                        println!("{}", serde_json::to_string(row)?);
                    }
                    for suggestion in &outcome.suggestions {
                        println!("note: {}", suggestion);
                    }
                }
            } else {
                error!(attempts = outcome.attempts, state = ?outcome.state, "query failed");
                println!("{}", outcome.interpretation);
                for record in &outcome.errors {
                    println!("attempt failed ({:?}): {}", record.category, record.message);
                }
                std::process::exit(1);
            }
        }
        Commands::Stats => {
            let stats = db.stats();
            println!(
                "queries executed: {}  cache hits: {}",
                stats.queries_executed, stats.cache_hits
            );
            for (table, count) in db.table_stats()? {
                println!("{}: {} record(s)", table, count);
            }
            for entry in db.recent_audit_entries(10)? {
                println!(
                    "[{}] {} rows={} {:.3}s {}",
                    entry.created_at,
                    entry.user_id,
                    entry.row_count,
                    entry.execution_time,
                    entry.sql_text
                );
            }
        }
    }

    Ok(())
}
