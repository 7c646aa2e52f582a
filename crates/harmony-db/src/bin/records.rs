//! # Record Inspector
//!
//! Prints the managed records of a bookkeeping database.
//!
//! ## Usage
//! ```bash
//! # Every record
//! cargo run -p harmony-db --bin records -- --db ./harmony.db
//!
//! # Only records a sync pass would upload
//! cargo run -p harmony-db --bin records -- --db ./harmony.db --filter upload
//!
//! # Forget the change token so the next sync refetches everything
//! cargo run -p harmony-db --bin records -- --db ./harmony.db --clear-token
//! ```
//!
//! Set `RUST_LOG=harmony_db=debug` to see queries and pool activity.

use std::env;

use harmony_core::RecordPredicate;
use harmony_db::{Database, DbConfig};
use tracing_subscriber::EnvFilter;

fn parse_predicate(value: &str) -> Option<RecordPredicate> {
    match value {
        "all" => Some(RecordPredicate::All),
        "syncable" => Some(RecordPredicate::Syncable),
        "conflicted" => Some(RecordPredicate::Conflicted),
        "conflict" => Some(RecordPredicate::Conflict),
        "upload" => Some(RecordPredicate::Upload),
        "download" => Some(RecordPredicate::Download),
        "delete" => Some(RecordPredicate::Delete),
        _ => None,
    }
}

fn status_label<T: std::fmt::Display>(status: Option<T>) -> String {
    status.map_or_else(|| "-".to_string(), |s| s.to_string())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    let mut db_path = String::from("./harmony.db");
    let mut predicate = RecordPredicate::All;
    let mut clear_token = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--filter" | "-f" => {
                if i + 1 < args.len() {
                    predicate = parse_predicate(&args[i + 1])
                        .ok_or_else(|| format!("unknown filter: {}", args[i + 1]))?;
                    i += 1;
                }
            }
            "--clear-token" => clear_token = true,
            "--help" | "-h" => {
                println!("Harmony Record Inspector");
                println!();
                println!("Usage: records [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -d, --db <PATH>       Database file path (default: ./harmony.db)");
                println!("  -f, --filter <NAME>   all | syncable | conflicted | conflict |");
                println!("                        upload | download | delete (default: all)");
                println!("      --clear-token     Forget the stored change token");
                println!("  -h, --help            Show this help message");
                return Ok(());
            }
            other => eprintln!("Ignoring unknown argument: {other}"),
        }
        i += 1;
    }

    let db = Database::new(DbConfig::new(&db_path)).await?;

    if clear_token {
        db.state().set_change_token(None).await?;
        println!("Cleared change token");
    }

    let records: Vec<_> = db
        .records()
        .fetch_all()
        .await?
        .into_iter()
        .filter(|record| record.matches(predicate))
        .collect();

    println!("Database: {db_path}");
    println!("Seeded:   {}", db.state().is_seeded().await?);
    println!(
        "Token:    {}",
        if db.state().change_token().await?.is_some() { "stored" } else { "none" }
    );
    println!();
    println!(
        "{:<40} {:<8} {:<8} {:<9} {:<10}",
        "RECORD", "LOCAL", "REMOTE", "ACTION", "FLAGS"
    );

    for record in &records {
        let mut flags = Vec::new();
        if record.is_conflicted {
            flags.push("conflicted");
        }
        if !record.is_syncing_enabled {
            flags.push("disabled");
        }
        if record.remote.as_ref().is_some_and(|r| r.is_locked) {
            flags.push("locked");
        }

        println!(
            "{:<40} {:<8} {:<8} {:<9} {:<10}",
            record.record_id.to_string(),
            status_label(record.local_status()),
            status_label(record.remote_status()),
            format!("{:?}", record.sync_action()).to_lowercase(),
            flags.join(",")
        );
    }

    println!();
    println!("{} record(s)", records.len());

    db.close().await;
    Ok(())
}
