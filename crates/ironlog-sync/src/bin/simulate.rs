//! # Sync Session Simulator
//!
//! Runs an offline/online workout session against the in-memory remote and
//! logs what the engine does.
//!
//! ## Usage
//! ```bash
//! # In-memory database, 5 sets per exercise (default)
//! cargo run -p ironlog-sync --bin ironlog-simulate
//!
//! # Persist the local store and log every step
//! RUST_LOG=debug cargo run -p ironlog-sync --bin ironlog-simulate -- --db ./ironlog_dev.db
//!
//! # Custom config file and set count
//! cargo run -p ironlog-sync --bin ironlog-simulate -- --config ./sync.toml --sets 10
//!
//! # Write the effective config (file + IRONLOG_* overrides) as a starting point
//! cargo run -p ironlog-sync --bin ironlog-simulate -- --save-config ./sync.toml
//! ```
//!
//! ## Session
//! 1. Sign in (initial sync against an empty remote)
//! 2. Go offline and log a workout: schema, day, exercises, session, sets
//! 3. Another device edits the schema meanwhile
//! 4. Come back online; the reconnect trigger pushes and pulls

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

use ironlog_core::{EntityTable, Payload};
use ironlog_db::{Database, DbConfig};
use ironlog_sync::{
    spawn_reconnect_trigger, Connectivity, InMemoryRemote, LogEmitter, SyncConfig,
    SyncEngineBuilder,
};

const OWNER: &str = "demo-user";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ironlog=debug,sqlx=warn"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn payload(value: serde_json::Value) -> Payload {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Payload::new(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut db_path: Option<PathBuf> = None;
    let mut save_path: Option<PathBuf> = None;
    let mut sets: usize = 5;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--save-config" => {
                if i + 1 < args.len() {
                    save_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--sets" | "-s" => {
                if i + 1 < args.len() {
                    sets = args[i + 1].parse().unwrap_or(5);
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("IronLog Sync Simulator");
                println!();
                println!("Usage: ironlog-simulate [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  sync.toml to load (default: platform config dir)");
                println!("  -d, --db <PATH>      SQLite file (default: IRONLOG_DB_PATH, else in-memory)");
                println!("  -s, --sets <N>       Sets logged per exercise (default: 5)");
                println!("      --save-config <PATH>  Write the effective config to PATH");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    init_tracing();

    let config = SyncConfig::load(config_path)?;
    info!(device_id = %config.device_id(), mode = %config.mode(), "Loaded sync config");
    if let Some(path) = save_path {
        config.save(Some(path))?;
    }

    let db_config = match db_path.or_else(|| config.database.path.clone()) {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            DbConfig::new(path)
        }
        None => DbConfig::in_memory(),
    };
    let db = Database::new(db_config).await?;

    let remote = Arc::new(InMemoryRemote::new());
    let connectivity = Connectivity::new(true);
    let engine = SyncEngineBuilder::new(config)
        .with_database(db.clone())
        .with_remote(remote.clone())
        .with_connectivity(connectivity.clone())
        .with_emitter(Arc::new(LogEmitter))
        .build()?;
    let reconnect = spawn_reconnect_trigger(&connectivity, engine.clone());

    // 1. Sign in
    engine.on_auth_changed(Some(OWNER.to_string())).await?;
    let report = engine.initial_sync().await;
    info!(outcome = ?report.outcome, "Initial sync finished");

    // 2. Offline workout
    remote.set_reachable(false).await;
    connectivity.set_reachable(false);

    let records = db.records();
    let schema = records
        .create(EntityTable::Schema, payload(json!({ "name": "Push/Pull/Legs" })))
        .await?;
    let day = records
        .create(
            EntityTable::Day,
            payload(json!({ "name": "Push", "schemaId": schema.local_id })),
        )
        .await?;
    let session = records
        .create(
            EntityTable::Session,
            payload(json!({ "schemaId": schema.local_id, "dayId": day.local_id })),
        )
        .await?;

    for name in ["Bench Press", "Overhead Press"] {
        let exercise = records
            .create(
                EntityTable::Exercise,
                payload(json!({ "name": name, "dayId": day.local_id, "sets": sets })),
            )
            .await?;
        let log = records
            .create(
                EntityTable::ExerciseLog,
                payload(json!({ "sessionId": session.local_id, "exerciseId": exercise.local_id })),
            )
            .await?;
        for set in 0..sets {
            records
                .create(
                    EntityTable::SetLog,
                    payload(json!({ "exerciseLogId": log.local_id, "reps": 8, "index": set })),
                )
                .await?;
        }
    }

    let report = engine.sync().await;
    info!(
        outcome = ?report.outcome,
        pending = engine.status().pending_count,
        "Workout logged offline, sync attempted"
    );

    // 3. Another device creates a schema meanwhile
    remote
        .put_external(
            EntityTable::Schema,
            OWNER,
            "r-tablet-1",
            payload(json!({ "name": "5x5 (from tablet)" })),
            ironlog_db::now_millis(),
        )
        .await;

    // 4. Back online
    remote.set_reachable(true).await;
    connectivity.set_reachable(true);
    let report = engine.sync().await;

    let status = engine.status();
    println!();
    println!("Sync outcome:      {:?}", report.outcome);
    println!("Pushed:            {}", report.push.acked);
    println!("Pulled:            {}", report.pull.received);
    println!("Remote mutations:  {}", remote.mutation_count().await);
    println!("Pending:           {}", status.pending_count);
    println!("State:             {}", status.state);
    for table in EntityTable::ALL {
        println!("{:<18} {}", format!("{}:", table), db.records().count(table).await?);
    }

    reconnect.abort();
    engine.shutdown().await;
    db.close().await;
    Ok(())
}
