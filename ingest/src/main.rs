// src/main.rs

//! Ingest entry-point: synthetic load against the batch-insertion engine.
//!
//! 1. Parse configuration & set up structured logging
//! 2. Optionally expose metrics for Prometheus
//! 3. Initialise SQLite (WAL/NORMAL) and seed the symbol table
//! 4. Start the engine and run the producer threads
//! 5. Stop the engine, draining every pending batch, and report

// ───── std / 3rd-party imports ──────────────────────────────────────────────
use anyhow::{Context, Result};
use chrono::Local;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

// ───── local imports ────────────────────────────────────────────────────────
use ingest::config::{self, Config};
use ingest::db::init_database;
use ingest::load;
use ingest::logging::setup_logging;
use ingest::pipeline::{IngestEngine, IngestError};

// ───── helpers ──────────────────────────────────────────────────────────────

/// Directory that contains the running executable.
fn exe_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine exe path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable must live in some directory")
}

/// Config path from the first argument, else `default.toml` next to the
/// executable, else built-in defaults.
fn load_config(exe_dir: &Path) -> Result<Config> {
    if let Some(arg) = std::env::args_os().nth(1) {
        let path = PathBuf::from(arg);
        return config::load(&path).with_context(|| format!("loading {}", path.display()));
    }
    let default = exe_dir.join("default.toml");
    if default.exists() {
        return config::load(&default).with_context(|| format!("loading {}", default.display()));
    }
    Ok(Config::default())
}

fn install_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics listen address '{listen}'"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("installing Prometheus exporter")?;
    log::info!("Prometheus metrics on http://{}/metrics", addr);
    Ok(())
}

// ───── run ──────────────────────────────────────────────────────────────────

fn run() -> Result<()> {
    // 1 ─ Context
    let exe_dir = exe_dir()?;
    let cfg = load_config(&exe_dir)?;

    setup_logging(&exe_dir, &cfg.logging).context("logging setup failed")?;
    log::info!("Ingest bootstrap initiated");

    // 2 ─ Metrics
    if let Some(listen) = cfg.metrics.listen.as_deref() {
        install_metrics(listen)?;
    }

    // 3 ─ Database
    let db_path = PathBuf::from(&cfg.database.path);
    let mut conn = init_database(&db_path, &cfg.database)?;
    let symbols = cfg.load.producers * cfg.load.symbols_per_producer;
    load::seed_symbols(&mut conn, symbols).context("seeding symbols")?;
    drop(conn);

    // 4 ─ Engine & producers
    let engine = IngestEngine::open(&cfg.database, cfg.writer.clone());
    engine.start()?;
    let summary = load::run(&engine, &cfg.load)?;

    // 5 ─ Drain
    match engine.stop() {
        Ok(report) => {
            let written = report.stats.rows_written;
            log::info!(
                "Done: {} of {} rows written ({} failed batches) in {:.2} seconds",
                written,
                summary.rows(),
                report.stats.batches_failed,
                summary.elapsed.as_secs_f64()
            );
            if !report.retained.is_empty() {
                log::warn!("{} batches retained after lock exhaustion", report.retained.len());
            }
            Ok(())
        }
        Err(e @ IngestError::ShutdownFlush { .. }) => Err(e.into()),
        Err(e) => Err(e).context("stopping engine"),
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("[{}][ERROR][main] {:#}", Local::now().to_rfc3339(), e);
        std::process::exit(1);
    }
}
