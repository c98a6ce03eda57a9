//! Snapshot Command
//!
//! Read-only view of the persisted monitor state for operators.

use anyhow::{Context, Result};

use tpsl_engine::persistence::PersistenceStore;
use tpsl_engine::Config;

pub fn run() -> Result<()> {
    let config = Config::from_env().context("failed to build configuration")?;
    let store = PersistenceStore::new(
        &config.persistence_path,
        config.max_backups,
        config.backup_interval,
    );
    let snapshot = store.load().context("failed to load snapshot")?;

    println!("snapshot: {}", config.persistence_path.display());
    println!("schema version: {}", snapshot.schema_version);
    println!();

    if snapshot.monitors.is_empty() {
        println!("no monitors recorded");
    } else {
        println!(
            "{:<28} {:<14} {:>12} {:>12} {:>8} {:>8}",
            "monitor", "phase", "size", "target", "tp fills", "tp1"
        );
        for (key, record) in &snapshot.monitors {
            println!(
                "{:<28} {:<14} {:>12} {:>12} {:>8} {:>8}",
                key,
                record.phase.to_string(),
                record.current_size.to_string(),
                record.target_size.to_string(),
                record.filled_tp_count,
                if record.tp1_hit { "yes" } else { "no" }
            );
        }
    }

    println!();
    println!(
        "trades: {} total, {} wins, {} losses ({} conservative)",
        snapshot.counters.stats_total_trades,
        snapshot.counters.stats_total_wins,
        snapshot.counters.stats_total_losses,
        snapshot.counters.stats_conservative_trades
    );
    Ok(())
}
