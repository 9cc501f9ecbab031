//! Targets file maintenance. Run it while the daemon is stopped.
//!
//! Usage:
//!   cargo run --bin reset_state -- status          # counts + one line per target
//!   cargo run --bin reset_state -- reset           # clear in-flight, active → ready, preparing → pending
//!   cargo run --bin reset_state -- clear --force   # back up, then empty the file

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

use oddswatch::config::Config;
use oddswatch::store::{self, ConfigStore};
use oddswatch::target::Target;

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("status");
    let force = args.iter().any(|a| a == "--force");

    let config = Config::load_or_env(Path::new("oddswatch.toml"))
        .context("failed to load oddswatch.toml")?;
    let store = ConfigStore::new(&config.monitor.targets_file);

    println!("=== oddswatch state maintenance ===");
    println!("Targets file: {}", store.path().display());
    println!();

    match command {
        "status" => show_status(&store),
        "reset" => reset_state(&store),
        "clear" => clear_targets(&store, force),
        other => bail!("unknown command {other:?} (expected status, reset or clear)"),
    }
}

fn show_status(store: &ConfigStore) -> Result<()> {
    let Some(targets) = store.read_raw().context("failed to read targets file")? else {
        println!("No targets file found.");
        return Ok(());
    };

    println!("{} targets:", targets.len());
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for t in &targets {
        *counts.entry(t.status().to_string()).or_default() += 1;
    }
    for (status, count) in &counts {
        println!("  {status:<10} {count}");
    }

    let in_flight = targets.iter().filter(|t| t.in_flight()).count();
    if in_flight > 0 {
        println!("  {in_flight} marked in flight (run `reset` if the daemon is not running)");
    }

    println!();
    print_targets(&targets);
    Ok(())
}

fn reset_state(store: &ConfigStore) -> Result<()> {
    let Some(mut targets) = store.read_raw().context("failed to read targets file")? else {
        println!("No targets file found. Nothing to reset.");
        return Ok(());
    };

    let changed = store::reset(&mut targets);
    if changed.is_empty() {
        println!("No changes needed, every target is in a clean state.");
    } else {
        store.save(&targets).context("failed to save targets file")?;
        println!("Reset {} targets and saved.", changed.len());
    }

    println!();
    print_targets(&targets);
    Ok(())
}

fn clear_targets(store: &ConfigStore, force: bool) -> Result<()> {
    if !force {
        bail!("`clear` removes every target; pass --force to confirm");
    }
    match store.backup().context("failed to back up targets file")? {
        Some(backup) => println!("Backed up current targets to {}", backup.display()),
        None => {
            println!("No targets file found. Nothing to clear.");
            return Ok(());
        }
    }
    store.save(&[]).context("failed to save targets file")?;
    println!("Cleared all targets.");
    Ok(())
}

fn print_targets(targets: &[Target]) {
    for (i, t) in targets.iter().enumerate() {
        let flight = if t.in_flight() { " [IN FLIGHT]" } else { "" };
        println!(
            "  {:>3}. [{}{}] {}  cycles={} items={} failures={}",
            i + 1,
            t.status(),
            flight,
            t.url,
            t.counters.process_count,
            t.counters.last_item_count,
            t.counters.consecutive_failures,
        );
    }
}
