//! Record a few trades, take a backup, restore it and shut down cleanly.
//!
//! ```sh
//! cargo run -p tradevault-storage --example trade_ledger
//! TRADEVAULT_CONFIG=vault.toml RUST_LOG=debug cargo run -p tradevault-storage --example trade_ledger
//! ```

use std::time::Duration;

use tradevault_core::StorageConfig;
use tradevault_storage::{NewTrade, StorageService, TradeType};

fn init_logging() {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();
    let env_filter = match "info".parse() {
        Ok(directive) => env_filter.add_directive(directive),
        Err(_) => env_filter,
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .try_init();
}

fn load_config() -> Result<StorageConfig, Box<dyn std::error::Error>> {
    let config = match std::env::var("TRADEVAULT_CONFIG") {
        Ok(path) => StorageConfig::load_from_file(path)?,
        Err(_) => StorageConfig::new("data/trade_ledger.db", "data/backups"),
    };
    Ok(config.apply_env_overrides()?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let mut config = load_config()?;
    config.health.interval = Duration::from_secs(1);
    let service = StorageService::open(config)?;
    service.start()?;

    let trades = [
        ("Aria", "Iron Ore", 0, 40, 3.5, TradeType::Buy),
        ("Bram", "Iron Ore", 40, 25, 3.9, TradeType::Sell),
        ("Aria", "Copper Wire", 0, 10, 7.25, TradeType::Buy),
    ];
    for (trader, item, previous, current, price, trade_type) in trades {
        let id = service.record_trade(&NewTrade {
            trader: trader.into(),
            item: item.into(),
            previous_quantity: previous,
            current_quantity: current,
            price,
            trade_type,
        })?;
        println!("recorded trade #{id}: {trader} {trade_type} {item} -> {current}");
    }

    let backup_id = service.create_backup()?;
    println!("backup {backup_id} created");

    service.record_trade(&NewTrade {
        trader: "Bram".into(),
        item: "Iron Ore".into(),
        previous_quantity: 25,
        current_quantity: 0,
        price: 4.1,
        trade_type: TradeType::Sell,
    })?;
    println!(
        "iron ore before restore: {:?}",
        service.ledger().inventory_quantity("Iron Ore")?
    );

    let report = service.restore(&backup_id)?;
    println!(
        "restored {} (previous store kept at {:?})",
        report.backup_id, report.pre_restore_copy
    );
    println!(
        "iron ore after restore: {:?}",
        service.ledger().inventory_quantity("Iron Ore")?
    );

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let health = service.health();
    println!("health: {}", health.summary());

    let stats = service.query_stats();
    println!(
        "queries: {} sampled, {} failed, p95 {:.2}ms",
        stats.sample_count, stats.failure_count, stats.p95_ms
    );

    let report = service.shutdown().await?;
    println!(
        "shutdown: {} connections closed, final backup {:?}",
        report.connections_closed, report.final_backup
    );
    Ok(())
}
