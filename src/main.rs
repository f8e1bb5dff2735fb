use cyberpet::api_server;
use cyberpet::core::monitor::{Monitor, MonitorTiming};
use cyberpet::core::pet::PetEngine;
use cyberpet::core::service::PetService;
use cyberpet::core::state::{default_config_path, AppState, PetConfig, CYBERPET_DIR};
use cyberpet::core::store::StateStore;
use cyberpet::io::analyzer;
use cyberpet::io::hub::ConnectionHub;

use anyhow::{Context, Result};
use colored::*;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::from_filename(".env").ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("cyberpet=info,tower_http=info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    if args.iter().any(|a| a == "init") {
        return init_workspace(&config_path);
    }

    // 1. Configuration
    let config = PetConfig::load(&config_path)?;

    // 2. Pet state + real-time hub
    let mut engine = PetEngine::new(
        config.pet.history_capacity,
        config.threat,
        config.good_behavior,
    );
    if let Some(path) = &config.pet.state_file {
        engine = engine.with_store(StateStore::new(path));
    }
    let hub = Arc::new(ConnectionHub::new());
    let service = Arc::new(PetService::new(engine, hub));

    // 3. Analyzer + monitoring loop (off until requested)
    let analyzer = analyzer::from_config(&config.analyzer)?;
    let analyzer_name = analyzer.name();
    let monitor = Arc::new(Monitor::new(
        service.clone(),
        analyzer,
        MonitorTiming::from(&config.monitor),
    ));

    let snapshot = service.snapshot();
    println!("{}", "🐾 CyberPet backend online".green().bold());
    println!(
        "   - Pet: health {} ({})",
        snapshot.health.to_string().as_str().bold(),
        snapshot.mood.as_str()
    );
    println!("   - Analyzer: {}", analyzer_name.cyan());
    println!(
        "   - Monitoring is {} - POST /api/monitoring/start to begin (every {}s)",
        "OFF".yellow(),
        config.monitor.interval_secs
    );

    let state = AppState::new(config, service, monitor.clone());

    tokio::select! {
        res = api_server::start_server(state) => res?,
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "👋 Shutting down...".yellow());
        }
    }

    monitor.stop().await;
    Ok(())
}

fn init_workspace(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        println!(
            "{} {}",
            "✅ Config already present at".green(),
            config_path.display()
        );
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(config_path, PetConfig::default().to_toml()?)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    let gitignore_path = Path::new(".gitignore");
    let mut gitignore = if gitignore_path.exists() {
        fs::read_to_string(gitignore_path)?
    } else {
        String::new()
    };
    if !gitignore.contains(CYBERPET_DIR) {
        gitignore.push_str(&format!("\n# CyberPet state\n{}/\n", CYBERPET_DIR));
        fs::write(gitignore_path, gitignore)?;
    }
    println!(
        "{} {}",
        "🥚 Wrote default config to".green().bold(),
        config_path.display()
    );
    Ok(())
}
