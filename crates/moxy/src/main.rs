use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use moxy::config::Config;
use moxy::control::{ControlServer, ControlState};
use moxy::hub::NotificationHub;
use moxy::rules::{Rule, RuleSet};
use moxy::server::{ProxyServer, ProxyState};

#[derive(Parser, Debug)]
#[command(name = "moxy", about = "Intercepting HTTP mock proxy", version)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,
    /// Data-plane port, overrides the config file
    #[arg(short, long)]
    port: Option<u16>,
    /// Control-plane port, overrides the config file
    #[arg(long)]
    control_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.listen.port = port;
    }
    if let Some(port) = args.control_port {
        config.control.port = port;
    }

    let rules = Arc::new(RuleSet::new());
    for spec in config.rules.clone() {
        let rule = Rule::compile(spec)?;
        info!(rule_id = %rule.id, action = rule.action.kind(), "rule loaded from config");
        rules.append(rule);
    }

    let hub = Arc::new(NotificationHub::new());

    let proxy_state = Arc::new(ProxyState::new(Arc::clone(&rules), Arc::clone(&hub), &config));
    let proxy = ProxyServer::bind(&config, proxy_state).await?;

    let control_state = Arc::new(ControlState { rules, hub });
    let control = ControlServer::bind(&config, control_state).await?;

    tokio::select! {
        result = proxy.run() => {
            if let Err(e) = result {
                error!("proxy server failed: {e}");
            }
        }
        result = control.run() => {
            if let Err(e) = result {
                error!("control server failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
