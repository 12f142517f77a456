use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use nodewatch::client::HttpNodeClient;
use nodewatch::conditions;
use nodewatch::config::{
    Config, RuntimeContext, ACCELERATED_HARDWARE_NONE, DEFAULT_CONFIG_PATH,
};
use nodewatch::manager::{MonitorManager, NodeConditionConfig, NodeExporter};
use nodewatch::observer::ObserverRegistry;
use nodewatch::plugins;
use nodewatch::ConditionType;

/// Command-line arguments for the node health monitoring agent
#[derive(Parser)]
#[command(
    name = "nodewatch",
    about = "Node health monitoring agent - turns kernel and service log signals into node conditions",
    long_about = "An agent that tails host log resources (kernel ring buffer, journal, files), \
                  matches known failure signatures, and reports the results as node conditions \
                  and events to the control plane."
)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Configuration file path (TOML format)"
    )]
    config: Option<PathBuf>,

    /// Node to report conditions for
    #[arg(
        short,
        long,
        value_name = "NAME",
        help = "Node name (overrides the NODE_NAME environment variable and the config file)"
    )]
    node_name: Option<String>,

    /// Enable verbose logging
    #[arg(
        short,
        long,
        help = "Enable verbose logging output (sets RUST_LOG=debug)"
    )]
    verbose: bool,
}

fn resolve_node_name(cli: &Cli, config: &Config) -> Option<String> {
    cli.node_name
        .clone()
        .or_else(|| std::env::var("NODE_NAME").ok())
        .or_else(|| config.node_name.clone())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let plugins = plugins::builtin();
    plugins::validate(&plugins)?;
    let known: Vec<&str> = plugins.iter().map(|plugin| plugin.name()).collect();
    config.validate_monitor_names(&known)?;

    let node_name = resolve_node_name(&cli, &config)
        .context("node name must be set via --node-name, NODE_NAME, or the config file")?;

    let context = RuntimeContext::detect(&config)?;
    if context.accelerated_hardware() != ACCELERATED_HARDWARE_NONE {
        context.add_tags([context.accelerated_hardware().to_string()]);
    }
    info!(
        "runtime context: os_distro={}, accelerated_hardware={}, tags={:?}",
        context.os_distro(),
        context.accelerated_hardware(),
        context.tags()
    );

    let shutdown = CancellationToken::new();
    let handler_token = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received interrupt signal, shutting down gracefully...");
        handler_token.cancel();
    })
    .context("failed to set interrupt handler")?;

    let enabled: Vec<_> = plugins
        .iter()
        .filter(|plugin| {
            let enabled = config.monitor_enabled(plugin.name());
            if !enabled {
                info!("monitor plugin {} is disabled", plugin.name());
            }
            enabled
        })
        .collect();

    let managed: BTreeMap<ConditionType, NodeConditionConfig> = enabled
        .iter()
        .map(|plugin| {
            let condition_type = plugin.condition_type().clone();
            let config = conditions::ready_config(&condition_type);
            (condition_type, config)
        })
        .collect();

    let client = Arc::new(HttpNodeClient::new(
        &config.api.endpoint,
        config.api.token.clone(),
    ));
    let exporter = Arc::new(NodeExporter::new(node_name.clone(), client, managed));

    let mut manager = MonitorManager::new(
        ObserverRegistry::builtin(&config.host_root),
        Arc::clone(&exporter) as Arc<dyn nodewatch::manager::Exporter>,
    );
    for plugin in &enabled {
        info!("registering monitor plugin {}", plugin.name());
        manager
            .register(
                plugin.build(&config, &context),
                plugin.condition_type().clone(),
                &shutdown,
            )
            .await
            .with_context(|| format!("failed to register plugin {}", plugin.name()))?;
    }

    let exporter_token = shutdown.clone();
    tokio::spawn(async move { exporter.run(exporter_token).await });

    info!("starting monitor manager for node {}", node_name);
    manager.start(shutdown).await
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        std::env::set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    info!("starting node health monitoring agent");

    if let Err(err) = run(cli).await {
        error!("{:#}", err);
        std::process::exit(1);
    }
}
