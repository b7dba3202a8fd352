use std::{net::SocketAddr, path::Path, sync::Arc};

use atrium::{
    adapters::{ConfigWatcher, HttpHandler, RhaiScriptEngine, SessionTracker, build_router},
    config::models::ServerConfig,
    core::RoutingEngine,
    metrics, tracing_setup,
    utils::graceful_shutdown::GracefulShutdown,
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file and application definitions
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file and a sample application
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the server (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => return validate_config_command(&config_path).await,
        "init" => return init_config_command(&config_path).await,
        _ => {}
    }

    let config = atrium::config::load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load configuration from {config_path}"))?;
    atrium::config::ServerConfigValidator::validate(&config)
        .map_err(|e| eyre!("Invalid configuration: {e}"))?;
    let config = Arc::new(config);

    tracing_setup::init_tracing(&config.logging)
        .map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;
    metrics::init_metrics().map_err(|e| eyre!("Failed to initialize metrics: {}", e))?;

    tracing::info!("Loaded configuration from {config_path}");

    let scripts = Arc::new(RhaiScriptEngine::new(&config.scripts));
    let engine = Arc::new(RoutingEngine::builder(config.clone(), scripts).build());

    let watcher = Arc::new(ConfigWatcher::from_config(&config, engine.clone()));
    let loaded = watcher.scan().context("Failed to scan webapps directory")?;
    engine
        .warm_up()
        .map_err(|e| eyre!("Failed to build application contexts: {e}"))?;
    tracing::info!(
        files = loaded,
        webapps_dir = %watcher.webapps_dir().display(),
        "Application definitions loaded"
    );
    for app in engine.registry().applications() {
        tracing::info!(
            context_path = %app.context_path,
            docroot = %app.docroot.display(),
            files = app.files.len(),
            "Application published"
        );
    }

    let graceful_shutdown = Arc::new(GracefulShutdown::new());
    let signal_handler_shutdown = graceful_shutdown.clone();
    tokio::spawn(async move {
        signal_handler_shutdown.run_signal_handler().await;
    });

    let watcher_handle = if config.reload.enabled {
        Some(
            watcher
                .clone()
                .watch(graceful_shutdown.shutdown_token())
                .context("Failed to start definition watcher")?,
        )
    } else {
        tracing::info!("Definition reload is disabled");
        None
    };

    let sessions = Arc::new(SessionTracker::new(&config.session));
    let sweeper_handle = sessions
        .clone()
        .spawn_sweeper(engine.clone(), graceful_shutdown.shutdown_token());

    let http_handler = Arc::new(HttpHandler::new(engine.clone(), sessions));
    let app = build_router(http_handler);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;

    tracing::info!("Atrium server starting on {}", addr);

    let server_result = tokio::select! {
        result = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>()
        ) => {
            result.context("Server error")
        },
        shutdown_reason = graceful_shutdown.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received: {:?}", shutdown_reason);
            Ok(())
        }
    };

    let background = async {
        if let Some(handle) = watcher_handle {
            let _ = handle.await;
        }
        let _ = sweeper_handle.await;
    };
    if tokio::time::timeout(graceful_shutdown.shutdown_timeout(), background)
        .await
        .is_err()
    {
        tracing::warn!("Background tasks did not stop within the shutdown timeout");
    }
    tracing::info!("Graceful shutdown completed");

    server_result
}

/// Validate configuration file and application definitions, then exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    use atrium::{DefinitionStore, config::ServerConfigValidator};

    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match atrium::config::load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = ServerConfigValidator::validate(&config) {
        eprintln!("❌ Configuration validation failed:");
        eprintln!("{e}");
        println!();
        println!("💡 Common fixes:");
        println!("   • Verify listen address format (e.g., '127.0.0.1:8080')");
        println!("   • Check that webapps_dir exists");
        println!("   • Reserved paths must start with '/'");
        std::process::exit(1);
    }
    println!("✅ Configuration validation: OK");

    // Dry-run the definitions against a throwaway store
    let store = Arc::new(DefinitionStore::new());
    let watcher = ConfigWatcher::from_config(&config, store.clone());
    let outcomes = match watcher.scan() {
        Ok(files) => files,
        Err(e) => {
            eprintln!("❌ Failed to read definitions: {e}");
            std::process::exit(1);
        }
    };
    let rejected = metrics::reload_outcomes()
        .get("rejected")
        .copied()
        .unwrap_or_default();

    println!();
    println!("📋 Configuration Summary:");
    println!("   • Listen Address: {}", config.listen_addr);
    println!("   • Webapps Directory: {}", config.webapps_dir);
    println!("   • Definition Files: {outcomes}");
    println!("   • Applications: {}", store.snapshot().len());
    println!("   • Reload Enabled: {}", config.reload.enabled);
    println!();

    if rejected > 0 {
        eprintln!("❌ {rejected} definition file(s) were rejected; see the log output above");
        std::process::exit(1);
    }
    println!("🎉 Configuration is valid and ready to use!");
    Ok(())
}

/// Initialize a new configuration file and a sample ROOT application
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = ServerConfig::default();
    let config_text = format!(
        r#"# Atrium Configuration

# The address to listen on
listen_addr = "{listen_addr}"

# One sub-directory per application; ROOT is mounted at "/"
webapps_dir = "{webapps_dir}"

max_body_bytes = {max_body_bytes}

[reserved]
# favicon = "./favicon.ico"
# resources_dir = "./resources"
resources_prefix = "/_static"
status_path = "/_status"

[statics]
max_age_secs = 86400

[session]
cookie_name = "ATRIUMSESSIONID"
idle_timeout_secs = 1800

[scripts]
max_operations = 1000000

[reload]
enabled = true
debounce_ms = 200

[logging]
level = "info"
json = false

# Values published to controllers through the tool registry
[tools.site]
title = "Atrium"
"#,
        listen_addr = default_config.listen_addr,
        webapps_dir = default_config.webapps_dir,
        max_body_bytes = default_config.max_body_bytes,
    );

    let root = Path::new(&default_config.webapps_dir).join("ROOT");
    tokio::fs::create_dir_all(root.join("assets"))
        .await
        .context("Failed to create sample application directory")?;
    tokio::fs::write(
        root.join("app.json"),
        r#"{
  "controllers": { "/health": "Health", "/": "index.rhai" },
  "statics": { "/assets/*": "assets" }
}
"#,
    )
    .await
    .context("Failed to write sample definition")?;
    tokio::fs::write(
        root.join("index.rhai"),
        r#"let title = tools.call("site", "lookup", ["/title"]);
response.content_type("text/html; charset=utf-8");
response.write(`<h1>Welcome to ${title}</h1>`);
"#,
    )
    .await
    .context("Failed to write sample script")?;

    tokio::fs::write(path, config_text)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("✅ Created sample application at: {}", root.display());
    println!("   Run 'atrium serve --config {config_path}' to start the server");
    Ok(())
}
