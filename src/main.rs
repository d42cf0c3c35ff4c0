use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ace_core::config::{base_dir, Config, ConfigOverrides};
use ace_core::models::{AnalysisRequest, RootAnalysis};
use ace_core::utils::crypto::{initialize_encryption_settings, EncryptionSettings};
use ace_core::utils::{self, ScheduledExecutor, ScheduledTask};
use ace_core::{db, handlers, AppState};

#[derive(Parser, Debug)]
#[command(name = "ace")]
#[command(version, about = "ACE - Analysis Correlation Engine")]
struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<String>,

    /// Database URL (overrides config file)
    #[arg(long, value_name = "URL", global = true)]
    db: Option<String>,

    /// Content storage directory (overrides config file)
    #[arg(long, value_name = "PATH", global = true)]
    storage_root: Option<String>,

    /// Logging level (overrides config file, e.g. "info,ace_core=debug")
    #[arg(long, value_name = "LEVEL", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the service database, initialize encryption settings from
    /// ACE_ADMIN_PASSWORD and create the initial admin api key
    Initialize,

    /// Manage api keys
    ApiKey {
        #[command(subcommand)]
        command: ApiKeyCommands,
    },

    /// Submit a root with the given observables for analysis
    Analyze {
        /// Analysis mode of the submitted root
        #[arg(short = 'm', long)]
        mode: Option<String>,

        /// type value [type value ...]
        #[arg(required = true, num_args = 2..)]
        observables: Vec<String>,
    },

    /// Start the embedded server
    Serve {
        /// Listen address (overrides config file)
        #[arg(long)]
        host: Option<String>,

        /// Listen port (overrides config file)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand, Debug)]
enum ApiKeyCommands {
    Create {
        name: String,
        /// Grant admin access to this key
        #[arg(long)]
        admin: bool,
    },
    List,
    Delete {
        name: String,
    },
}

/// Periodic maintenance: expired cached results, expired analysis requests
/// and expired stored content.
struct MaintenanceSweep {
    state: AppState,
}

impl ScheduledTask for MaintenanceSweep {
    fn run(&self) -> Pin<Box<dyn Future<Output = Result<(), anyhow::Error>> + Send + '_>> {
        Box::pin(async move {
            self.state.cache.delete_expired_cached_analysis_results().await?;
            self.state.engine.process_expired_analysis_requests().await?;
            self.state.storage.delete_expired_content().await?;
            Ok(())
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let overrides = ConfigOverrides {
        config: cli.config.clone(),
        db: cli.db.clone(),
        storage_root: cli.storage_root.clone(),
        log_level: cli.log_level.clone(),
        ..Default::default()
    };
    let config = Config::load(&overrides)?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    let _log_guard = if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path.file_name().and_then(|n| n.to_str()).unwrap_or("ace.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    };

    // make sure the base directory exists before sqlite opens its file
    let _ = std::fs::create_dir_all(base_dir());

    let pool = db::create_pool(&config.database.url).await?;
    let state = AppState::initialize(pool.clone(), config.storage.root.clone());
    state.restore_work_queues().await?;

    // encryption settings ride in the environment; load the key when the
    // admin password is also present
    if let Some(mut settings) = EncryptionSettings::from_env()? {
        if let Ok(password) = std::env::var("ACE_ADMIN_PASSWORD") {
            settings.load_aes_key(&password)?;
            tracing::info!("analysis detail encryption key loaded");
        }
        state.analysis_tracking.set_encryption_settings(settings);
    }

    match cli.command {
        Commands::Initialize => initialize(&state).await,
        Commands::ApiKey { command } => api_key(&state, command).await,
        Commands::Analyze { mode, observables } => analyze(&state, mode, observables).await,
        Commands::Serve { host, port } => {
            let host = host.unwrap_or(config.server.host);
            let port = port.unwrap_or(config.server.port);
            serve(state, &host, port).await
        },
    }
}

async fn initialize(state: &AppState) -> Result<(), anyhow::Error> {
    let password = std::env::var("ACE_ADMIN_PASSWORD")
        .map_err(|_| anyhow::anyhow!("ACE_ADMIN_PASSWORD must be set to initialize"))?;

    let settings = initialize_encryption_settings(&password)?;
    state.analysis_tracking.set_encryption_settings(settings.clone());

    let api_key = utils::create_api_key(&state.db, "admin", true).await?;

    for (name, value) in settings.export_env() {
        println!("export {}={}", name, value);
    }
    println!("export ACE_API_KEY={}", api_key);

    tracing::info!("initialization complete");
    Ok(())
}

async fn api_key(state: &AppState, command: ApiKeyCommands) -> Result<(), anyhow::Error> {
    match command {
        ApiKeyCommands::Create { name, admin } => {
            let api_key = utils::create_api_key(&state.db, &name, admin).await?;
            println!("{}", api_key);
        },
        ApiKeyCommands::List => {
            for key in utils::list_api_keys(&state.db).await? {
                println!("{}{}", key.name, if key.is_admin { " (admin)" } else { "" });
            }
        },
        ApiKeyCommands::Delete { name } => {
            if !utils::delete_api_key(&state.db, &name).await? {
                anyhow::bail!("unknown api key {}", name);
            }
        },
    }
    Ok(())
}

async fn analyze(
    state: &AppState,
    mode: Option<String>,
    observables: Vec<String>,
) -> Result<(), anyhow::Error> {
    if observables.len() % 2 != 0 {
        anyhow::bail!("observables must be given as type value pairs");
    }

    let mut root = RootAnalysis::new();
    root.tool = Some("ace".to_string());
    root.analysis_mode = mode;
    for pair in observables.chunks(2) {
        root.add_observable(pair[0].clone(), pair[1].clone(), None);
    }

    let uuid = root.uuid.clone();
    state.engine.submit_analysis_request(AnalysisRequest::root_request(root)).await?;

    match state.analysis_tracking.get_root_analysis(&uuid).await? {
        Some(tracked) => println!("{}", serde_json::to_string_pretty(&tracked)?),
        // an expiring root with nothing to analyze is deleted on submission
        None => println!("root {} completed and expired", uuid),
    }

    for amt in state.registry.get_all_analysis_module_types().await? {
        let size = state.work_queues.get_queue_size(&amt.name).await?;
        if size > 0 {
            tracing::info!("{} request(s) queued for {}", size, amt.name);
        }
    }

    Ok(())
}

async fn serve(state: AppState, host: &str, port: u16) -> Result<(), anyhow::Error> {
    let executor = ScheduledExecutor::new("maintenance-sweep", Duration::from_secs(60));
    let sweep = MaintenanceSweep { state: state.clone() };
    tokio::spawn(async move {
        executor.start(sweep).await;
    });

    let app = handlers::router(state);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("server listening on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
