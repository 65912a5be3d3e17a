//! CSM Module Operator
//!
//! Deploys a Dell CSI driver and its feature modules from
//! `ContainerStorageModule` resources.
//!
//! ```text
//! csm-module-operator                 run the controller
//! csm-module-operator render csm.yaml print the objects a resource produces
//! csm-module-operator crd             print the CustomResourceDefinition
//! ```

use clap::{Parser, Subcommand};
use hyper::{Body, Response, StatusCode};
use kube::CustomResourceExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use csm_module_operator::config::DEFAULT_CONFIG_DIRECTORY;
use csm_module_operator::controlplane::controller;
use csm_module_operator::{
    ContainerStorageModule, EngineMetrics, Error, InMemoryCluster, KubeObjectClient,
    KubeResourceLookup, ModuleEngine, OperatorConfig, ReconcileMode, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// CSM Module Operator - composes CSI drivers with their feature modules
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Root of the template store
    #[arg(long, env = "CONFIG_DIR", default_value = DEFAULT_CONFIG_DIRECTORY)]
    config_dir: PathBuf,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Only watch resources in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render a ContainerStorageModule without a cluster and print the objects
    Render {
        /// ContainerStorageModule manifest
        file: PathBuf,

        /// Fail modules whose secrets or config maps are not declared
        #[arg(long)]
        strict: bool,
    },
    /// Print the ContainerStorageModule CustomResourceDefinition
    Crd,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = OperatorConfig::with_config_directory(&args.config_dir);

    match &args.command {
        Some(Command::Render { file, strict }) => render(config, file, *strict).await,
        Some(Command::Crd) => {
            print!("{}", serde_yaml::to_string(&ContainerStorageModule::crd())?);
            Ok(())
        }
        None => run_operator(&args, config).await,
    }
}

async fn run_operator(args: &Args, config: OperatorConfig) -> Result<()> {
    info!("Starting CSM Module Operator");
    info!("  Version: {}", csm_module_operator::VERSION);
    info!("  Config directory: {}", config.config_directory.display());
    info!(
        "  Watch namespace: {}",
        args.watch_namespace.as_deref().unwrap_or("<all>")
    );

    let client = kube::Client::try_default().await?;
    let metrics = Arc::new(EngineMetrics::new()?);

    let engine = ModuleEngine::new(
        config.clone(),
        Arc::new(KubeObjectClient::new(client.clone(), config.field_manager.clone())),
        Arc::new(KubeResourceLookup::new(client.clone())),
    )
    .with_metrics(metrics.clone());

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    controller::run(client, engine, args.watch_namespace.clone()).await;

    info!("Operator shutdown complete");
    Ok(())
}

/// Render a resource against an in-memory control plane and print what
/// ends up in it
async fn render(config: OperatorConfig, file: &Path, strict: bool) -> Result<()> {
    let text = std::fs::read_to_string(file)?;
    let csm: ContainerStorageModule = serde_yaml::from_str(&text)?;

    let cluster = Arc::new(InMemoryCluster::new());
    if !strict {
        cluster.assume_prerequisites();
    }
    let engine = ModuleEngine::new(config, cluster.clone(), cluster.clone());

    let report = engine
        .run(&csm, ReconcileMode::Install, &CancellationToken::new())
        .await?;
    for failure in report.failures() {
        warn!("{}", failure);
    }

    for object in cluster.objects() {
        print!("---\n{}", object.to_yaml()?);
    }

    if report.is_success() {
        Ok(())
    } else {
        Err(Error::Internal(format!(
            "{} of {} modules failed",
            report.failures().len(),
            report.modules.len()
        )))
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    // Render output goes to stdout; keep logs on stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid health server address: {}", e))
    })?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<EngineMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok((buffer, content_type)) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                if let Ok(value) = HeaderValue::from_str(&content_type) {
                                    response.headers_mut().insert(CONTENT_TYPE, value);
                                }
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr.parse().map_err(|e| {
        Error::Configuration(format!("Invalid metrics server address: {}", e))
    })?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
