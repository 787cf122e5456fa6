use std::future::IntoFuture;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use dispatch_llm::gateway::config::GatewayConfig;
use dispatch_llm::gateway::redis_store::RedisStore;
use dispatch_llm::gateway::sqlite_store::SqliteLogStore;
use dispatch_llm::gateway::Gateway;

struct CliArgs {
    config_path: String,
    listen: String,
    log_dir: Option<PathBuf>,
    redis_url: Option<String>,
    json_logs: bool,
}

fn usage() -> &'static str {
    "usage: dispatch-gateway <config.json> [--port N] [--listen HOST:PORT] [--log-dir PATH] [--redis URL] [--json-logs]"
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<CliArgs, String> {
    let config_path = args.next().ok_or_else(|| usage().to_string())?;

    let mut listen = "127.0.0.1:3000".to_string();
    let mut log_dir: Option<PathBuf> = None;
    let mut redis_url: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--port" => {
                let raw = args.next().ok_or("missing value for --port")?;
                let port: u16 = raw.parse().map_err(|_| "invalid --port".to_string())?;
                listen = format!("127.0.0.1:{port}");
            }
            "--listen" | "--addr" => {
                listen = args.next().ok_or("missing value for --listen/--addr")?;
            }
            "--log-dir" => {
                log_dir = Some(args.next().ok_or("missing value for --log-dir")?.into());
            }
            "--redis" => {
                redis_url = Some(args.next().ok_or("missing value for --redis")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => return Err(format!("unknown arg: {other}")),
        }
    }

    Ok(CliArgs {
        config_path,
        listen,
        log_dir,
        redis_url,
        json_logs,
    })
}

fn init_tracing(json_logs: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::from(1);
        }
    };

    init_tracing(args.json_logs);

    let mut config = match GatewayConfig::from_file(&args.config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config {}: {err}", args.config_path);
            return ExitCode::from(1);
        }
    };
    config.apply_env();
    if let Some(url) = args.redis_url {
        config.redis_url = Some(url);
    }

    let mut builder = Gateway::builder(config.clone());

    if let Some(url) = config.redis_url.as_deref() {
        match RedisStore::connect(url) {
            Ok(store) => {
                let store = Arc::new(store);
                if let Err(err) = store.ping().await {
                    tracing::warn!(error = %err, "redis unreachable, falling back to local stores");
                } else {
                    if let Err(err) = store.load_scripts().await {
                        tracing::warn!(error = %err, "script preload failed, EVAL fallback stays active");
                    }
                    builder = builder.with_redis(store);
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "invalid redis url, falling back to local stores");
            }
        }
    }

    let sqlite_path = args
        .log_dir
        .map(|dir| dir.join("dispatch-logs.sqlite"))
        .or_else(|| config.sqlite_path.clone().map(PathBuf::from));
    if let Some(path) = sqlite_path {
        match SqliteLogStore::open(&path) {
            Ok(store) => {
                builder = builder.with_log_store(Arc::new(store));
            }
            Err(err) => {
                eprintln!("failed to open log store at {}: {err}", path.display());
                return ExitCode::from(2);
            }
        }
    }

    let gateway = builder.build();
    gateway.semantic_cache.load_from_store().await;

    let app = dispatch_llm::gateway::http::router(gateway.clone());
    let listener = match tokio::net::TcpListener::bind(&args.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("failed to bind {}: {err}", args.listen);
            return ExitCode::from(2);
        }
    };

    tracing::info!(listen = %args.listen, channels = gateway.registry.channel_count(), "dispatch-gateway listening");

    let serve = axum::serve(listener, app).into_future();
    let result = tokio::select! {
        result = serve => result,
        _ = shutdown_signal() => Ok(()),
    };

    gateway.shutdown().await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("server error: {err}");
            ExitCode::from(2)
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
