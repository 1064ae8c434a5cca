use std::{process, sync::Arc, time::Duration};

use certcache::{
    application::{
        error::AppError,
        gateway::CacheGateway,
        generator::{ArtifactGenerator, PrefixGenerator},
        jobs::{JobQueue, JobRunner, JobSource, PoolConfig, WorkerPool},
        watcher::ExpirationWatcher,
    },
    config::{self, GenerateArgs},
    domain::types::{ArtifactKey, GenerationRequest},
    infra::{
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
    store,
};
use tokio::{signal, sync::watch};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        AppError::from(InfraError::configuration(format!(
            "failed to load configuration: {err}"
        )))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Generate(args) => run_generate(settings, args).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let store = store::connect(&settings.store)
        .await
        .map_err(InfraError::from)?;
    let generator: Arc<dyn ArtifactGenerator> =
        Arc::new(PrefixGenerator::new(settings.generation.prefix.clone()));

    let (pool, queue) = WorkerPool::start(PoolConfig::from(&settings), store.clone(), generator);

    spawn_cold_start(queue.clone(), settings.host.key.clone());
    let watcher = ExpirationWatcher::new(store.clone(), queue.clone(), &settings.host)
        .spawn(pool.shutdown_signal());

    let state = HttpState {
        gateway: Arc::new(CacheGateway::new(store.clone(), queue)),
        store,
        retry_after: settings.workers.pause.max(Duration::from_secs(1)),
    };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(addr = %settings.server.addr, "certcache listening");

    let (stop_http, mut http_stopped) = watch::channel(false);
    let mut server = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = http_stopped.changed().await;
            })
            .await
    });

    let server_exit = tokio::select! {
        _ = shutdown_signal() => None,
        result = &mut server => Some(result),
    };

    let grace = settings.server.graceful_shutdown;
    let _ = stop_http.send(true);
    pool.shutdown(grace).await;
    if let Err(err) = watcher.await {
        warn!(error = %err, "expiration watcher task failed");
    }

    let server_result = match server_exit {
        Some(result) => result,
        None => match tokio::time::timeout(grace, &mut server).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    grace_ms = grace.as_millis() as u64,
                    "http listener did not drain in time"
                );
                server.abort();
                return Ok(());
            }
        },
    };

    info!("certcache stopped");
    server_result
        .map_err(|err| AppError::unexpected(format!("http server task failed: {err}")))?
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

/// Warm the host artifact once at startup without holding up the listener.
fn spawn_cold_start(queue: JobQueue, host: ArtifactKey) {
    tokio::spawn(async move {
        match queue
            .submit(GenerationRequest::new(host.clone()), JobSource::Startup)
            .await
        {
            Ok(_) => info!(host = %host, "queued cold-start host generation"),
            Err(err) => warn!(host = %host, error = %err, "cold-start host generation not queued"),
        }
    });
}

async fn run_generate(settings: config::Settings, args: GenerateArgs) -> Result<(), AppError> {
    let keys = args
        .keys
        .into_iter()
        .map(ArtifactKey::parse)
        .collect::<Result<Vec<_>, _>>()?;

    if settings.store.url.is_none() {
        warn!("no store url configured; generated artifacts are discarded at exit");
    }

    let store = store::connect(&settings.store)
        .await
        .map_err(InfraError::from)?;
    let runner = JobRunner::new(
        store,
        Arc::new(PrefixGenerator::new(settings.generation.prefix.clone())),
        settings.generation.ttl,
        settings.generation.store_write_attempts,
    );

    let mut failed = 0usize;
    for key in &keys {
        let outcome = runner.run(key).await;
        if outcome.is_stored() {
            info!(key = %key, "artifact generated");
        } else {
            error!(key = %key, outcome = ?outcome, "artifact generation failed");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(AppError::unexpected(format!(
            "{failed} of {} artifacts failed",
            keys.len()
        )));
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
