use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bisectd::config::Settings;
use bisectd::executor::{BisectExecutor, ExecutorConfig};
use bisectd::forge::GithubAppClient;
use bisectd::job::WorkerId;
use bisectd::sandbox::{DockerSandbox, Sandbox};
use bisectd::scheduler::{Scheduler, SchedulerConfig};
use bisectd::store::ClaimTimings;
use bisectd_sqlx::PgJobStore;

use bisectd_server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // A configuration error is a non-zero exit before anything else starts.
    let settings = Settings::from_env().context("configuration")?;
    let worker = WorkerId::for_this_process();

    info!(
        worker = %worker,
        database = %settings.database_display(),
        max_concurrent_jobs = settings.max_concurrent_jobs,
        bisect_timeout_secs = settings.bisect_timeout.as_secs(),
        sandbox_image = %settings.sandbox_image,
        "starting"
    );

    let store = PgJobStore::connect(&settings.database_url, ClaimTimings::default())
        .await
        .context("connecting to the job store")?;

    let forge = Arc::new(
        GithubAppClient::new(
            &settings.forge_api_base,
            &settings.forge_app_id,
            &settings.forge_private_key,
        )
        .context("forge client")?,
    );

    let sandbox = DockerSandbox::new(&settings.sandbox_image);
    if !sandbox.available().await {
        warn!("sandbox runtime is not reachable; jobs will fail until it is");
    }

    let executor = Arc::new(BisectExecutor::new(
        store.clone(),
        Arc::clone(&forge),
        sandbox.clone(),
        worker.clone(),
        ExecutorConfig {
            workspace_root: settings.workspace_root.clone(),
            ..ExecutorConfig::default()
        },
    ));

    let scheduler_config = SchedulerConfig {
        max_concurrent_jobs: settings.max_concurrent_jobs,
        job_budget: settings.bisect_timeout,
        ..SchedulerConfig::default()
    };
    let mut scheduler =
        Scheduler::new(store.clone(), executor, worker.clone(), scheduler_config).spawn();

    let state = AppState {
        store,
        forge,
        sandbox: Arc::new(sandbox),
        webhook_secret: settings.forge_webhook_secret.clone(),
        waker: scheduler.waker(),
        worker,
        max_concurrent_jobs: settings.max_concurrent_jobs,
    };

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    info!(addr = %settings.bind_addr, "listening");

    axum::serve(listener, bisectd_server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("draining scheduler");
    scheduler
        .graceful_shutdown()
        .await
        .context("scheduler shutdown")?;
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGTERM (the deployment's drain signal) or ctrl-c.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            warn!(error = %err, "no SIGTERM handler; falling back to ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}
