//! ci-images-mirror - mirror CI image stream tags and serve the mirror log.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ci_images_mirror::leader::default_identity;
use ci_images_mirror::{router, FileConfigAgent, KubeImageStreams, LeaseLeadership, Options};
use ci_mirror_core::config::LogFormat;
use ci_mirror_runtime::{
    Collaborators, Controller, DockerConfig, ImageTagClient, MirrorStore, PollingWatcher,
    RegistryMirrorer,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let options = Options::parse();
    init_tracing(options.log_format);

    let config = options.into_config().map_err(|e| {
        tracing::error!(error = %e, "Invalid options");
        e
    })?;

    let credentials = DockerConfig::load(&options.registry_config)
        .context("failed to load registry credentials")?;
    tracing::info!(
        path = %options.registry_config.display(),
        registries = credentials.registries().len(),
        "Loaded registry credentials"
    );

    let agent = Arc::new(
        FileConfigAgent::load(&options.release_repo_git_sync_path)
            .context("failed to load release repository")?,
    );

    let kube = kube::Client::try_default()
        .await
        .context("failed to build cluster client")?;

    let addr = SocketAddr::from(([0, 0, 0, 0], options.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    let store = Arc::new(MirrorStore::new(config.retention));
    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut background = Vec::new();
    if options.controller_enabled() {
        let client: Arc<dyn ImageTagClient> = Arc::new(KubeImageStreams::new(kube.clone()));
        let watcher = PollingWatcher::new(
            Arc::clone(&client),
            config.poll_interval(),
            config.cluster_timeout(),
        );
        let leadership = Arc::new(LeaseLeadership::new(
            kube,
            &options.leader_election_namespace,
            options.lease_name(),
            default_identity(),
        ));
        background.push(leadership.start(shutdown.clone()));
        background.push(
            agent
                .watch(shutdown.clone())
                .context("failed to watch release repository")?,
        );

        let controller = Arc::new(Controller::new(
            &config,
            Collaborators {
                client,
                watcher: Arc::new(watcher),
                mirrorer: Arc::new(RegistryMirrorer::new(credentials)),
                provider: agent.clone(),
                registry: agent,
                leadership,
            },
            Arc::clone(&store),
        ));
        let token = shutdown.clone();
        background.push(tokio::spawn(async move {
            if let Err(e) = controller.run(token.clone()).await {
                tracing::error!(error = %e, "Controller stopped");
                token.cancel();
            }
        }));
    } else {
        tracing::warn!("No controller enabled, serving the query API only");
    }

    tracing::info!(
        addr = %addr,
        dry_run = config.dry_run,
        destination = %config.destination_repository,
        "Serving query API"
    );
    axum::serve(listener, router(store))
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await
        .context("query API server failed")?;

    shutdown.cancel();
    for task in background {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task failed");
        }
    }
    tracing::info!("Shut down");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested");
    shutdown.cancel();
}
