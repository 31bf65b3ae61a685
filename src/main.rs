use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use octobot::broker::EventBroker;
use octobot::completion::CompletionDispatcher;
use octobot::composite::{local_connector, VmDockerComposite};
use octobot::config;
use octobot::credentials::CredentialCipher;
use octobot::lifecycle::SessionLifecycleEngine;
use octobot::sandbox::docker::DockerProvider;
use octobot::sandbox::SandboxProvider;
use octobot::store::{PgStore, Store};
use octobot::vm::VmManager;
use octobot::workspace::WorkspaceProvider;
use octobot::{routes::api_routes, AppState};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "Octobot API"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast on missing required configuration.
    let _ = config::SANDBOX_IMAGE.as_str();
    let _ = config::OCTOBOT_SECRET.as_str();

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;

    if let Err(error) = sqlx::migrate!().run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(?error, "database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE");
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let workspace = Arc::new(WorkspaceProvider::new(config::SESSION_BASE_DIR.as_str()));
    let broker = Arc::new(EventBroker::new(
        *config::EVENT_RETENTION_ENTRIES,
        *config::EVENT_RETENTION_SECONDS,
    ));

    let provider: Arc<dyn SandboxProvider> = match config::CONTAINER_RUNTIME.as_str() {
        "vm-docker" => build_vm_docker_provider(store.clone()).await?,
        _ => {
            let connector = local_connector();
            Arc::new(DockerProvider::new(&connector, config::SANDBOX_IMAGE.clone())?)
        }
    };

    let lifecycle = Arc::new(SessionLifecycleEngine::new(
        store.clone(),
        provider.clone(),
        workspace.clone(),
        broker.clone(),
    ));
    let completion = Arc::new(CompletionDispatcher::new(store.clone(), provider.clone(), broker.clone()));
    lifecycle.set_completion_dispatcher(completion.clone());

    match CredentialCipher::from_env() {
        Ok(cipher) => lifecycle.set_credential_cipher(Arc::new(cipher)),
        Err(e) => tracing::warn!(error = %e, "credential decryption disabled"),
    }

    if let Err(e) = lifecycle.reconcile_on_boot().await {
        tracing::error!(error = %e, "boot reconciliation failed");
    }
    lifecycle.spawn_watch_loop();

    let state = AppState {
        store,
        provider,
        workspace,
        broker,
        lifecycle,
        completion,
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(state));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "listening for incoming connections");
    axum::Server::bind(&addr).serve(app.into_make_service()).await?;

    Ok(())
}

/// Builds the VM Manager + Docker Provider composite (§4.6), resolving
/// sessions to projects via a direct store lookup -- acceptable since the
/// resolver only runs once per uncached session on the composite's cold
/// path, not per request.
async fn build_vm_docker_provider(
    store: Arc<dyn Store>,
) -> Result<Arc<dyn SandboxProvider>, Box<dyn std::error::Error>> {
    #[cfg(feature = "libvirt-executor")]
    {
        let driver = Arc::new(octobot::vm::libvirt::LibvirtHypervisor::new(
            octobot::vm::libvirt::config_from_env(),
        ));
        let vm_manager = Arc::new(VmManager::new(driver));
        let resolver_store = store.clone();
        // `provider_for_session` calls this resolver synchronously, but the
        // project lookup needs the store -- `block_in_place` hands the
        // current worker thread to a nested blocking call rather than
        // threading an async resolver type through the composite (tokio's
        // documented escape hatch for sync code that must call async code
        // it cannot avoid).
        let resolver: Arc<dyn Fn(uuid::Uuid) -> uuid::Uuid + Send + Sync> =
            Arc::new(move |session_id| {
                tokio::task::block_in_place(|| {
                    tokio::runtime::Handle::current().block_on(async {
                        resolver_store
                            .get_session(session_id)
                            .await
                            .map(|s| s.project_id)
                            .unwrap_or(session_id)
                    })
                })
            });
        let composite = Arc::new(VmDockerComposite::new(
            vm_manager,
            config::SANDBOX_IMAGE.clone(),
            resolver,
            *config::IDLE_TIMEOUT_SECS,
        ));
        composite.spawn_idle_reaper(Duration::from_secs(60));
        let provider: Arc<dyn SandboxProvider> = composite;
        Ok(provider)
    }
    #[cfg(not(feature = "libvirt-executor"))]
    {
        let _ = store;
        Err("CONTAINER_RUNTIME=vm-docker requires building with --features libvirt-executor".into())
    }
}
