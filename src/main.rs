use std::sync::Arc;

use strata::api::auth::{MemoryWorkflowProvider, StaticTokenVerifier, TokenVerifier, WorkflowProvider};
use strata::api::{server, ApiState};
use strata::broker::cleanup;
use strata::broker::queue::InProcessBroker;
use strata::broker::worker::{WorkerConfig, WorkerPool};
use strata::broker::TaskBroker;
use strata::db::memory::MemoryStore;
use strata::db::ExecutionStore;
use strata::eventbus::EventBus;
use strata::workflow::executor::{ExecutorConfig, WorkflowExecutor};
use strata::workflow::invoker::{EchoInvoker, HandlerRegistry};
use strata::workflow::retry::RetryPolicy;
use strata::{EngineConfig, ExecutionService};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    #[cfg(feature = "database")]
    if let Err(err) = dotenvy::dotenv() {
        if err.not_found() {
            log::debug!("no .env file found, using environment variables");
        } else {
            log::warn!("failed to load .env file: {err}");
        }
    }

    let config = EngineConfig::from_env();

    let store = build_store().await;

    let bus = Arc::new(EventBus::new(config.send_buffer));
    let executor = Arc::new(WorkflowExecutor::new(
        store.clone(),
        bus.clone(),
        Arc::new(EchoInvoker),
        Arc::new(HandlerRegistry::new()),
        ExecutorConfig {
            level_fanout: config.level_fanout,
            retry: RetryPolicy::default(),
        },
    ));

    let broker = Arc::new(InProcessBroker::new());
    let service = Arc::new(ExecutionService::new(
        store.clone(),
        executor.clone(),
        Some(broker.clone() as Arc<dyn TaskBroker>),
        &config,
    ));

    let pool = Arc::new(WorkerPool::new(
        broker.clone(),
        executor,
        store.clone(),
        WorkerConfig::from_engine(&config),
    ));
    let _workers = pool.spawn();
    let _scheduler = cleanup::spawn_scheduler(
        broker.clone() as Arc<dyn TaskBroker>,
        config.cleanup_interval,
    );

    let verifier = Arc::new(StaticTokenVerifier::new());
    if let Ok(token) = std::env::var("STRATA_API_TOKEN") {
        let user_id = uuid::Uuid::new_v4();
        verifier.insert(token, user_id);
        log::info!("static API token registered for user {user_id}");
    }

    let state = ApiState {
        service,
        store,
        bus,
        verifier: verifier as Arc<dyn TokenVerifier>,
        provider: Arc::new(MemoryWorkflowProvider::new()) as Arc<dyn WorkflowProvider>,
    };

    if let Err(err) = server::start_api_server(state, config.api_port).await {
        log::error!("API server error: {err}");
        std::process::exit(1);
    }
}

#[cfg(feature = "database")]
async fn build_store() -> Arc<dyn ExecutionStore> {
    use strata::db::postgres::{create_pool, PgStore};

    match std::env::var("DATABASE_URL") {
        Ok(database_url) => match create_pool(&database_url).await {
            Ok(pool) => {
                log::info!("STRATA initialized with database connection");
                Arc::new(PgStore::new(pool))
            }
            Err(err) => {
                log::warn!("failed to connect to database: {err}; using in-memory store");
                Arc::new(MemoryStore::new())
            }
        },
        Err(_) => {
            log::info!("DATABASE_URL not set; using in-memory store");
            Arc::new(MemoryStore::new())
        }
    }
}

#[cfg(not(feature = "database"))]
async fn build_store() -> Arc<dyn ExecutionStore> {
    log::info!("STRATA initialized (database feature disabled)");
    Arc::new(MemoryStore::new())
}
