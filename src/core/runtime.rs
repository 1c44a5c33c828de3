//! Runtime assembly
//!
//! Builds every subsystem in dependency order and wires them through the
//! handler registry. All interfaces (HTTP ingress, CLI) share this setup so
//! behavior never depends on how muster was started.

use super::{CoreToolProvider, Dependencies};
use crate::aggregator::{Aggregator, ArcDispatcher};
use crate::auth::{ChallengeManager, EgressAuthenticator, TokenStore, build_auth};
use crate::config::{Config, DefinitionStore};
use crate::event::{EventBus, EventSink, FileEventSink, NullEventSink};
use crate::reconciler::Reconciler;
use crate::registry::HandlerRegistry;
use crate::storage::Storage;
use crate::supervisor::Supervisor;
use crate::workflow::{WorkflowEngine, WorkflowToolProvider};
use crate::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The assembled control plane
pub struct Runtime {
    pub config: Arc<Config>,
    pub registry: Arc<HandlerRegistry>,
    pub bus: Arc<EventBus>,
    pub sink: Arc<dyn EventSink>,
    pub storage: Arc<dyn Storage>,
    pub token_store: Arc<TokenStore>,
    pub challenges: Arc<ChallengeManager>,
    pub egress: Arc<EgressAuthenticator>,
    pub aggregator: Arc<Aggregator>,
    pub supervisor: Arc<Supervisor>,
    pub definitions: Arc<DefinitionStore>,
    pub reconciler: Arc<Reconciler>,
    pub engine: Arc<WorkflowEngine>,
    pub cancel: CancellationToken,
}

impl Runtime {
    /// Graceful shutdown: stop all services, stop background loops, drain
    /// the event bus with a bounded timeout.
    pub async fn shutdown(&self) {
        tracing::info!("shutting down");
        self.supervisor.shutdown().await;
        self.cancel.cancel();
        if !self
            .bus
            .drain(crate::constants::EVENT_DRAIN_TIMEOUT)
            .await
        {
            tracing::warn!("event bus not fully drained before shutdown");
        }
    }
}

/// Build the whole control plane from configuration
pub async fn create_runtime(config: Config) -> Result<Runtime> {
    config.validate()?;
    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let registry = Arc::new(HandlerRegistry::new());
    let bus = Arc::new(EventBus::new());

    let sink: Arc<dyn EventSink> = match &config.event_log {
        Some(path) => Arc::new(FileEventSink::new(path).await?),
        None => Arc::new(NullEventSink),
    };

    let storage = crate::storage::create_storage_from_config(&config.storage).await?;

    let own_issuer = config.oauth.as_ref().and_then(|oauth| oauth.issuer_url.clone());
    let (token_store, challenges, egress) =
        build_auth(config.oauth_client_config(), own_issuer)?;

    let aggregator = Arc::new(Aggregator::new(egress.clone(), bus.clone()));
    registry.register(crate::constants::HANDLER_AGGREGATOR, aggregator.clone());
    registry.register(
        crate::constants::HANDLER_TOOL_DISPATCHER,
        Arc::new(ArcDispatcher(aggregator.clone())),
    );
    registry.register(crate::constants::HANDLER_EVENT_BUS, bus.clone());
    registry.register(crate::constants::HANDLER_TOKEN_STORE, token_store.clone());

    let supervisor = Supervisor::new(registry.clone(), bus.clone(), sink.clone());
    registry.register(crate::constants::HANDLER_SUPERVISOR, supervisor.clone());

    let definitions = Arc::new(DefinitionStore::new());
    if let Some(ref dir) = config.definitions_dir {
        let loaded = definitions.load_dir(std::path::Path::new(dir))?;
        tracing::info!("loaded {} definitions from {}", loaded.len(), dir);
    }

    let reconciler = Reconciler::new(
        definitions.clone(),
        supervisor.clone(),
        registry.clone(),
        bus.clone(),
        sink.clone(),
        cancel.child_token(),
    );

    let engine = Arc::new(WorkflowEngine::new(
        registry.clone(),
        storage.clone(),
        config.history_limit,
    ));

    aggregator.add_provider(Arc::new(CoreToolProvider::new(Dependencies {
        definitions: definitions.clone(),
        supervisor: supervisor.clone(),
        reconciler: reconciler.clone(),
        egress: egress.clone(),
    })));
    aggregator.add_provider(Arc::new(WorkflowToolProvider::new(
        engine.clone(),
        definitions.clone(),
    )));

    Ok(Runtime {
        config,
        registry,
        bus,
        sink,
        storage,
        token_store,
        challenges,
        egress,
        aggregator,
        supervisor,
        definitions,
        reconciler,
        engine,
        cancel,
    })
}
