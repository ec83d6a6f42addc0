use chrono::Duration;
use std::sync::Arc;
use tracing::{error, info};

use deploybot_core::bindings::ConfigLoader;
use deploybot_core::clock::{Clock, SystemClock};
use deploybot_core::dispatcher::Dispatcher;
use deploybot_core::logbroker::LogBroker;
use deploybot_core::queue::JobQueue;
use deploybot_core::registry::AgentRegistry;
use deploybot_core::store::Store;
use deploybot_core::webhook::WebhookTranslator;

use crate::config::ControllerConfig;

/// Shared application state passed to all route handlers. Singletons are
/// built once at startup and shared by reference; there is no global state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ControllerConfig>,
    pub clock: Arc<dyn Clock>,
    pub store: Arc<Store>,
    pub queue: Arc<JobQueue>,
    pub registry: Arc<AgentRegistry>,
    pub broker: Arc<LogBroker>,
    pub dispatcher: Arc<Dispatcher>,
    pub bindings: Arc<ConfigLoader>,
    pub translator: Arc<WebhookTranslator>,
}

impl AppState {
    /// Open the store, replay recovery into the queue, and wire up every
    /// component. Fails fast on an unopenable store, malformed bindings, or
    /// a missing webhook secret.
    pub fn new(config: ControllerConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(Store::open(&config.db_path)?);

        let recovery = store.recover(
            Duration::seconds(config.orphan_timeout_secs),
            clock.now(),
        )?;
        info!(
            pending = recovery.pending.len(),
            running = recovery.running.len(),
            reassigned = recovery.reassigned,
            "store recovered"
        );

        let queue = Arc::new(JobQueue::new(store.clone()));
        queue.rebuild(&recovery);

        let broker = Arc::new(LogBroker::with_capacity(
            store.clone(),
            config.log_ring_capacity,
            config.subscriber_buffer,
        ));
        let registry = Arc::new(AgentRegistry::new(
            store.clone(),
            clock.clone(),
            Duration::seconds(config.stale_after_secs),
            Duration::seconds(config.offline_after_secs),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            broker.clone(),
            registry.clone(),
            clock.clone(),
            Duration::seconds(config.orphan_timeout_secs),
        ));

        let bindings = Arc::new(ConfigLoader::load(&config.bindings_path)?);
        let secret = config
            .webhook_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("webhook secret not configured (set DEPLOYBOT_WEBHOOK_SECRET)"))?;
        let translator = Arc::new(WebhookTranslator::new(
            secret,
            bindings.clone(),
            queue.clone(),
            clock.clone(),
        ));

        let state = Self {
            config: Arc::new(config),
            clock,
            store,
            queue,
            registry,
            broker,
            dispatcher,
            bindings,
            translator,
        };

        // Background sweeps need a runtime; skipped in sync unit tests.
        if tokio::runtime::Handle::try_current().is_ok() {
            state.spawn_background_tasks();
        }

        Ok(state)
    }

    /// Liveness/orphan sweep loop plus the bindings-file mtime watcher.
    /// Both log and retry forever.
    fn spawn_background_tasks(&self) {
        let registry = self.registry.clone();
        let dispatcher = self.dispatcher.clone();
        let interval = std::time::Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(e) = registry.sweep() {
                    error!(error = %e, "liveness sweep failed");
                }
                match dispatcher.reclaim_orphans() {
                    Ok(reclaimed) if !reclaimed.is_empty() => {
                        info!(count = reclaimed.len(), "orphaned jobs requeued");
                    }
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "orphan reclaim failed"),
                }
            }
        });

        let bindings = self.bindings.clone();
        tokio::spawn(async move {
            let path = bindings.path().to_path_buf();
            let mut last_mtime = None::<std::time::SystemTime>;
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(800)).await;
                if let Ok(meta) = tokio::fs::metadata(&path).await {
                    if let Ok(mtime) = meta.modified() {
                        if last_mtime != Some(mtime) {
                            let initial = last_mtime.is_none();
                            last_mtime = Some(mtime);
                            if initial {
                                continue;
                            }
                            if let Err(e) = bindings.reload() {
                                error!(error = %e, "bindings reload failed");
                            }
                        }
                    }
                }
            }
        });
    }
}
