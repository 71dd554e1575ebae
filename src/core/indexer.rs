//! The warehouse orchestrator.
//!
//! [`Dwh`] wires the pieces together: the storage backend, the optional
//! chain gateway, the monitor loop that re-subscribes to the event stream,
//! and the worker pool that applies events to the projection. A single
//! reader/writer lock serialises ingestion (write side) against the query
//! service (read side); the cancellation token propagates shutdown to the
//! poller and every worker.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::chain::{BlockchainGateway, Event, EventData};
use crate::config::DwhConfig;
use crate::storage::Storage;
use crate::types::{MAX_BENCHMARK_VALUE, NUM_MAX_BENCHMARKS};
use crate::utils::error::{is_constraint_violation, DwhError, Result};
use crate::utils::logging;

pub struct Dwh {
    pub(crate) cfg: DwhConfig,
    pub(crate) storage: Storage,
    pub(crate) chain: Option<Arc<dyn BlockchainGateway>>,
    pub(crate) lock: RwLock<()>,
    cancel: CancellationToken,
}

impl Dwh {
    /// Connects the storage backend, bootstraps the schema, and prepares the
    /// ingestion pipeline.
    ///
    /// When `chain` is present the market's benchmark count is read from it
    /// and validated; without a gateway the service runs in query-only mode
    /// with the configured fallback count.
    ///
    /// # Errors
    ///
    /// Returns `DwhError::Config` for an invalid benchmark count or driver,
    /// and `DwhError::Database` when the backend is unreachable.
    pub async fn new(cfg: DwhConfig, chain: Option<Arc<dyn BlockchainGateway>>) -> Result<Self> {
        let num_benchmarks = match &chain {
            Some(gateway) => {
                let n = gateway.num_benchmarks().await? as usize;
                if n >= NUM_MAX_BENCHMARKS {
                    return Err(DwhError::Config(format!(
                        "market reports {n} benchmarks, maximum is {NUM_MAX_BENCHMARKS}"
                    )));
                }
                n
            }
            None => cfg.num_benchmarks,
        };

        let storage = Storage::connect(
            &cfg.storage.driver,
            &cfg.storage.endpoint,
            cfg.storage.max_connections,
            num_benchmarks,
        )
        .await?;
        storage.initialize().await?;

        Ok(Self {
            cfg,
            storage,
            chain,
            lock: RwLock::new(()),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[must_use]
    pub fn num_benchmarks(&self) -> usize {
        self.storage.num_benchmarks()
    }

    pub(crate) fn chain(&self) -> Result<&Arc<dyn BlockchainGateway>> {
        self.chain
            .as_ref()
            .ok_or_else(|| DwhError::Config("no blockchain gateway configured".to_string()))
    }

    /// Runs the service until [`stop`](Self::stop) is called. With a chain
    /// gateway this drives the monitor loop; in query-only mode it simply
    /// parks until shutdown.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        logging::log_startup(
            &self.cfg.storage.driver,
            &self.cfg.storage.endpoint,
            self.cfg.num_workers,
            self.num_benchmarks(),
        );

        if self.chain.is_some() && self.cfg.blockchain.is_some() {
            self.clone().monitor_chain().await;
        } else if self.chain.is_some() {
            // A gateway without a blockchain config section still serves
            // benchmark metadata but does not ingest.
            tracing::info!("monitoring disabled by configuration");
            self.cancel.cancelled().await;
        } else {
            tracing::info!("monitoring disabled (query-only mode)");
            self.cancel.cancelled().await;
        }

        Ok(())
    }

    /// Signals shutdown and closes the connection pool. In-flight
    /// transactions commit or roll back naturally before workers observe the
    /// token.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.storage.close().await;
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The monitor loop: (re)subscribes to the event stream and restarts it
    /// on transient failures until shutdown.
    async fn monitor_chain(self: Arc<Self>) {
        tracing::info!("starting chain monitoring");

        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("context cancelled (monitor)");
                return;
            }
            if let Err(e) = self.clone().watch_market_events().await {
                tracing::warn!(error = %e, "failed to watch market events, retrying");
            }
        }
    }

    /// Runs one poll cycle: resumes from the persisted cursor and drains the
    /// event stream through the worker pool.
    async fn watch_market_events(self: Arc<Self>) -> Result<()> {
        let last_known_block = {
            let mut conn = self.storage.pool().acquire().await?;
            match self.storage.last_known_block(&mut conn).await? {
                Some(block) => block,
                None => {
                    self.storage.insert_last_known_block(&mut conn, 0).await?;
                    0
                }
            }
        };

        tracing::info!(block_number = last_known_block, "starting from block");

        let events = self.chain()?.get_events(last_known_block).await?;
        let events = Arc::new(Mutex::new(events));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.cfg.num_workers {
            let dwh = Arc::clone(&self);
            let events = Arc::clone(&events);
            workers.spawn(async move { dwh.run_event_worker(worker_id, events).await });
        }
        while workers.join_next().await.is_some() {}

        Ok(())
    }

    async fn run_event_worker(
        self: Arc<Self>,
        worker_id: usize,
        events: Arc<Mutex<mpsc::Receiver<Event>>>,
    ) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!(worker_id, "context cancelled (worker)");
                    return;
                }
                received = async { events.lock().await.recv().await } => match received {
                    Some(event) => event,
                    None => {
                        tracing::debug!(worker_id, "events channel closed");
                        return;
                    }
                },
            };

            if let Err(e) = self.update_cursor(&event).await {
                tracing::warn!(
                    error = %e,
                    block_number = event.block_number,
                    worker_id,
                    "failed to update last known block"
                );
            }

            // Events in the same block can arrive in arbitrary order. When
            // two of them must apply in a specific order (OrderPlaced before
            // DealOpened), the failing one is retried after a delay; by then
            // the sibling has usually landed.
            if let Err(e) = self.process_event(&event).await {
                if is_constraint_violation(&e) {
                    tracing::warn!(
                        error = %e,
                        event_type = event.data.kind(),
                        block_number = event.block_number,
                        worker_id,
                        "dropping duplicate event"
                    );
                    continue;
                }
                tracing::warn!(
                    error = %e,
                    event_type = event.data.kind(),
                    block_number = event.block_number,
                    worker_id,
                    "failed to process event, retrying"
                );
                self.retry_event(&event).await;
            } else {
                tracing::debug!(
                    event_type = event.data.kind(),
                    block_number = event.block_number,
                    worker_id,
                    "processed event"
                );
            }
        }
    }

    /// Advances the best-effort ingestion cursor. With cold start configured
    /// the cursor freezes past the backfill boundary so an interrupted bulk
    /// load resumes from where it began.
    async fn update_cursor(&self, event: &Event) -> Result<()> {
        if let Some(cold_start) = &self.cfg.cold_start {
            if event.block_number > cold_start.up_to_block {
                return Ok(());
            }
        }

        let _guard = self.lock.write().await;
        let mut conn = self.storage.pool().acquire().await?;
        self.storage
            .update_last_known_block(&mut conn, event.block_number)
            .await
    }

    /// Dispatches one event to its projection handler.
    pub async fn process_event(&self, event: &Event) -> Result<()> {
        match &event.data {
            EventData::DealOpened { id } => self.on_deal_opened(id).await,
            EventData::DealUpdated { id } => self.on_deal_updated(id).await,
            EventData::OrderPlaced { id } => self.on_order_placed(event.ts, id).await,
            EventData::OrderUpdated { id } => self.on_order_updated(id).await,
            EventData::DealChangeRequestSent { id } => {
                self.on_deal_change_request_sent(event.ts, id).await
            }
            EventData::DealChangeRequestUpdated { id } => {
                self.on_deal_change_request_updated(event.ts, id).await
            }
            EventData::Billed {
                deal_id,
                paid_amount,
            } => self.on_billed(event.ts, deal_id, paid_amount).await,
            EventData::WorkerAnnounced {
                master_id,
                slave_id,
            } => self.on_worker_announced(*master_id, *slave_id).await,
            EventData::WorkerConfirmed {
                master_id,
                slave_id,
            } => self.on_worker_confirmed(*master_id, *slave_id).await,
            EventData::WorkerRemoved {
                master_id,
                slave_id,
            } => self.on_worker_removed(*master_id, *slave_id).await,
            EventData::AddedToBlacklist { adder_id, addee_id } => {
                self.on_added_to_blacklist(*adder_id, *addee_id).await
            }
            EventData::RemovedFromBlacklist {
                remover_id,
                removee_id,
            } => {
                self.on_removed_from_blacklist(*remover_id, *removee_id)
                    .await
            }
            EventData::ValidatorCreated { id } => self.on_validator_created(*id).await,
            EventData::ValidatorDeleted { id } => self.on_validator_deleted(*id).await,
            EventData::CertificateCreated { id } => self.on_certificate_created(id).await,
            EventData::Error { err, topic } => {
                tracing::warn!(error = %err, topic = %topic, "received error from events channel");
                Ok(())
            }
        }
    }

    /// Waits out the retry delay (or shutdown) and replays the event once.
    /// A second failure is logged and the event dropped.
    async fn retry_event(&self, event: &Event) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                tracing::info!(
                    block_number = event.block_number,
                    event_type = event.data.kind(),
                    "context cancelled while retrying event"
                );
            }
            _ = tokio::time::sleep(self.cfg.event_retry()) => {
                if let Err(e) = self.process_event(event).await {
                    tracing::warn!(
                        error = %e,
                        block_number = event.block_number,
                        event_type = event.data.kind(),
                        "failed to retry event"
                    );
                }
            }
        }
    }

    /// Rejects benchmark vectors that do not match the market's declared
    /// shape.
    pub(crate) fn check_benchmarks(&self, benchmarks: &[u64]) -> Result<()> {
        if benchmarks.len() != self.num_benchmarks() {
            return Err(DwhError::BenchmarkMismatch(format!(
                "expected {} benchmarks, got {}",
                self.num_benchmarks(),
                benchmarks.len()
            )));
        }
        for (idx, value) in benchmarks.iter().enumerate() {
            if *value > MAX_BENCHMARK_VALUE {
                return Err(DwhError::BenchmarkMismatch(format!(
                    "benchmark {idx} value {value} exceeds {MAX_BENCHMARK_VALUE}"
                )));
            }
        }
        Ok(())
    }
}
