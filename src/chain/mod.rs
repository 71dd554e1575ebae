//! Interfaces to the blockchain: the event stream the poller produces and
//! the canonical-state lookups the projection handlers perform.
//!
//! The concrete client is supplied by the embedding application; the
//! warehouse only depends on the [`BlockchainGateway`] trait. Tests drive
//! the pipeline with an in-memory implementation.

use async_trait::async_trait;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::types::{Address, Certificate, Deal, DealChangeRequest, Order, Validator};
use crate::utils::error::Result;

/// One log entry from the Market or ProfileRegistry contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub block_number: u64,
    /// Block timestamp in seconds.
    pub ts: u64,
    pub data: EventData,
}

/// The event payload, one variant per contract topic.
///
/// Handlers receive only entity identifiers here; the canonical entity state
/// is always re-fetched from the chain, which makes redelivery idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventData {
    DealOpened { id: BigUint },
    DealUpdated { id: BigUint },
    OrderPlaced { id: BigUint },
    OrderUpdated { id: BigUint },
    DealChangeRequestSent { id: BigUint },
    DealChangeRequestUpdated { id: BigUint },
    Billed { deal_id: BigUint, paid_amount: BigUint },
    WorkerAnnounced { master_id: Address, slave_id: Address },
    WorkerConfirmed { master_id: Address, slave_id: Address },
    WorkerRemoved { master_id: Address, slave_id: Address },
    AddedToBlacklist { adder_id: Address, addee_id: Address },
    RemovedFromBlacklist { remover_id: Address, removee_id: Address },
    ValidatorCreated { id: Address },
    ValidatorDeleted { id: Address },
    CertificateCreated { id: BigUint },
    /// A decode failure reported by the event source; logged, no state change.
    Error { err: String, topic: String },
}

impl EventData {
    /// Short variant name for log lines.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DealOpened { .. } => "DealOpened",
            Self::DealUpdated { .. } => "DealUpdated",
            Self::OrderPlaced { .. } => "OrderPlaced",
            Self::OrderUpdated { .. } => "OrderUpdated",
            Self::DealChangeRequestSent { .. } => "DealChangeRequestSent",
            Self::DealChangeRequestUpdated { .. } => "DealChangeRequestUpdated",
            Self::Billed { .. } => "Billed",
            Self::WorkerAnnounced { .. } => "WorkerAnnounced",
            Self::WorkerConfirmed { .. } => "WorkerConfirmed",
            Self::WorkerRemoved { .. } => "WorkerRemoved",
            Self::AddedToBlacklist { .. } => "AddedToBlacklist",
            Self::RemovedFromBlacklist { .. } => "RemovedFromBlacklist",
            Self::ValidatorCreated { .. } => "ValidatorCreated",
            Self::ValidatorDeleted { .. } => "ValidatorDeleted",
            Self::CertificateCreated { .. } => "CertificateCreated",
            Self::Error { .. } => "Error",
        }
    }
}

/// Chain access used by the warehouse: canonical-state lookups for the
/// projection handlers plus the event stream for the poller.
///
/// Every method may suspend indefinitely on network IO and must be
/// cancellation-safe; the worker pool wraps calls in `select!` against the
/// shutdown token where it matters.
#[async_trait]
pub trait BlockchainGateway: Send + Sync {
    /// Number of benchmark values every order and deal carries. Read once at
    /// startup; the projection schema is shaped by it.
    async fn num_benchmarks(&self) -> Result<u64>;

    async fn deal_info(&self, id: &BigUint) -> Result<Deal>;

    async fn order_info(&self, id: &BigUint) -> Result<Order>;

    async fn change_request_info(&self, id: &BigUint) -> Result<DealChangeRequest>;

    async fn validator(&self, id: Address) -> Result<Validator>;

    async fn certificate(&self, id: &BigUint) -> Result<Certificate>;

    /// Starts streaming events from `from_block`. The returned channel ends
    /// when the poll is exhausted; the monitor loop then re-subscribes from
    /// the persisted cursor.
    async fn get_events(&self, from_block: u64) -> Result<mpsc::Receiver<Event>>;
}
