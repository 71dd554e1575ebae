//! `market-dwh` — a data-warehouse indexer and query service for an
//! on-chain marketplace.
//!
//! The warehouse consumes the ordered event stream emitted by the Market
//! and ProfileRegistry contracts, fetches canonical entity state from the
//! chain, and maintains a denormalised relational projection suitable for
//! rich, paginated, filterable queries over deals, orders, deal conditions,
//! billing history, profiles, blacklists, validators and workers.
//!
//! # Architecture
//!
//! Ingestion is an event-driven pipeline:
//!
//! 1. **Event source** — the chain gateway streams `Event`s from the last
//!    persisted block.
//! 2. **Worker pool** — a fixed pool drains the stream concurrently,
//!    advancing the block cursor as it goes.
//! 3. **Handlers** — one per event variant; each fetches canonical state
//!    from the chain and applies a single transactional projection update.
//! 4. **Retry policy** — constraint violations mark duplicates and are
//!    dropped; anything else is retried once after a delay, which resolves
//!    same-block ordering races.
//!
//! Queries run through a composable filter/sort DSL compiled to SQL for the
//! configured backend (SQLite or PostgreSQL), behind the shared side of the
//! ingestion lock.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use market_dwh::{Dwh, DwhConfigBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DwhConfigBuilder::new()
//!         .with_storage("sqlite3", "sqlite://dwh.db")
//!         .with_logging_level("info")
//!         .build()?;
//!
//!     // No chain gateway: query-only mode.
//!     let dwh = Arc::new(Dwh::new(config, None).await?);
//!     dwh.clone().serve().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

// Public API exports
pub use crate::chain::{BlockchainGateway, Event, EventData};
pub use crate::config::{DwhConfig, DwhConfigBuilder};
pub use crate::core::Dwh;
pub use crate::storage::Storage;
pub use crate::utils::error::{DwhError, Result};

// Module declarations
pub mod chain;
pub mod config;
pub mod core;
pub mod storage;
pub mod types;
pub mod utils;
