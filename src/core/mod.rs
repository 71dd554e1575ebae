pub mod handlers;
pub mod indexer;
pub mod queries;

pub use indexer::Dwh;
