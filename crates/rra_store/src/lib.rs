//! Vertical round-robin archive (RRA) storage engine: persists many
//! independent time-series data sources, each with several round-robin
//! aggregations, into wide physical rows where one row holds one time slot
//! across many series, rather than one row per sample.
//!
//! [`engine::Engine`] is the entry point: [`engine::Engine::init_db`]
//! connects and idempotently creates the schema, after which
//! [`engine::Engine::fetch_or_create_data_source`],
//! [`engine::Engine::flush_dps`], and [`engine::Engine::fetch_series`] cover
//! the write and read paths.

pub mod addressing;
pub mod allocator;
pub mod catalog;
pub mod connection;
pub mod engine;
pub mod env;
pub mod error;
pub mod fetch;
pub mod flush;
pub mod metrics;
pub mod sql;
pub mod upsert;
pub mod view;

#[cfg(test)]
mod tests;

pub use catalog::{
    Archive,
    ArchiveSpec,
    ConsolidationFn,
    DataSource,
    DsSpec,
};
pub use engine::{
    Engine,
    EngineOptions,
};
pub use error::EngineError;
pub use fetch::Sample;
pub use view::Point;
