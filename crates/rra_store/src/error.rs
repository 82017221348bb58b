//! The engine's public error taxonomy (spec Section 7).
//!
//! Internal helpers return `anyhow::Result` and attach `.context(...)`
//! naming the operation and key values; only the public API boundary
//! converts into [`EngineError`]. `NotFound` is deliberately not a variant
//! here -- fetch-by-id paths represent absence as `Option::None`.

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// The store was unreachable or a statement exceeded its deadline.
    #[error("connectivity error during {operation}: {source}")]
    Connectivity {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// Initial table/view creation failed for a reason other than
    /// "already exists". Fatal at startup.
    #[error("schema initialization failed: {0}")]
    Schema(#[source] anyhow::Error),

    /// The caller passed a DS/archive not backed by this store, or an
    /// unrecognized consolidation function.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Upsert-retry observed zero affected rows twice in a row.
    #[error("row missing after upsert-retry: {0}")]
    MissingRowAfterUpsert(String),

    /// `UPDATE ... RETURNING` on the bundle allocator produced no row.
    #[error("bundle allocator stalled for bundle {bundle_id}")]
    AllocatorStall { bundle_id: i64 },

    /// Every other failure, already carrying `.context(...)` from the call
    /// site that raised it.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn contract(msg: impl Into<String>) -> Self {
        Self::ContractViolation(msg.into())
    }
}

/// Statement-level timeout distinct from a transport error, so callers can
/// tell "the store never responded" apart from "the store rejected this".
#[derive(Debug, thiserror::Error)]
#[error("statement timed out after {0:?}")]
pub struct StatementTimeout(pub std::time::Duration);
