//! Bundle position allocator (spec 4.2).
//!
//! A single atomic `UPDATE ... RETURNING` is the only hot mutable row in the
//! engine (spec Section 5); grounded in the persistence crate's own use of
//! `RETURNING` to make a single round trip do both the mutation and the
//! read-back, rather than a read-then-write pair that would race under
//! concurrent callers.

use anyhow::Context;

use crate::{
    connection::EngineConnection,
    error::EngineError,
    metrics,
    sql,
};

/// Atomically reserves the next position within `bundle_id`.
///
/// Monotonic and may leak positions if the caller's subsequent archive
/// upsert turns out to be a no-op; leaks are accepted (spec 4.2). Uniqueness
/// of `pos` within a bundle, not density, is the only invariant.
pub async fn allocate_position(conn: &EngineConnection<'_>, schema: &str, bundle_id: i64) -> anyhow::Result<i64> {
    metrics::log_allocator_call();
    let query = sql::qualify(sql::ALLOCATE_POSITION, schema);
    let row = conn
        .query_opt(&query, &[&bundle_id])
        .await
        .with_context(|| format!("allocating position for bundle {bundle_id}"))?;
    let row = row.ok_or_else(|| EngineError::AllocatorStall { bundle_id })?;
    Ok(row.get("last_pos"))
}

#[cfg(test)]
mod tests {
    //! Allocator uniqueness (spec invariant 5) needs a live store to
    //! exercise concurrent `UPDATE ... RETURNING` calls; see
    //! `engine::itest` for the integration-gated version of this test.
}
