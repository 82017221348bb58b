//! Chunking of sparse slot updates (spec 4.5) and the `FetchOrCreate`
//! lifecycle protocol (spec 4.3).
//!
//! The chunking function is pure and exhaustively proptested (invariant 6).
//! The lifecycle protocol deliberately does **not** take a process-wide
//! write lease the way the persistence crate's `Lease` does around
//! `PostgresPersistence::write` -- this engine's concurrency model (spec
//! Section 5) is "many parallel workers, no in-process locks, only the
//! store's row-level locks serialize writes", so every upsert here is
//! written to be safe under concurrent callers on its own `ON CONFLICT`
//! clause instead of relying on mutual exclusion.

use std::collections::BTreeMap;

use anyhow::Context;

use crate::{
    catalog::{
        ArchiveSpec,
        Bundle,
        DsSpec,
    },
    connection::EngineConnection,
    sql,
};

/// One maximal run of consecutive indices, with its dense payload in
/// ascending-index order.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk<V> {
    pub lo: i32,
    pub hi: i32,
    pub values: Vec<V>,
}

/// Groups a sparse `idx -> value` map into maximal runs of consecutive
/// indices (spec 4.5 "Chunking", invariant 6).
///
/// The union of the returned chunks' ranges equals the key set, chunks are
/// maximal (no two returned chunks are adjacent or overlapping), and each
/// chunk's dense payload matches the input in ascending-index order.
pub fn chunk<V: Clone>(sparse: &BTreeMap<i32, V>) -> Vec<Chunk<V>> {
    let mut chunks = Vec::new();
    let mut iter = sparse.iter().peekable();
    while let Some((&lo, first_value)) = iter.next() {
        let mut hi = lo;
        let mut values = vec![first_value.clone()];
        while let Some(&(&next_idx, next_value)) = iter.peek() {
            if next_idx == hi + 1 {
                hi = next_idx;
                values.push(next_value.clone());
                iter.next();
            } else {
                break;
            }
        }
        chunks.push(Chunk { lo, hi, values });
    }
    chunks
}

/// Result of `FetchOrCreateDataSource` (spec 4.3): the row as persisted,
/// plus whether this call observed (not necessarily caused) its creation.
pub struct UpsertedDs {
    pub id: i64,
    pub created: bool,
    pub step_ms: i64,
    pub heartbeat_ms: i64,
}

/// Step 2 of `FetchOrCreate` (spec 4.3): insert-or-touch the `ds` row.
///
/// Uses `ON CONFLICT (ident) DO UPDATE SET created = false` so a fresh
/// insert (which relies on the column default `created = true`, spec
/// Section 9) and a conflict are distinguishable from the single
/// `RETURNING` row, with no separate read-then-write round trip.
pub(crate) async fn upsert_ds(
    conn: &EngineConnection<'_>,
    schema: &str,
    ident: &serde_json::Value,
    spec: &DsSpec,
) -> anyhow::Result<UpsertedDs> {
    let query = sql::qualify(sql::UPSERT_DS, schema);
    let row = conn
        .query_opt(&query, &[ident, &spec.step_ms, &spec.heartbeat_ms])
        .await
        .context("upserting data source")?
        .context("ds upsert returned no row")?;
    Ok(UpsertedDs {
        id: row.get("id"),
        created: row.get("created"),
        step_ms: row.get("step_ms"),
        heartbeat_ms: row.get("heartbeat_ms"),
    })
}

/// Fetch-or-create a bundle by `(step_ms, size)` (spec 4.3 step 3).
///
/// The `ON CONFLICT` branch self-assigns `step_ms` purely to force
/// `RETURNING` to fire, matching the archive upsert's convention (spec
/// 4.3): a compliant caller only ever wants the row back, never a
/// differently-valued update.
pub(crate) async fn fetch_or_create_bundle(
    conn: &EngineConnection<'_>,
    schema: &str,
    step_ms: i64,
    size: i32,
    width: i32,
) -> anyhow::Result<Bundle> {
    let query = sql::qualify(sql::UPSERT_BUNDLE, schema);
    let row = conn
        .query_opt(&query, &[&step_ms, &size, &width])
        .await
        .context("upserting bundle")?
        .context("bundle upsert returned no row")?;
    Bundle::try_from(&row)
}

/// Fetch-or-create one archive (spec 4.3 step 3): allocate a bundle
/// position, then insert with `ON CONFLICT (ds_id, bundle_id, cf) DO
/// UPDATE SET ds_id = ds_id` so the pre-existing row's columns come back on
/// conflict without ambiguity about which archive spec "won".
pub(crate) async fn fetch_or_create_archive(
    conn: &EngineConnection<'_>,
    schema: &str,
    ds_id: i64,
    bundle_id: i64,
    pos: i64,
    seg: i32,
    idx: i32,
    archive_spec: &ArchiveSpec,
) -> anyhow::Result<tokio_postgres::Row> {
    let query = sql::qualify(sql::UPSERT_ARCHIVE, schema);
    conn.query_opt(
        &query,
        &[
            &ds_id,
            &bundle_id,
            &archive_spec.cf.to_string(),
            &pos,
            &seg,
            &idx,
            &archive_spec.xff,
            &archive_spec.duration_ms,
        ],
    )
    .await
    .context("upserting archive")?
    .context("archive upsert returned no row")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn sparse_map() -> impl Strategy<Value = BTreeMap<i32, f64>> {
        prop::collection::btree_map(0i32..500, -1e6f64..1e6, 0..60)
    }

    proptest! {
        /// Chunking correctness (spec invariant 6): union of ranges equals
        /// the key set, chunks are maximal, payloads match input order.
        #[test]
        fn chunking_covers_keys_exactly(sparse in sparse_map()) {
            let chunks = chunk(&sparse);

            let mut covered: Vec<i32> = chunks.iter().flat_map(|c| c.lo..=c.hi).collect();
            let mut keys: Vec<i32> = sparse.keys().copied().collect();
            covered.sort_unstable();
            keys.sort_unstable();
            prop_assert_eq!(covered, keys);

            for window in chunks.windows(2) {
                prop_assert!(window[1].lo > window[0].hi + 1, "chunks must not be adjacent or overlapping");
            }

            for c in &chunks {
                let expected: Vec<f64> = (c.lo..=c.hi).map(|i| sparse[&i]).collect();
                prop_assert_eq!(&c.values, &expected);
            }
        }

        #[test]
        fn chunking_is_idempotent_on_dense_ranges(lo in 0i32..200, len in 1i32..100) {
            let sparse: BTreeMap<i32, f64> = (lo..lo + len).map(|i| (i, i as f64)).collect();
            let chunks = chunk(&sparse);
            prop_assert_eq!(chunks.len(), 1);
            prop_assert_eq!(chunks[0].lo, lo);
            prop_assert_eq!(chunks[0].hi, lo + len - 1);
        }
    }

    #[test]
    fn s4_multi_chunk_flush_shape() {
        let sparse = BTreeMap::from([(0, 'a'), (1, 'b'), (5, 'c'), (6, 'd')]);
        let chunks = chunk(&sparse);
        assert_eq!(
            chunks,
            vec![
                Chunk { lo: 0, hi: 1, values: vec!['a', 'b'] },
                Chunk { lo: 5, hi: 6, values: vec!['c', 'd'] },
            ]
        );
    }
}
