//! Vertical flush of slot values and latest timestamps (spec 4.5, 4.6).
//!
//! Grounded in the persistence crate's chunked batch-insert pattern (it
//! batches document/index writes into `CHUNK_SIZE`-wide `INSERT`
//! statements); here the chunking unit is a contiguous run of archive
//! indices within one wide row rather than a fixed-size batch of rows, and
//! the retry-on-zero-rows path stands in for that crate's single-writer
//! `Lease`-guarded write -- deliberately without a lease, per the
//! concurrency model in `upsert.rs`.

use std::collections::BTreeMap;

use anyhow::Context;

use crate::{
    connection::EngineConnection,
    error::EngineError,
    metrics,
    sql,
    upsert::chunk,
};

/// Applies batched `dp`/`ver` updates to one wide row, retrying once via
/// insert-on-conflict if the row does not yet exist (spec 4.5).
///
/// Returns the number of statements executed, so callers can still update
/// telemetry even when this returns an error (spec Section 7): the engine
/// error carries the count as the `MissingRowAfterUpsert` message field, the
/// happy path returns it directly.
pub async fn flush_dps(
    conn: &EngineConnection<'_>,
    schema: &str,
    bundle_id: i64,
    seg: i32,
    i: i32,
    dp: &BTreeMap<i32, f64>,
    ver: &BTreeMap<i32, i16>,
) -> anyhow::Result<u64> {
    if dp.is_empty() && ver.is_empty() {
        return Ok(0);
    }
    let idx_keys: BTreeMap<i32, ()> = dp.keys().chain(ver.keys()).map(|&k| (k, ())).collect();
    let chunks = chunk(&idx_keys);

    let mut statements = 0u64;
    let update_sql = if chunks.len() <= 1 {
        sql::qualify(sql::UPDATE_WIDE_ROW_SINGLE_CHUNK, schema)
    } else {
        synthesize_multi_chunk_update(schema, &chunks, dp, ver)
    };

    let affected = execute_wide_row_update(conn, &update_sql, bundle_id, seg, i, &chunks, dp, ver).await?;
    statements += 1;

    if affected == 0 {
        metrics::log_upsert_retry();
        let insert_sql = sql::qualify(sql::INSERT_WIDE_ROW, schema);
        conn.execute(
            &conn.prepare_cached(&insert_sql).await?,
            &[&bundle_id, &seg, &i],
        )
        .await
        .with_context(|| format!("inserting wide row ({bundle_id}, {seg}, {i})"))?;
        statements += 1;

        let affected = execute_wide_row_update(conn, &update_sql, bundle_id, seg, i, &chunks, dp, ver).await?;
        statements += 1;
        if affected == 0 {
            return Err(EngineError::MissingRowAfterUpsert(format!(
                "wide row ({bundle_id}, {seg}, {i}) missing after insert-on-conflict retry"
            ))
            .into());
        }
    }

    metrics::log_flush_statements("dps", statements);
    Ok(statements)
}

async fn execute_wide_row_update(
    conn: &EngineConnection<'_>,
    update_sql: &str,
    bundle_id: i64,
    seg: i32,
    i: i32,
    chunks: &[crate::upsert::Chunk<()>],
    dp: &BTreeMap<i32, f64>,
    ver: &BTreeMap<i32, i16>,
) -> anyhow::Result<u64> {
    if chunks.len() <= 1 {
        let c = &chunks[0];
        let dp_values: Vec<Option<f64>> = (c.lo..=c.hi).map(|idx| dp.get(&idx).copied()).collect();
        let ver_values: Vec<Option<i16>> = (c.lo..=c.hi).map(|idx| ver.get(&idx).copied()).collect();
        let stmt = conn.prepare_cached(update_sql).await?;
        conn.execute(
            &stmt,
            &[
                &bundle_id,
                &seg,
                &i,
                &(c.lo + 1),
                &(c.hi + 1),
                &dp_values,
                &(c.lo + 1),
                &(c.hi + 1),
                &ver_values,
            ],
        )
        .await
        .with_context(|| format!("updating wide row ({bundle_id}, {seg}, {i})"))
    } else {
        let owned: Vec<Box<dyn tokio_postgres::types::ToSql + Sync>> = chunks
            .iter()
            .map(|c| -> Box<dyn tokio_postgres::types::ToSql + Sync> {
                Box::new((c.lo..=c.hi).map(|idx| dp.get(&idx).copied()).collect::<Vec<Option<f64>>>())
            })
            .chain(chunks.iter().map(|c| -> Box<dyn tokio_postgres::types::ToSql + Sync> {
                Box::new((c.lo..=c.hi).map(|idx| ver.get(&idx).copied()).collect::<Vec<Option<i16>>>())
            }))
            .collect();
        let mut params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = vec![&bundle_id, &seg, &i];
        params.extend(owned.iter().map(|v| v.as_ref()));

        // Not preparable: the number of slice assignments varies with the
        // chunk count (spec 4.5), so this is sent as a one-off statement.
        conn.execute_unprepared(update_sql, &params)
            .await
            .with_context(|| format!("updating wide row ({bundle_id}, {seg}, {i})"))
    }
}

/// Synthesizes the `>= 2` chunk update: `dp[lo1:hi1]=.., dp[lo2:hi2]=..,
/// ver[lo1:hi1]=..` in one `SET` clause with sequential placeholders (spec
/// 4.5). Not preparable because the number of slice assignments varies.
fn synthesize_multi_chunk_update(
    schema: &str,
    chunks: &[crate::upsert::Chunk<()>],
    _dp: &BTreeMap<i32, f64>,
    _ver: &BTreeMap<i32, i16>,
) -> String {
    let mut set_clauses = Vec::new();
    let mut placeholder = 4;
    for c in chunks {
        set_clauses.push(format!("dp[{}:{}] = ${}", c.lo + 1, c.hi + 1, placeholder));
        placeholder += 1;
    }
    for c in chunks {
        set_clauses.push(format!("ver[{}:{}] = ${}", c.lo + 1, c.hi + 1, placeholder));
        placeholder += 1;
    }
    sql::qualify(
        &format!(
            "UPDATE @.ts SET {} WHERE bundle_id = $1 AND seg = $2 AND i = $3",
            set_clauses.join(", ")
        ),
        schema,
    )
}

/// Flushes the `latest[idx]` array for one segment (spec 4.6). Always a
/// single contiguous slice since the input is one archive's new timestamp;
/// upsert-retry is identical to `flush_dps`.
pub async fn flush_latests(
    conn: &EngineConnection<'_>,
    schema: &str,
    bundle_id: i64,
    seg: i32,
    latest: &BTreeMap<i32, i64>,
) -> anyhow::Result<u64> {
    if latest.is_empty() {
        return Ok(0);
    }
    let chunks = chunk(latest);
    let mut statements = 0u64;

    let update_sql = sql::qualify(sql::UPDATE_LATEST_ROW, schema);
    let mut affected = 0;
    for c in &chunks {
        let stmt = conn.prepare_cached(&update_sql).await?;
        affected += conn
            .execute(&stmt, &[&bundle_id, &seg, &(c.lo + 1), &(c.hi + 1), &c.values])
            .await
            .with_context(|| format!("updating latest row ({bundle_id}, {seg})"))?;
        statements += 1;
    }

    if affected == 0 {
        metrics::log_upsert_retry();
        let insert_sql = sql::qualify(sql::INSERT_LATEST_ROW, schema);
        conn.execute(&conn.prepare_cached(&insert_sql).await?, &[&bundle_id, &seg])
            .await
            .with_context(|| format!("inserting latest row ({bundle_id}, {seg})"))?;
        statements += 1;

        let mut retry_affected = 0;
        for c in &chunks {
            let stmt = conn.prepare_cached(&update_sql).await?;
            retry_affected += conn
                .execute(&stmt, &[&bundle_id, &seg, &(c.lo + 1), &(c.hi + 1), &c.values])
                .await
                .with_context(|| format!("updating latest row ({bundle_id}, {seg})"))?;
            statements += 1;
        }
        if retry_affected == 0 {
            return Err(EngineError::MissingRowAfterUpsert(format!(
                "latest row ({bundle_id}, {seg}) missing after insert-on-conflict retry"
            ))
            .into());
        }
    }

    metrics::log_flush_statements("latests", statements);
    Ok(statements)
}
