//! Versioned read view (spec 4.7): queries against the `tv`/`tvd` relations
//! maintained in `sql.rs`.
//!
//! The view itself does the version filtering in SQL; this module only
//! shapes the parameters (time bounds, `ds_id`/`rra_id`) and maps rows back
//! into typed points, the same division of labor as the persistence crate's
//! `LOAD_DOCS_BY_TS_PAGE_*` helpers in `lib.rs`.

use anyhow::Context;

use crate::{
    connection::EngineConnection,
    metrics,
    sql,
};

/// One point read back from `tv`/`tvd`: `r` is `None` for a slot whose
/// stored version disagrees with the one `latest` implies (spec 4.7).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub t_ms: i64,
    pub value: Option<f64>,
}

/// Reads every live point for one archive whose timestamp falls in
/// `[from_ms, to_ms]`, ordered by time. Used directly by property tests
/// (invariant 7) and indirectly by `fetch::fetch_series`.
pub async fn read_range(
    conn: &EngineConnection<'_>,
    schema: &str,
    ds_id: i64,
    rra_id: i64,
    from_ms: i64,
    to_ms: i64,
) -> anyhow::Result<Vec<Point>> {
    let _timer = metrics::view_query_timer();
    let query = sql::qualify(
        "SELECT t, r FROM @.tv WHERE ds_id = $1 AND rra_id = $2 AND t BETWEEN $3 AND $4 ORDER BY t",
        schema,
    );
    let stmt = conn.prepare_cached(&query).await?;
    let rows = conn
        .query(&stmt, &[&ds_id, &rra_id, &from_ms, &to_ms])
        .await
        .with_context(|| format!("reading tv range for rra {rra_id}"))?;
    Ok(rows
        .into_iter()
        .map(|row| Point {
            t_ms: row.get("t"),
            value: row.get("r"),
        })
        .collect())
}

/// Debug-only counterpart of `read_range` against `tvd` (spec Section 9):
/// returns every slot regardless of version agreement, for diagnosing
/// addressing problems. Never used by the fetch pipeline.
pub async fn read_range_debug(
    conn: &EngineConnection<'_>,
    schema: &str,
    ds_id: i64,
    rra_id: i64,
    from_ms: i64,
    to_ms: i64,
) -> anyhow::Result<Vec<Point>> {
    let query = sql::qualify(
        "SELECT EXTRACT(EPOCH FROM ts)::bigint * 1000 AS t, r FROM @.tvd \
         WHERE ds_id = $1 AND rra_id = $2 AND ts BETWEEN to_timestamp($3 / 1000.0) AND to_timestamp($4 / 1000.0) \
         ORDER BY ts",
        schema,
    );
    let stmt = conn.prepare_cached(&query).await?;
    let rows = conn
        .query(&stmt, &[&ds_id, &rra_id, &from_ms, &to_ms])
        .await
        .with_context(|| format!("reading tvd range for rra {rra_id}"))?;
    Ok(rows
        .into_iter()
        .map(|row| Point {
            t_ms: row.get("t"),
            value: row.get("r"),
        })
        .collect())
}
