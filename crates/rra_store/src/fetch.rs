//! Fetch pipeline (spec 4.8): clamps the requested range to what the
//! archive retains, computes the bucket width, and issues a time-bucketed
//! aggregation query against the versioned view.
//!
//! Archive selection ("best-fit for this range and point budget") is an
//! external collaborator per spec Section 1; this module takes the chosen
//! archive as an argument rather than picking one itself.

use anyhow::Context;

use crate::{
    catalog::Archive,
    connection::EngineConnection,
    error::EngineError,
    sql,
};

/// One bucketed sample: `bucket_end` is the upper edge of the averaging
/// window, `value` is `None` if no live sample fell in it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub bucket_end_ms: i64,
    pub value: Option<f64>,
}

/// `FetchSeries(ds, from, to, maxPoints)` against an already-selected
/// archive (spec 4.8).
pub async fn fetch_series(
    conn: &EngineConnection<'_>,
    schema: &str,
    archive: &Archive,
    ds_last_update: Option<i64>,
    from_ms: i64,
    to_ms: i64,
    max_points: i64,
) -> anyhow::Result<Vec<Sample>> {
    if max_points <= 0 {
        return Err(EngineError::contract(format!("max_points must be positive, got {max_points}")).into());
    }
    let earliest = archive
        .earliest_retained_ms()
        .ok_or_else(|| EngineError::contract(format!("archive {} has never been written", archive.id)))?;
    let from_ms = from_ms.max(earliest);
    let to_ms = match ds_last_update {
        Some(last) => to_ms.min(last),
        None => to_ms,
    };
    if from_ms > to_ms {
        return Ok(Vec::new());
    }

    let bucket_ms = archive.step_ms.max((to_ms - from_ms).max(1) / max_points.max(1));

    let query = sql::qualify(sql::FETCH_SERIES_BUCKETED, schema);
    let stmt = conn.prepare_cached(&query).await?;
    let rows = conn
        .query(&stmt, &[&archive.ds_id, &archive.id, &bucket_ms, &from_ms, &to_ms, &archive.step_ms])
        .await
        .with_context(|| format!("fetching series for archive {}", archive.id))?;
    Ok(rows
        .into_iter()
        .map(|row| Sample {
            bucket_end_ms: row.get("bucket_end"),
            value: row.get("value"),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive_fixture(latest: Option<i64>) -> Archive {
        Archive {
            id: 1,
            ds_id: 1,
            bundle_id: 1,
            cf: crate::catalog::ConsolidationFn::WMean,
            pos: 0,
            seg: 0,
            idx: 0,
            xff: 0.5,
            value: None,
            duration_ms: None,
            step_ms: 1000,
            size: 10,
            latest,
        }
    }

    #[test]
    fn earliest_retained_matches_spec_formula() {
        let archive = archive_fixture(Some(11_000));
        // latest - step*(size-1) = 11000 - 1000*9 = 2000
        assert_eq!(archive.earliest_retained_ms(), Some(2000));
    }

    #[test]
    fn bucket_width_is_at_least_step() {
        let step_ms = 1000i64;
        let to_ms = 1_000_000i64;
        let from_ms = 0i64;
        let max_points = 10_000_000i64;
        let bucket_ms = step_ms.max((to_ms - from_ms).max(1) / max_points.max(1));
        assert_eq!(bucket_ms, step_ms);
    }
}
