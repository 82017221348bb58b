//! Persistent catalog types: data sources, bundles, and archives (spec
//! Section 3 / 4.3 / 4.4).
//!
//! Grounded in the persistence crate's row-mapping style in `lib.rs` (a
//! `TryFrom<&Row>` per table, fallible field extraction via `row.try_get`)
//! but against this engine's own schema rather than documents/indexes.

use std::fmt;

use anyhow::Context;
use serde::{
    Deserialize,
    Serialize,
};
use tokio_postgres::Row;

use crate::{
    connection::EngineConnection,
    error::EngineError,
    sql,
};

/// Consolidation function tag for an archive (spec GLOSSARY: CF). Stored as
/// text; the raw-sample-to-slot consolidation math itself is an external
/// collaborator, out of scope here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsolidationFn {
    WMean,
    Min,
    Max,
    Last,
}

impl fmt::Display for ConsolidationFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WMean => "WMEAN",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::Last => "LAST",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ConsolidationFn {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WMEAN" => Ok(Self::WMean),
            "MIN" => Ok(Self::Min),
            "MAX" => Ok(Self::Max),
            "LAST" => Ok(Self::Last),
            other => Err(EngineError::contract(format!(
                "unrecognized consolidation function {other:?}"
            ))),
        }
    }
}

/// A group of archives sharing `(step_ms, size)` and packed `width`-wide.
#[derive(Debug, Clone, PartialEq)]
pub struct Bundle {
    pub id: i64,
    pub step_ms: i64,
    pub size: i32,
    pub width: i32,
    pub last_pos: i64,
}

impl TryFrom<&Row> for Bundle {
    type Error = anyhow::Error;

    fn try_from(row: &Row) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.try_get("id").context("bundle.id")?,
            step_ms: row.try_get("step_ms").context("bundle.step_ms")?,
            size: row.try_get("size").context("bundle.size")?,
            width: row.try_get("width").context("bundle.width")?,
            last_pos: row.try_get("last_pos").context("bundle.last_pos")?,
        })
    }
}

/// One round-robin archive, with the bundle geometry it was loaded with
/// denormalized alongside it for addressing (spec 4.1, 4.4).
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub id: i64,
    pub ds_id: i64,
    pub bundle_id: i64,
    pub cf: ConsolidationFn,
    pub pos: i64,
    pub seg: i32,
    pub idx: i32,
    pub xff: f64,
    pub value: Option<f64>,
    pub duration_ms: Option<i64>,
    pub step_ms: i64,
    pub size: i32,
    pub latest: Option<i64>,
}

impl Archive {
    /// Span covered by this archive's ring, in milliseconds.
    pub fn span_ms(&self) -> i64 {
        self.step_ms * self.size as i64
    }

    /// The earliest timestamp still retained, given the current `latest`.
    pub fn earliest_retained_ms(&self) -> Option<i64> {
        self.latest.map(|l| l - self.step_ms * (self.size as i64 - 1))
    }
}

/// A single archive specification within a `FetchOrCreate` spec (spec 4.3).
#[derive(Debug, Clone)]
pub struct ArchiveSpec {
    pub cf: ConsolidationFn,
    pub size: i32,
    pub xff: f64,
    pub duration_ms: Option<i64>,
}

/// Optional creation spec passed to `FetchOrCreateDataSource`; absent means
/// lookup-only (spec 4.3).
#[derive(Debug, Clone)]
pub struct DsSpec {
    pub step_ms: i64,
    pub heartbeat_ms: i64,
    pub archives: Vec<ArchiveSpec>,
}

/// A data source and its attached archives.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSource {
    pub id: i64,
    pub ident: serde_json::Value,
    pub step_ms: i64,
    pub heartbeat_ms: i64,
    pub last_update: Option<i64>,
    pub value: Option<f64>,
    pub duration_ms: Option<i64>,
    pub archives: Vec<Archive>,
}

pub(crate) async fn select_ds_by_ident(
    conn: &EngineConnection<'_>,
    schema: &str,
    ident: &serde_json::Value,
) -> anyhow::Result<Option<(i64, serde_json::Value, i64, i64, Option<i64>, Option<f64>, Option<i64>)>>
{
    let query = sql::qualify(sql::SELECT_DS_BY_IDENT, schema);
    let row = conn.query_opt(&query, &[&ident.to_string()]).await?;
    Ok(row.map(|row| {
        (
            row.get("id"),
            row.get("ident"),
            row.get("step_ms"),
            row.get("heartbeat_ms"),
            row.get("lastupdate"),
            row.get("value"),
            row.get("duration_ms"),
        )
    }))
}

pub(crate) async fn load_archives_for_ds(
    conn: &EngineConnection<'_>,
    schema: &str,
    ds_id: i64,
) -> anyhow::Result<Vec<Row>> {
    let stmt = conn
        .prepare_cached(&sql::qualify(sql::LOAD_ARCHIVES_FOR_DS, schema))
        .await?;
    conn.query(&stmt, &[&ds_id]).await
}

pub(crate) fn archive_row_to_partial(
    row: &Row,
) -> anyhow::Result<(i64, i64, i64, ConsolidationFn, i64, i32, i32, f64, Option<f64>, Option<i64>)> {
    let cf: String = row.try_get("cf").context("rra.cf")?;
    Ok((
        row.try_get("id").context("rra.id")?,
        row.try_get("ds_id").context("rra.ds_id")?,
        row.try_get("bundle_id").context("rra.bundle_id")?,
        cf.parse().map_err(|e: EngineError| anyhow::anyhow!(e))?,
        row.try_get("pos").context("rra.pos")?,
        row.try_get("seg").context("rra.seg")?,
        row.try_get("idx").context("rra.idx")?,
        row.try_get("xff").context("rra.xff")?,
        row.try_get("value").context("rra.value")?,
        row.try_get("duration_ms").context("rra.duration_ms")?,
    ))
}
