//! The public API surface (spec Section 6): `Engine` owns the pool and
//! schema, and every operation acquires a connection, does its work, and
//! releases it (spec Section 5 -- no in-process locks, no held leases).
//!
//! Grounded in the persistence crate's `PostgresPersistence::new`/`with_pool`
//! for schema bootstrap, but without that struct's `Lease`: this engine's
//! concurrency model has many parallel writers and relies only on the
//! store's own row-level locks and `ON CONFLICT` clauses.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use anyhow::Context;

use crate::{
    allocator,
    catalog::{
        self,
        Archive,
        ArchiveSpec,
        ConsolidationFn,
        DataSource,
        DsSpec,
    },
    connection::Pool,
    error::EngineError,
    fetch::{
        self,
        Sample,
    },
    flush,
    sql,
    upsert,
    view::{
        self,
        Point,
    },
};

/// Schema name, validated once at construction so every later call can
/// safely interpolate it into SQL text via [`sql::qualify`].
#[derive(Debug, Clone)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn new(raw: &str) -> anyhow::Result<Self> {
        if raw.is_empty()
            || !raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            anyhow::bail!("schema name {raw:?} must be a nonempty alphanumeric/underscore identifier");
        }
        Ok(Self(format!("{raw}.")))
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Clone, Default)]
pub struct EngineOptions {
    /// If `None`, uses the database's current default schema.
    pub schema: Option<String>,
}

/// A handle to one engine instance: a connection pool plus the schema it
/// operates against. Cheap to clone (the pool is reference-counted);
/// intended to be shared process-wide (spec Section 5).
#[derive(Clone)]
pub struct Engine {
    pool: Arc<Pool>,
    schema: Arc<SchemaName>,
    newly_created: Arc<AtomicBool>,
}

impl Engine {
    /// `InitDb(connect_string, prefix)` (spec Section 6): connects, creates
    /// the schema if named and absent, and idempotently creates every
    /// table and view.
    pub async fn init_db(url: &str, options: EngineOptions) -> Result<Self, EngineError> {
        let config = url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| EngineError::Schema(anyhow::anyhow!(e).context("invalid postgres connection url")))?;
        let pool = Pool::new(config);
        Self::with_pool(pool, options).await
    }

    pub async fn with_pool(pool: Arc<Pool>, options: EngineOptions) -> Result<Self, EngineError> {
        let conn = pool
            .get_connection()
            .await
            .map_err(|e| EngineError::Connectivity { operation: "init_db", source: e })?;

        let schema = if let Some(raw) = &options.schema {
            let schema = SchemaName::new(raw).map_err(EngineError::Schema)?;
            if conn
                .query_opt(sql::CHECK_SCHEMA_SQL, &[raw])
                .await
                .map_err(EngineError::Schema)?
                .is_none()
            {
                conn.batch_execute(&sql::qualify(sql::CREATE_SCHEMA_SQL, schema.as_str()))
                    .await
                    .map_err(EngineError::Schema)?;
            }
            schema
        } else {
            let row = conn
                .query_opt("SELECT current_schema()", &[])
                .await
                .map_err(EngineError::Schema)?
                .context("current_schema() returned nothing")
                .map_err(EngineError::Schema)?;
            let current: String = row.get(0);
            SchemaName::new(&current).map_err(EngineError::Schema)?
        };

        for stmt in sql::INIT_SQL {
            conn.batch_execute(&sql::qualify(stmt, schema.as_str()))
                .await
                .map_err(EngineError::Schema)?;
        }
        conn.batch_execute(&sql::qualify(sql::CREATE_TV_VIEW, schema.as_str()))
            .await
            .map_err(EngineError::Schema)?;
        conn.batch_execute(&sql::qualify(sql::CREATE_TVD_VIEW, schema.as_str()))
            .await
            .map_err(EngineError::Schema)?;

        let newly_created = conn
            .query_opt(&sql::qualify(sql::CHECK_NEWLY_CREATED, schema.as_str()), &[])
            .await
            .map_err(EngineError::Schema)?
            .is_none();
        drop(conn);

        Ok(Self {
            pool,
            schema: Arc::new(schema),
            newly_created: Arc::new(AtomicBool::new(newly_created)),
        })
    }

    fn schema(&self) -> &str {
        self.schema.as_str()
    }

    /// Whether this schema had no `ds` rows as of `init_db`/`with_pool`
    /// (spec 4.11): lets a caller distinguish a fresh bootstrap from
    /// resuming against an already-populated schema. Mirrors the
    /// persistence crate's `PostgresPersistence::is_fresh`.
    pub fn is_freshly_created(&self) -> bool {
        self.newly_created.load(Ordering::SeqCst)
    }

    /// `FetchOrCreateDataSource(ident, dsSpec?)` (spec 4.3).
    pub async fn fetch_or_create_data_source(
        &self,
        ident: &serde_json::Value,
        spec: Option<&DsSpec>,
    ) -> Result<DataSource, EngineError> {
        let conn = self.checkout("fetch_or_create_data_source").await?;

        if let Some(found) = catalog::select_ds_by_ident(&conn, self.schema(), ident)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "select_ds_by_ident", source: e })?
        {
            let archives = self.load_archives(&conn, found.0).await?;
            return Ok(DataSource {
                id: found.0,
                ident: found.1,
                step_ms: found.2,
                heartbeat_ms: found.3,
                last_update: found.4,
                value: found.5,
                duration_ms: found.6,
                archives,
            });
        }

        let spec = spec.ok_or_else(|| {
            EngineError::contract(format!("data source {ident} does not exist and no spec was given"))
        })?;

        let upserted = upsert::upsert_ds(&conn, self.schema(), ident, spec)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "upsert_ds", source: e })?;
        self.newly_created.store(false, Ordering::SeqCst);

        let mut archives = Vec::with_capacity(spec.archives.len());
        for archive_spec in &spec.archives {
            let archive = self
                .fetch_or_create_archive(&conn, upserted.id, spec.step_ms, archive_spec)
                .await?;
            archives.push(archive);
        }

        Ok(DataSource {
            id: upserted.id,
            ident: ident.clone(),
            step_ms: upserted.step_ms,
            heartbeat_ms: upserted.heartbeat_ms,
            last_update: None,
            value: None,
            duration_ms: None,
            archives,
        })
    }

    async fn fetch_or_create_archive(
        &self,
        conn: &crate::connection::EngineConnection<'_>,
        ds_id: i64,
        step_ms: i64,
        archive_spec: &ArchiveSpec,
    ) -> Result<Archive, EngineError> {
        let bundle = upsert::fetch_or_create_bundle(conn, self.schema(), step_ms, archive_spec.size, 200)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "fetch_or_create_bundle", source: e })?;

        let pos = allocator::allocate_position(conn, self.schema(), bundle.id)
            .await
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => EngineError::Connectivity { operation: "allocate_position", source: e },
            })?;
        let seg = crate::addressing::segment_of(pos, bundle.width);
        let idx = crate::addressing::index_of(pos, bundle.width);

        let row = upsert::fetch_or_create_archive(conn, self.schema(), ds_id, bundle.id, pos, seg, idx, archive_spec)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "fetch_or_create_archive", source: e })?;

        let (id, ds_id, bundle_id, cf, pos, seg, idx, xff, value, duration_ms) =
            catalog::archive_row_to_partial(&row)
                .map_err(|e| EngineError::Connectivity { operation: "archive_row_to_partial", source: e })?;

        Ok(Archive {
            id,
            ds_id,
            bundle_id,
            cf,
            pos,
            seg,
            idx,
            xff,
            value,
            duration_ms,
            step_ms: bundle.step_ms,
            size: bundle.size,
            latest: None,
        })
    }

    async fn load_archives(
        &self,
        conn: &crate::connection::EngineConnection<'_>,
        ds_id: i64,
    ) -> Result<Vec<Archive>, EngineError> {
        let rows = catalog::load_archives_for_ds(conn, self.schema(), ds_id)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "load_archives_for_ds", source: e })?;
        let mut archives = Vec::with_capacity(rows.len());
        for row in &rows {
            let (id, ds_id, bundle_id, cf, pos, seg, idx, xff, value, duration_ms) =
                catalog::archive_row_to_partial(row)
                    .map_err(|e| EngineError::Connectivity { operation: "archive_row_to_partial", source: e })?;
            let bundle = self.load_bundle_by_id(conn, bundle_id).await?;
            let latest = self.load_latest(conn, bundle_id, seg, idx).await?;
            archives.push(Archive {
                id,
                ds_id,
                bundle_id,
                cf,
                pos,
                seg,
                idx,
                xff,
                value,
                duration_ms,
                step_ms: bundle.step_ms,
                size: bundle.size,
                latest,
            });
        }
        Ok(archives)
    }

    async fn load_bundle_by_id(
        &self,
        conn: &crate::connection::EngineConnection<'_>,
        bundle_id: i64,
    ) -> Result<crate::catalog::Bundle, EngineError> {
        let row = conn
            .query_opt(
                &sql::qualify("SELECT id, step_ms, size, width, last_pos FROM @.rra_bundle WHERE id = $1", self.schema()),
                &[&bundle_id],
            )
            .await
            .map_err(|e| EngineError::Connectivity { operation: "load_bundle_by_id", source: e })?
            .ok_or_else(|| EngineError::contract(format!("bundle {bundle_id} referenced by an archive does not exist")))?;
        crate::catalog::Bundle::try_from(&row)
            .map_err(|e| EngineError::Connectivity { operation: "load_bundle_by_id", source: e })
    }

    async fn load_latest(
        &self,
        conn: &crate::connection::EngineConnection<'_>,
        bundle_id: i64,
        seg: i32,
        idx: i32,
    ) -> Result<Option<i64>, EngineError> {
        let row = conn
            .query_opt(
                &sql::qualify(sql::SELECT_BUNDLE_SEGMENT_LATEST, self.schema()),
                &[&bundle_id, &seg],
            )
            .await
            .map_err(|e| EngineError::Connectivity { operation: "load_latest", source: e })?;
        Ok(row.and_then(|row| {
            let latest: Vec<Option<i64>> = row.get("latest");
            latest.get(idx as usize).copied().flatten()
        }))
    }

    /// `FetchDataSources` (spec 4.4): bulk-loads every DS with its archives,
    /// repairing a stale `ds.lastupdate` from the max `latest` across
    /// archives (spec 4.4, S5).
    pub async fn fetch_data_sources(&self) -> Result<Vec<DataSource>, EngineError> {
        let conn = self.checkout("fetch_data_sources").await?;
        let rows = conn
            .query(
                &conn
                    .prepare_cached(&sql::qualify(sql::LOAD_ALL_DATA_SOURCES, self.schema()))
                    .await
                    .map_err(|e| EngineError::Connectivity { operation: "fetch_data_sources", source: e })?,
                &[],
            )
            .await
            .map_err(|e| EngineError::Connectivity { operation: "fetch_data_sources", source: e })?;

        let mut by_ds: BTreeMap<i64, DataSource> = BTreeMap::new();
        let mut order: Vec<i64> = Vec::new();
        for row in &rows {
            let ds_id: i64 = row.get("ds_id");
            let entry = by_ds.entry(ds_id).or_insert_with(|| {
                order.push(ds_id);
                DataSource {
                    id: ds_id,
                    ident: row.get("ident"),
                    step_ms: row.get("ds_step_ms"),
                    heartbeat_ms: row.get("heartbeat_ms"),
                    last_update: row.get("lastupdate"),
                    value: row.get("ds_value"),
                    duration_ms: row.get("ds_duration_ms"),
                    archives: Vec::new(),
                }
            });
            let cf: String = row.get("cf");
            let cf = cf
                .parse::<ConsolidationFn>()
                .map_err(|e| EngineError::Connectivity { operation: "fetch_data_sources", source: anyhow::anyhow!(e) })?;
            let bundle_step_ms: i64 = row.get("bundle_step_ms");
            let bundle_size: i32 = row.get("bundle_size");
            let latest: Option<i64> = row.get("archive_latest");
            entry.archives.push(Archive {
                id: row.get("rra_id"),
                ds_id,
                bundle_id: 0,
                cf,
                pos: row.get("pos"),
                seg: row.get("seg"),
                idx: row.get("idx"),
                xff: row.get("xff"),
                value: row.get("rra_value"),
                duration_ms: row.get("rra_duration_ms"),
                step_ms: bundle_step_ms,
                size: bundle_size,
                latest,
            });
            if let Some(l) = latest {
                let stale = match entry.last_update {
                    None => true,
                    Some(cur) => l > cur,
                };
                if stale {
                    entry.last_update = Some(l);
                }
            }
        }

        Ok(order.into_iter().filter_map(|id| by_ds.remove(&id)).collect())
    }

    /// `FetchSeries(ds, from, to, maxPoints)` (spec 4.8).
    pub async fn fetch_series(
        &self,
        archive: &Archive,
        ds_last_update: Option<i64>,
        from_ms: i64,
        to_ms: i64,
        max_points: i64,
    ) -> Result<Vec<Sample>, EngineError> {
        let conn = self.checkout("fetch_series").await?;
        fetch::fetch_series(&conn, self.schema(), archive, ds_last_update, from_ms, to_ms, max_points)
            .await
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => EngineError::Connectivity { operation: "fetch_series", source: e },
            })
    }

    /// Debug view counterpart of [`Self::fetch_series`] (spec Section 9):
    /// every slot, unfiltered by version.
    pub async fn fetch_series_debug(
        &self,
        ds_id: i64,
        rra_id: i64,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<Point>, EngineError> {
        let conn = self.checkout("fetch_series_debug").await?;
        view::read_range_debug(&conn, self.schema(), ds_id, rra_id, from_ms, to_ms)
            .await
            .map_err(|e| EngineError::Connectivity { operation: "fetch_series_debug", source: e })
    }

    /// `FlushDPs(bundle_id, seg, i, dp_map, ver_map)` (spec 4.5).
    pub async fn flush_dps(
        &self,
        bundle_id: i64,
        seg: i32,
        i: i32,
        dp: &BTreeMap<i32, f64>,
        ver: &BTreeMap<i32, i16>,
    ) -> Result<u64, EngineError> {
        let conn = self.checkout("flush_dps").await?;
        flush::flush_dps(&conn, self.schema(), bundle_id, seg, i, dp, ver)
            .await
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => EngineError::Connectivity { operation: "flush_dps", source: e },
            })
    }

    /// `FlushLatests(bundle_id, seg, latest_map)` (spec 4.6).
    pub async fn flush_latests(
        &self,
        bundle_id: i64,
        seg: i32,
        latest: &BTreeMap<i32, i64>,
    ) -> Result<u64, EngineError> {
        let conn = self.checkout("flush_latests").await?;
        flush::flush_latests(&conn, self.schema(), bundle_id, seg, latest)
            .await
            .map_err(|e| match e.downcast::<EngineError>() {
                Ok(engine_err) => engine_err,
                Err(e) => EngineError::Connectivity { operation: "flush_latests", source: e },
            })
    }

    /// `FlushDataSource(ds)` (spec Section 6): flushes every archive's
    /// pending `latest` in one pass. Per spec Section 9, this does not
    /// verify rows-affected against a since-deleted DS -- a silent no-op is
    /// accepted rather than treated as an error.
    pub async fn flush_data_source(&self, ds: &DataSource, latest_by_archive: &BTreeMap<i64, i64>) -> Result<u64, EngineError> {
        let mut by_segment: BTreeMap<(i64, i32), BTreeMap<i32, i64>> = BTreeMap::new();
        for archive in &ds.archives {
            if let Some(&latest) = latest_by_archive.get(&archive.id) {
                by_segment
                    .entry((archive.bundle_id, archive.seg))
                    .or_default()
                    .insert(archive.idx, latest);
            }
        }
        let mut statements = 0u64;
        for ((bundle_id, seg), latest) in by_segment {
            match self.flush_latests(bundle_id, seg, &latest).await {
                Ok(n) => statements += n,
                Err(e) => {
                    tracing::warn!(ds_id = ds.id, %e, "flush_data_source: flushing latest failed, continuing");
                },
            }
        }
        Ok(statements)
    }

    /// `Search(query)` (spec Section 6): a thin pass-through over `ds.ident`
    /// substring matching. The identifier search layer proper is an
    /// external collaborator (spec Section 1); this only exposes the
    /// minimal cursor the core owns.
    pub async fn search(&self, query: &str) -> Result<Vec<DataSource>, EngineError> {
        let conn = self.checkout("search").await?;
        let sql_text = sql::qualify(
            "SELECT id, ident, step_ms, heartbeat_ms, lastupdate, value, duration_ms FROM @.ds WHERE ident::text ILIKE $1 ORDER BY id",
            self.schema(),
        );
        let pattern = format!("%{query}%");
        let rows = conn
            .query(
                &conn
                    .prepare_cached(&sql_text)
                    .await
                    .map_err(|e| EngineError::Connectivity { operation: "search", source: e })?,
                &[&pattern],
            )
            .await
            .map_err(|e| EngineError::Connectivity { operation: "search", source: e })?;
        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.get("id");
            let archives = self.load_archives(&conn, id).await?;
            result.push(DataSource {
                id,
                ident: row.get("ident"),
                step_ms: row.get("step_ms"),
                heartbeat_ms: row.get("heartbeat_ms"),
                last_update: row.get("lastupdate"),
                value: row.get("value"),
                duration_ms: row.get("duration_ms"),
                archives,
            });
        }
        Ok(result)
    }

    /// `TsTableSize()` (spec Section 6).
    pub async fn ts_table_size(&self) -> Result<(i64, i64), EngineError> {
        let conn = self.checkout("ts_table_size").await?;
        let row = conn
            .query_opt(&sql::qualify(sql::TS_TABLE_SIZE, self.schema()), &[])
            .await
            .map_err(|e| EngineError::Connectivity { operation: "ts_table_size", source: e })?
            .context("ts_table_size returned no row")
            .map_err(EngineError::Other)?;
        Ok((row.get("bytes"), row.get("rows")))
    }

    /// `ListDbClientIps()` (spec Section 6).
    pub async fn list_db_client_ips(&self) -> Result<Vec<String>, EngineError> {
        let conn = self.checkout("list_db_client_ips").await?;
        let rows = conn
            .query(
                &conn
                    .prepare_cached(sql::LIST_DB_CLIENT_IPS)
                    .await
                    .map_err(|e| EngineError::Connectivity { operation: "list_db_client_ips", source: e })?,
                &[],
            )
            .await
            .map_err(|e| EngineError::Connectivity { operation: "list_db_client_ips", source: e })?;
        Ok(rows.into_iter().map(|row| row.get(0)).collect())
    }

    /// `MyDbAddr()` (spec Section 6).
    pub async fn my_db_addr(&self) -> Result<(Option<String>, Option<i32>), EngineError> {
        let conn = self.checkout("my_db_addr").await?;
        let row = conn
            .query_opt(sql::MY_DB_ADDR, &[])
            .await
            .map_err(|e| EngineError::Connectivity { operation: "my_db_addr", source: e })?
            .context("my_db_addr returned no row")
            .map_err(EngineError::Other)?;
        Ok((row.get(0), row.get(1)))
    }

    async fn checkout(&self, operation: &'static str) -> Result<crate::connection::EngineConnection<'_>, EngineError> {
        self.pool
            .get_connection()
            .await
            .map_err(|source| EngineError::Connectivity { operation, source })
    }

    /// Exposes a raw pooled connection and the resolved schema prefix for
    /// integration tests that need to reach into modules below the public
    /// API surface (e.g. simulating external interference for S6).
    #[cfg(any(test, feature = "testing"))]
    pub async fn pool_get_connection_for_test(&self) -> crate::connection::EngineConnection<'_> {
        self.pool.get_connection().await.expect("checking out a test connection")
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn schema_for_test(&self) -> &str {
        self.schema()
    }
}

/// Test-database bootstrap helpers, mirroring the persistence crate's
/// `itest` module but gated on `RRA_TEST_DATABASE_URL` rather than sniffing
/// a CI-specific marker file.
#[cfg(any(test, feature = "testing"))]
pub mod itest {
    use anyhow::Context;
    use rand::Rng;

    /// Returns the base cluster URL (no database name) for integration
    /// tests, or `None` if no test cluster is configured -- callers should
    /// skip rather than fail in that case (spec Section 8 test harness).
    pub fn cluster_url() -> Option<String> {
        std::env::var("RRA_TEST_DATABASE_URL").ok()
    }

    /// Creates a fresh, randomly-named database on the configured test
    /// cluster and returns a connection URL to it.
    pub async fn new_db_url() -> anyhow::Result<Option<String>> {
        let Some(cluster_url) = cluster_url() else {
            return Ok(None);
        };
        let id: [u8; 16] = rand::rng().random();
        let db_name = format!("rra_test_{}", hex::encode(id));

        let (client, conn) = tokio_postgres::connect(&cluster_url, tokio_postgres::NoTls)
            .await
            .with_context(|| format!("connecting to test cluster at {cluster_url}"))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::error!("test cluster connection error: {e}");
            }
        });
        client
            .batch_execute(&format!("CREATE DATABASE {db_name};"))
            .await
            .context("creating test database")?;

        let base = cluster_url.trim_end_matches('/');
        Ok(Some(format!("{base}/{db_name}")))
    }
}
