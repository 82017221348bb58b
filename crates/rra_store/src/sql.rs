//! DDL and the fixed SQL text used by the catalog, allocator, flusher, and
//! view modules.
//!
//! Grounded in the persistence crate's `sql.rs`: tables and indexes are
//! created with `to_regclass(...) IS NULL` guards so `InitDb` is safe to run
//! against an already-initialized schema, and every name is qualified by a
//! `@schema` placeholder substituted at connect time (mirroring that crate's
//! `@db_name` convention) so one Postgres database can host multiple
//! independently-prefixed engines.

use const_format::formatcp;

/// Replaces the `@schema` placeholder with the configured schema name.
/// `schema` must already be validated as a safe identifier by the caller
/// (see `catalog::validate_schema_name`) -- this function does not quote or
/// escape it, matching the source convention of trusting operator-supplied
/// schema names rather than user input.
pub fn qualify(sql: &str, schema: &str) -> String {
    sql.replace('@', schema)
}

pub const CHECK_SCHEMA_SQL: &str =
    "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1";

/// `None` back means no `ds` row exists yet, i.e. the schema is freshly
/// created rather than being resumed.
pub const CHECK_NEWLY_CREATED: &str = "SELECT 1 FROM @.ds LIMIT 1";

pub const CREATE_SCHEMA_SQL: &str = "CREATE SCHEMA IF NOT EXISTS @;";

/// Each statement is idempotent: guarded by `to_regclass` so re-running
/// `InitDb` against a live schema never re-acquires the `ACCESS EXCLUSIVE`
/// lock that a bare `CREATE TABLE IF NOT EXISTS` would still take.
pub const INIT_SQL: &[&str] = &[
    formatcp!(
        r#"
DO $$
BEGIN
    IF to_regclass('@.ds') IS NULL THEN
        CREATE TABLE @.ds (
            id BIGSERIAL PRIMARY KEY,
            ident JSONB NOT NULL,
            step_ms BIGINT NOT NULL,
            heartbeat_ms BIGINT NOT NULL,
            lastupdate BIGINT,
            value DOUBLE PRECISION,
            duration_ms BIGINT,
            created BOOLEAN NOT NULL DEFAULT true
        );
        CREATE UNIQUE INDEX ds_by_ident ON @.ds ((ident::text));
    END IF;
END $$;
"#
    ),
    formatcp!(
        r#"
DO $$
BEGIN
    IF to_regclass('@.rra_bundle') IS NULL THEN
        CREATE TABLE @.rra_bundle (
            id BIGSERIAL PRIMARY KEY,
            step_ms BIGINT NOT NULL,
            size INT NOT NULL,
            width INT NOT NULL DEFAULT 200,
            last_pos BIGINT NOT NULL DEFAULT -1
        );
        CREATE UNIQUE INDEX rra_bundle_by_step_size ON @.rra_bundle (step_ms, size);
    END IF;
END $$;
"#
    ),
    formatcp!(
        r#"
DO $$
BEGIN
    IF to_regclass('@.rra') IS NULL THEN
        CREATE TABLE @.rra (
            id BIGSERIAL PRIMARY KEY,
            ds_id BIGINT NOT NULL REFERENCES @.ds (id) ON DELETE CASCADE,
            bundle_id BIGINT NOT NULL REFERENCES @.rra_bundle (id) ON DELETE RESTRICT,
            cf TEXT NOT NULL,
            pos BIGINT NOT NULL,
            seg INT NOT NULL,
            idx INT NOT NULL,
            xff DOUBLE PRECISION NOT NULL DEFAULT 0.5,
            value DOUBLE PRECISION,
            duration_ms BIGINT
        );
        CREATE UNIQUE INDEX rra_by_ds_bundle_cf ON @.rra (ds_id, bundle_id, cf);
    END IF;
END $$;
"#
    ),
    formatcp!(
        r#"
DO $$
BEGIN
    IF to_regclass('@.rra_latest') IS NULL THEN
        CREATE TABLE @.rra_latest (
            bundle_id BIGINT NOT NULL REFERENCES @.rra_bundle (id) ON DELETE CASCADE,
            seg INT NOT NULL,
            latest BIGINT[] NOT NULL,
            PRIMARY KEY (bundle_id, seg)
        );
    END IF;
END $$;
"#
    ),
    formatcp!(
        r#"
DO $$
BEGIN
    IF to_regclass('@.ts') IS NULL THEN
        CREATE TABLE @.ts (
            bundle_id BIGINT NOT NULL REFERENCES @.rra_bundle (id) ON DELETE CASCADE,
            seg INT NOT NULL,
            i INT NOT NULL,
            dp DOUBLE PRECISION[] NOT NULL DEFAULT '{{}}',
            ver SMALLINT[] NOT NULL DEFAULT '{{}}',
            PRIMARY KEY (bundle_id, seg, i)
        );
    END IF;
END $$;
"#
    ),
];

/// The production read view (spec 4.7): reconstructs `(ds_id, rra_id, t, r)`
/// and reports `r = NULL` for any slot whose stored version disagrees with
/// the version implied by the archive's current `latest`.
pub const CREATE_TV_VIEW: &str = formatcp!(
    r#"
CREATE OR REPLACE VIEW @.tv AS
SELECT
    rra.ds_id AS ds_id,
    rra.id AS rra_id,
    b.step_ms AS step_ms,
    latest.latest[rra.idx + 1] -
        b.step_ms * (
            (b.size + ((latest.latest[rra.idx + 1] / b.step_ms) % b.size) - slot.i)
            % b.size
        ) AS t,
    CASE
        WHEN ts.ver[rra.idx + 1] IS NULL THEN ts.dp[rra.idx + 1]
        WHEN ts.ver[rra.idx + 1] = (
            ((latest.latest[rra.idx + 1] / (b.step_ms * b.size)) % 32767)
            - (CASE WHEN slot.i > ((latest.latest[rra.idx + 1] / b.step_ms) % b.size)
                THEN 1 ELSE 0 END)
        ) THEN ts.dp[rra.idx + 1]
        ELSE NULL
    END AS r
FROM @.rra rra
JOIN @.rra_bundle b ON b.id = rra.bundle_id
JOIN @.rra_latest latest ON latest.bundle_id = rra.bundle_id AND latest.seg = rra.seg
CROSS JOIN LATERAL generate_series(0, b.size - 1) AS slot (i)
JOIN @.ts ts ON ts.bundle_id = rra.bundle_id AND ts.seg = rra.seg AND ts.i = slot.i
WHERE latest.latest[rra.idx + 1] IS NOT NULL;
"#
);

/// Debug-only counterpart of `tv` (spec 4.7, Non-goals / Section 9): same
/// derivation, but every slot is emitted regardless of version agreement,
/// plus the raw position/seg/idx fields useful for diagnosing addressing
/// bugs. Never used by the production fetch pipeline.
pub const CREATE_TVD_VIEW: &str = formatcp!(
    r#"
CREATE OR REPLACE VIEW @.tvd AS
SELECT
    rra.ds_id AS ds_id,
    rra.id AS rra_id,
    rra.bundle_id AS bundle_id,
    rra.seg AS seg,
    rra.idx AS idx,
    slot.i AS i,
    b.step_ms AS step_ms,
    to_timestamp(
        (latest.latest[rra.idx + 1] -
            b.step_ms * (
                (b.size + ((latest.latest[rra.idx + 1] / b.step_ms) % b.size) - slot.i)
                % b.size
            )) / 1000.0
    ) AS ts,
    ts.dp[rra.idx + 1] AS r,
    ts.ver[rra.idx + 1] AS stored_version
FROM @.rra rra
JOIN @.rra_bundle b ON b.id = rra.bundle_id
JOIN @.rra_latest latest ON latest.bundle_id = rra.bundle_id AND latest.seg = rra.seg
CROSS JOIN LATERAL generate_series(0, b.size - 1) AS slot (i)
JOIN @.ts ts ON ts.bundle_id = rra.bundle_id AND ts.seg = rra.seg AND ts.i = slot.i
WHERE latest.latest[rra.idx + 1] IS NOT NULL;
"#
);

pub const SELECT_DS_BY_IDENT: &str = r#"
SELECT id, ident, step_ms, heartbeat_ms, lastupdate, value, duration_ms
FROM @.ds
WHERE ident::text = $1::text
"#;

pub const UPSERT_DS: &str = r#"
INSERT INTO @.ds (ident, step_ms, heartbeat_ms)
VALUES ($1, $2, $3)
ON CONFLICT ((ident::text)) DO UPDATE SET created = false
RETURNING id, ident, step_ms, heartbeat_ms, lastupdate, value, duration_ms, created
"#;

pub const SELECT_BUNDLE_BY_STEP_SIZE: &str = r#"
SELECT id, step_ms, size, width, last_pos FROM @.rra_bundle WHERE step_ms = $1 AND size = $2
"#;

pub const UPSERT_BUNDLE: &str = r#"
INSERT INTO @.rra_bundle (step_ms, size, width)
VALUES ($1, $2, $3)
ON CONFLICT (step_ms, size) DO UPDATE SET step_ms = @.rra_bundle.step_ms
RETURNING id, step_ms, size, width, last_pos
"#;

pub const ALLOCATE_POSITION: &str = r#"
UPDATE @.rra_bundle SET last_pos = last_pos + 1 WHERE id = $1 RETURNING last_pos
"#;

pub const UPSERT_ARCHIVE: &str = r#"
INSERT INTO @.rra (ds_id, bundle_id, cf, pos, seg, idx, xff, duration_ms)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
ON CONFLICT (ds_id, bundle_id, cf) DO UPDATE SET ds_id = @.rra.ds_id
RETURNING id, ds_id, bundle_id, cf, pos, seg, idx, xff, value, duration_ms
"#;

pub const LOAD_ARCHIVES_FOR_DS: &str = r#"
SELECT id, ds_id, bundle_id, cf, pos, seg, idx, xff, value, duration_ms
FROM @.rra
WHERE ds_id = $1
ORDER BY id
"#;

/// Bulk `FetchDataSources` (spec 4.4): one query across `ds`, `rra`,
/// `rra_bundle`, and `rra_latest`, ordered so the caller can group rows by
/// `ds.id` with a single pass.
pub const LOAD_ALL_DATA_SOURCES: &str = r#"
SELECT
    ds.id AS ds_id, ds.ident, ds.step_ms AS ds_step_ms, ds.heartbeat_ms,
    ds.lastupdate, ds.value AS ds_value, ds.duration_ms AS ds_duration_ms,
    rra.id AS rra_id, rra.cf, rra.pos, rra.seg, rra.idx, rra.xff,
    rra.value AS rra_value, rra.duration_ms AS rra_duration_ms,
    b.step_ms AS bundle_step_ms, b.size AS bundle_size,
    latest.latest[rra.idx + 1] AS archive_latest
FROM @.ds ds
JOIN @.rra rra ON rra.ds_id = ds.id
JOIN @.rra_bundle b ON b.id = rra.bundle_id
LEFT JOIN @.rra_latest latest ON latest.bundle_id = rra.bundle_id AND latest.seg = rra.seg
ORDER BY ds.id, rra.id
"#;

pub const SELECT_BUNDLE_SEGMENT_LATEST: &str = r#"
SELECT latest FROM @.rra_latest WHERE bundle_id = $1 AND seg = $2
"#;

pub const INSERT_WIDE_ROW: &str = r#"
INSERT INTO @.ts (bundle_id, seg, i) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING
"#;

pub const INSERT_LATEST_ROW: &str = r#"
INSERT INTO @.rra_latest (bundle_id, seg, latest) VALUES ($1, $2, '{}')
ON CONFLICT DO NOTHING
"#;

/// Single-chunk flush of `dp`/`ver` (spec 4.5): one contiguous `idx` range,
/// so this is preparable and reused across calls.
pub const UPDATE_WIDE_ROW_SINGLE_CHUNK: &str = r#"
UPDATE @.ts
SET dp[$4:$5] = $6, ver[$7:$8] = $9
WHERE bundle_id = $1 AND seg = $2 AND i = $3
"#;

pub const UPDATE_LATEST_ROW: &str = r#"
UPDATE @.rra_latest
SET latest[$3:$4] = $5
WHERE bundle_id = $1 AND seg = $2
"#;

/// Generates the regular timeline at the archive's own step and left-joins
/// it with `tv`, so a slot whose wide row was never created (the normal
/// state before a ring has wrapped once) still contributes a NULL-valued
/// sample instead of being silently absent from the bucketed output.
pub const FETCH_SERIES_BUCKETED: &str = r#"
WITH bounds AS (
    SELECT $3::bigint AS bucket_ms
),
timeline AS (
    SELECT generate_series($4::bigint, $5::bigint, $6::bigint) AS t
),
samples AS (
    SELECT timeline.t AS t, tv.r AS r
    FROM timeline
    LEFT JOIN @.tv ON tv.ds_id = $1 AND tv.rra_id = $2 AND tv.t = timeline.t
)
SELECT
    (trunc((t - 1) / (SELECT bucket_ms FROM bounds)) + 1) * (SELECT bucket_ms FROM bounds) AS bucket_end,
    avg(r) AS value
FROM samples
GROUP BY bucket_end
ORDER BY bucket_end
"#;

pub const TS_TABLE_SIZE: &str = r#"
SELECT pg_total_relation_size('@.ts'::regclass) AS bytes, count(*) AS rows FROM @.ts
"#;

pub const LIST_DB_CLIENT_IPS: &str = r#"
SELECT DISTINCT client_addr::text FROM pg_stat_activity WHERE client_addr IS NOT NULL
"#;

pub const MY_DB_ADDR: &str = r#"
SELECT inet_client_addr()::text, inet_client_port()
"#;
