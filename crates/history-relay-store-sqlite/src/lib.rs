use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use history_relay_core::{
    beats_boundary, AdmissionPolicy, AdmitOutcome, Bucket, CappedScan, Category, Decision, EventId,
    Filter, Identity, KernelError, QueryPlan, RecencyKey, Record, Rejection, RelayConfig,
    ScanStats, ScanStep, StopReason,
};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OpenFlags, OptionalExtension,
    TransactionBehavior,
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;
const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const QUERY_CHANNEL_CAPACITY: usize = 64;
/// Larger id or identity sets are left to exact matching.
const COARSE_SET_LIMIT: usize = 500;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  id BLOB PRIMARY KEY CHECK (length(id) = 32),
  identity BLOB NOT NULL CHECK (length(identity) = 32),
  category INTEGER NOT NULL CHECK (category BETWEEN 0 AND 65535),
  created_at INTEGER NOT NULL,
  payload TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at);
CREATE INDEX IF NOT EXISTS idx_records_category_created_at ON records(category, created_at);
CREATE INDEX IF NOT EXISTS idx_records_identity_created_at ON records(identity, created_at);
CREATE INDEX IF NOT EXISTS idx_records_identity_category_created_at
  ON records(identity, category, created_at);
";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("storage busy: {0}")]
    Busy(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Sqlite(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketStats {
    pub bucket: Bucket,
    pub records: u64,
    pub newest_created_at: i64,
    pub oldest_created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub retention_per_bucket: u32,
    pub oversized_buckets: Vec<BucketStats>,
    pub schema_status: SchemaStatus,
}

/// SQLite-backed retention store.
///
/// One `SqliteStore` owns one write connection. Threads that admit
/// concurrently open their own store on the same path; SQLite's write lock
/// serializes the admission transactions.
pub struct SqliteStore {
    conn: Connection,
    path: PathBuf,
    config: RelayConfig,
    policy: AdmissionPolicy,
}

impl SqliteStore {
    /// Open a store and configure the runtime pragmas it relies on.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid, the database cannot
    /// be opened, or pragmas cannot be applied.
    pub fn open(path: &Path, config: RelayConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let policy = AdmissionPolicy::new(&config);
        Ok(Self { conn, path: path.to_path_buf(), config, policy })
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when a migration fails or the database is newer than
    /// this build understands.
    pub fn migrate(&mut self) -> Result<(), StoreError> {
        self.conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)?;
        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration_1()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(StoreError::Migration(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    fn apply_migration_1(&mut self) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(MIGRATION_001_SQL)
            .map_err(|err| StoreError::Migration(format!("failed to apply migration v1: {err}")))?;
        record_schema_version(&tx, 1)?;
        tx.commit()?;
        tracing::info!(version = 1, path = %self.path.display(), "applied schema migration");
        Ok(())
    }

    /// Fast, read-only admission check: category allow-list, then duplicate
    /// probe. May race with a concurrent insert of the same id; [`Self::admit`]
    /// re-checks inside its transaction.
    ///
    /// # Errors
    /// Returns an error when the duplicate probe fails.
    pub fn decide(&self, record: &Record) -> Result<Decision, StoreError> {
        if let Decision::Reject(rejection) = self.policy.check_category(record) {
            return Ok(Decision::Reject(rejection));
        }
        if self.record_exists(record.id)? {
            return Ok(Decision::Reject(Rejection::Duplicate));
        }
        Ok(Decision::Accept)
    }

    /// Insert `record` if it belongs in the top `N` of its bucket, then trim
    /// the bucket back to `N`.
    ///
    /// Duplicate check, boundary read, insert and trim run in one
    /// `BEGIN IMMEDIATE` transaction. A rejection or error rolls the whole
    /// unit back.
    ///
    /// # Errors
    /// Returns [`StoreError::Busy`] when the write lock cannot be taken before
    /// the busy timeout, or another [`StoreError`] for storage faults.
    pub fn admit(&mut self, record: &Record) -> Result<AdmitOutcome, StoreError> {
        if let Decision::Reject(rejection) = self.policy.check_category(record) {
            return Ok(AdmitOutcome::Rejected(rejection));
        }
        let payload = record.to_payload()?;
        let bucket = record.bucket();

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if id_exists(&tx, record.id)? {
            return Ok(AdmitOutcome::Rejected(Rejection::Duplicate));
        }

        let Some(boundary_rank) = self.config.boundary_rank() else {
            return Ok(AdmitOutcome::Rejected(Rejection::TooOld));
        };
        let boundary = load_boundary(&tx, bucket, boundary_rank)?;
        if !beats_boundary(
            &record.recency_key(),
            boundary.as_ref(),
            self.config.retention_per_bucket,
        ) {
            return Ok(AdmitOutcome::Rejected(Rejection::TooOld));
        }

        tx.execute(
            "INSERT INTO records(id, identity, category, created_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id.as_bytes().as_slice(),
                bucket.identity.as_bytes().as_slice(),
                bucket.category.0,
                record.created_at,
                payload,
            ],
        )?;
        let evicted = trim_bucket(&tx, bucket, self.config.retention_per_bucket)?;
        tx.commit()?;

        Ok(AdmitOutcome::Admitted { evicted })
    }

    /// Admission policy followed by the retention engine.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for storage faults; policy rejections are
    /// returned as [`AdmitOutcome::Rejected`].
    pub fn decide_and_admit(&mut self, record: &Record) -> Result<AdmitOutcome, StoreError> {
        let outcome = match self.decide(record)? {
            Decision::Reject(rejection) => AdmitOutcome::Rejected(rejection),
            Decision::Accept => self.admit(record)?,
        };

        match &outcome {
            AdmitOutcome::Admitted { evicted } => tracing::debug!(
                id = %record.id,
                bucket = %record.bucket(),
                created_at = record.created_at,
                evicted = evicted.len(),
                "record admitted"
            ),
            AdmitOutcome::Rejected(rejection) => tracing::debug!(
                id = %record.id,
                bucket = %record.bucket(),
                reason = %rejection,
                "record rejected"
            ),
        }

        Ok(outcome)
    }

    /// Start a capped, lazily produced scan for `filter`.
    ///
    /// The scan runs on a dedicated thread with its own read connection and
    /// sees one consistent snapshot. No ordering is promised beyond
    /// determinism within that snapshot, and the result is not guaranteed
    /// complete once either cap is hit.
    ///
    /// # Errors
    /// Returns [`StoreError::Query`] when the store is not file-backed or the
    /// scan cannot be prepared.
    pub fn query(&self, filter: &Filter) -> Result<QueryStream, StoreError> {
        let plan = filter.plan(&self.config);
        if plan.matches_nothing {
            tracing::debug!("filter names no accepted category; skipping scan");
            return Ok(QueryStream::empty());
        }
        if is_in_memory(&self.path) {
            return Err(StoreError::Query(
                "streaming queries require a file-backed database".to_string(),
            ));
        }
        QueryStream::spawn(self.path.clone(), plan)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn record_exists(&self, id: EventId) -> Result<bool, StoreError> {
        id_exists(&self.conn, id)
    }

    /// # Errors
    /// Returns an error when the lookup fails or the stored payload cannot be
    /// decoded.
    pub fn get_record(&self, id: EventId) -> Result<Option<Record>, StoreError> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM records WHERE id = ?1",
                params![id.as_bytes().as_slice()],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(payload.map(|raw| Record::decode_payload(&raw)).transpose()?)
    }

    /// Records retained for `bucket`, most recent first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn bucket_records(&self, bucket: Bucket) -> Result<Vec<Record>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT payload FROM records
             WHERE identity = ?1 AND category = ?2
             ORDER BY created_at DESC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![bucket.identity.as_bytes().as_slice(), bucket.category.0],
            |row| row.get::<_, String>(0),
        )?;

        let mut records = Vec::new();
        for row in rows {
            records.push(Record::decode_payload(&row?)?);
        }
        Ok(records)
    }

    /// Occupancy of every non-empty bucket.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn bucket_stats(&self) -> Result<Vec<BucketStats>, StoreError> {
        self.load_bucket_stats(None)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count_records(&self) -> Result<u64, StoreError> {
        let count = self.conn.query_row("SELECT COUNT(*) FROM records", [], |row| {
            row.get::<_, i64>(0)
        })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Run `PRAGMA quick_check`, report schema status, and list buckets holding
    /// more records than the configured retention.
    ///
    /// # Errors
    /// Returns an error when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let quick_check_message: String =
            self.conn.query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))?;
        let oversized_buckets =
            self.load_bucket_stats(Some(self.config.retention_per_bucket))?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            retention_per_bucket: self.config.retention_per_bucket,
            oversized_buckets,
            schema_status: self.schema_status()?,
        })
    }

    fn load_bucket_stats(&self, larger_than: Option<u32>) -> Result<Vec<BucketStats>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity, category, COUNT(*), MAX(created_at), MIN(created_at)
             FROM records
             GROUP BY identity, category
             HAVING COUNT(*) > ?1
             ORDER BY identity ASC, category ASC",
        )?;
        let threshold = larger_than.map_or(0, i64::from);
        let mut rows = stmt.query(params![threshold])?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next()? {
            let identity_raw: Vec<u8> = row.get(0)?;
            let records: i64 = row.get(2)?;
            stats.push(BucketStats {
                bucket: Bucket {
                    identity: Identity::from_slice(&identity_raw)?,
                    category: Category(row.get::<_, u16>(1)?),
                },
                records: u64::try_from(records).unwrap_or_default(),
                newest_created_at: row.get(3)?,
                oldest_created_at: row.get(4)?,
            });
        }
        Ok(stats)
    }
}

/// Lazily produced query results.
///
/// Finite and not restartable. Dropping the stream, or calling
/// [`QueryStream::cancel`], stops the producer and joins it, which releases
/// its cursor and connection.
pub struct QueryStream {
    receiver: Option<Receiver<Result<Record, StoreError>>>,
    cancel: Arc<AtomicBool>,
    producer: Option<JoinHandle<ScanStats>>,
    stats: ScanStats,
}

impl QueryStream {
    fn empty() -> Self {
        Self {
            receiver: None,
            cancel: Arc::new(AtomicBool::new(false)),
            producer: None,
            stats: ScanStats { stop_reason: Some(StopReason::Exhausted), ..ScanStats::default() },
        }
    }

    fn spawn(path: PathBuf, plan: QueryPlan) -> Result<Self, StoreError> {
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let (sender, receiver) = mpsc::sync_channel(QUERY_CHANNEL_CAPACITY);
        let cancel = Arc::new(AtomicBool::new(false));
        let producer_cancel = Arc::clone(&cancel);

        let producer = thread::Builder::new()
            .name("history-relay-query".to_string())
            .spawn(move || produce(&path, plan, &ready_tx, &sender, &producer_cancel))?;

        let ready = ready_rx.recv().unwrap_or_else(|_| {
            Err(StoreError::Query("query producer exited before starting its scan".to_string()))
        });
        if let Err(err) = ready {
            if producer.join().is_err() {
                tracing::error!("query producer panicked during setup");
            }
            return Err(err);
        }

        Ok(Self {
            receiver: Some(receiver),
            cancel,
            producer: Some(producer),
            stats: ScanStats::default(),
        })
    }

    /// Stop scanning now. Later calls to `next` return `None`.
    pub fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.shutdown();
    }

    /// Scan counters; final once the stream has returned `None`.
    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }

    fn shutdown(&mut self) {
        self.receiver.take();
        if let Some(producer) = self.producer.take() {
            match producer.join() {
                Ok(stats) => self.stats = stats,
                Err(_) => {
                    tracing::error!("query producer panicked");
                    self.stats.stop_reason = Some(StopReason::Failed);
                }
            }
        }
    }
}

impl Iterator for QueryStream {
    type Item = Result<Record, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        let received = self.receiver.as_ref()?.recv();
        if let Ok(item) = received {
            Some(item)
        } else {
            self.shutdown();
            None
        }
    }
}

impl Drop for QueryStream {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
        self.shutdown();
    }
}

struct CoarsePredicate {
    sql: String,
    params: Vec<Value>,
}

/// Narrow the scan using indexed columns only; tag matching and anything
/// else is left to exact matching on the decoded record.
fn coarse_predicate(filter: &Filter) -> CoarsePredicate {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    if let Some(since) = filter.since {
        clauses.push("created_at > ?".to_string());
        params.push(Value::Integer(since));
    }
    if let Some(until) = filter.until {
        clauses.push("created_at < ?".to_string());
        params.push(Value::Integer(until));
    }
    if !filter.categories.is_empty() {
        clauses.push(format!("category IN ({})", placeholders(filter.categories.len())));
        params.extend(filter.categories.iter().map(|category| Value::Integer(i64::from(category.0))));
    }
    if !filter.identities.is_empty() && filter.identities.len() <= COARSE_SET_LIMIT {
        clauses.push(format!("identity IN ({})", placeholders(filter.identities.len())));
        params.extend(filter.identities.iter().map(|identity| Value::Blob(identity.0.to_vec())));
    }
    if !filter.ids.is_empty() && filter.ids.len() <= COARSE_SET_LIMIT {
        clauses.push(format!("id IN ({})", placeholders(filter.ids.len())));
        params.extend(filter.ids.iter().map(|id| Value::Blob(id.0.to_vec())));
    }

    let predicate = if clauses.is_empty() { "1".to_string() } else { clauses.join(" AND ") };
    CoarsePredicate { sql: format!("SELECT payload FROM records WHERE {predicate}"), params }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

fn produce(
    path: &Path,
    plan: QueryPlan,
    ready: &SyncSender<Result<(), StoreError>>,
    sender: &SyncSender<Result<Record, StoreError>>,
    cancel: &AtomicBool,
) -> ScanStats {
    let predicate = coarse_predicate(&plan.filter);
    let mut scan = CappedScan::new(plan);

    let conn = match open_reader(path) {
        Ok(conn) => conn,
        Err(err) => {
            let _ = ready.send(Err(err));
            return scan.finish(StopReason::Failed);
        }
    };
    let mut stmt = match conn.prepare(&predicate.sql) {
        Ok(stmt) => stmt,
        Err(err) => {
            let _ = ready.send(Err(StoreError::Query(err.to_string())));
            return scan.finish(StopReason::Failed);
        }
    };
    let mut rows = match stmt.query(params_from_iter(predicate.params.iter())) {
        Ok(rows) => rows,
        Err(err) => {
            let _ = ready.send(Err(StoreError::Query(err.to_string())));
            return scan.finish(StopReason::Failed);
        }
    };
    let _ = ready.send(Ok(()));

    let reason = loop {
        if cancel.load(Ordering::Acquire) {
            break StopReason::Cancelled;
        }
        if let Some(reason) = scan.limit_reached() {
            break reason;
        }

        let row = match rows.next() {
            Ok(Some(row)) => row,
            Ok(None) => break StopReason::Exhausted,
            Err(err) => {
                let _ = sender.send(Err(StoreError::from(err)));
                break StopReason::Failed;
            }
        };
        let step = match row.get::<_, String>(0) {
            Ok(payload) => scan.offer(&payload),
            Err(
                err @ (rusqlite::Error::InvalidColumnType(..)
                | rusqlite::Error::FromSqlConversionFailure(..)
                | rusqlite::Error::Utf8Error(_)),
            ) => scan.offer_unreadable(KernelError::Decode(format!("stored payload: {err}"))),
            Err(err) => {
                let _ = sender.send(Err(StoreError::from(err)));
                break StopReason::Failed;
            }
        };

        match step {
            ScanStep::Matched(record) => {
                if sender.send(Ok(record)).is_err() {
                    break StopReason::Cancelled;
                }
            }
            ScanStep::Filtered => {}
            ScanStep::Undecodable(err) => {
                tracing::warn!(error = %err, "skipping undecodable stored record");
            }
        }
    };

    let stats = scan.finish(reason);
    tracing::debug!(
        scanned = stats.scanned,
        yielded = stats.yielded,
        undecodable = stats.undecodable,
        stop_reason = ?reason,
        "query scan finished"
    );
    stats
}

fn open_reader(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA query_only = ON;")?;
    Ok(conn)
}

fn is_in_memory(path: &Path) -> bool {
    let raw = path.as_os_str();
    raw.is_empty() || raw == ":memory:"
}

fn id_exists(conn: &Connection, id: EventId) -> Result<bool, StoreError> {
    let exists = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM records WHERE id = ?1)",
        params![id.as_bytes().as_slice()],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(exists == 1)
}

fn load_boundary(
    conn: &Connection,
    bucket: Bucket,
    boundary_rank: u32,
) -> Result<Option<RecencyKey>, StoreError> {
    let row = conn
        .query_row(
            "SELECT id, created_at FROM records
             WHERE identity = ?1 AND category = ?2
             ORDER BY created_at DESC, id ASC
             LIMIT 1 OFFSET ?3",
            params![
                bucket.identity.as_bytes().as_slice(),
                bucket.category.0,
                i64::from(boundary_rank)
            ],
            |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;

    match row {
        Some((id, created_at)) => {
            Ok(Some(RecencyKey { created_at, id: EventId::from_slice(&id)? }))
        }
        None => Ok(None),
    }
}

fn trim_bucket(
    conn: &Connection,
    bucket: Bucket,
    retention_per_bucket: u32,
) -> Result<Vec<EventId>, StoreError> {
    let mut stmt = conn.prepare(
        "DELETE FROM records WHERE id IN (
            SELECT id FROM records
            WHERE identity = ?1 AND category = ?2
            ORDER BY created_at DESC, id ASC
            LIMIT -1 OFFSET ?3
         )
         RETURNING id",
    )?;
    let rows = stmt.query_map(
        params![
            bucket.identity.as_bytes().as_slice(),
            bucket.category.0,
            i64::from(retention_per_bucket)
        ],
        |row| row.get::<_, Vec<u8>>(0),
    )?;

    let mut evicted = Vec::new();
    for row in rows {
        evicted.push(EventId::from_slice(&row?)?);
    }
    evicted.sort_unstable();
    Ok(evicted)
}

fn current_schema_version(conn: &Connection) -> Result<i64, StoreError> {
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get::<_, i64>(0),
    )?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    let applied_at = OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StoreError::Migration(format!("failed to format RFC3339 timestamp: {err}")))?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )?;
    Ok(())
}
