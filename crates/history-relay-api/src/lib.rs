use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use history_relay_core::{AdmitOutcome, Filter, Record, Rejection, RelayConfig};
use history_relay_store_sqlite::{
    BucketStats, IntegrityReport, QueryStream, SchemaStatus, SqliteStore, StoreError,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Parse a relay configuration from YAML (or JSON) text and validate it.
///
/// # Errors
/// Returns an error when the text does not describe a [`RelayConfig`] or the
/// resulting configuration is invalid.
pub fn config_from_yaml_str(raw: &str) -> Result<RelayConfig> {
    let config: RelayConfig =
        serde_yaml::from_str(raw).context("failed to parse relay configuration")?;
    config.validate().context("invalid relay configuration")?;
    Ok(config)
}

/// # Errors
/// Returns an error when the file cannot be read or does not hold a valid
/// configuration.
pub fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    config_from_yaml_str(&raw).with_context(|| format!("in config file {}", path.display()))
}

/// Path-based facade over the retention store.
///
/// Each call opens its own store and brings the schema up to date, so one
/// `HistoryRelayApi` can be shared freely across threads.
#[derive(Debug, Clone)]
pub struct HistoryRelayApi {
    db_path: PathBuf,
    config: RelayConfig,
}

impl HistoryRelayApi {
    /// # Errors
    /// Returns an error when `config` is invalid.
    pub fn new(db_path: PathBuf, config: RelayConfig) -> Result<Self> {
        config.validate().context("invalid relay configuration")?;
        Ok(Self { db_path, config })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    fn open_store(&self) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(&self.db_path, self.config.clone())
    }

    fn open_migrated(&self) -> Result<SqliteStore, StoreError> {
        let mut store = self.open_store()?;
        store.migrate()?;
        Ok(store)
    }

    /// Admit a record subject to the category allow-list, duplicate check and
    /// bucket retention.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for storage faults. Rejections are outcomes.
    pub fn decide_and_admit(&self, record: &Record) -> Result<AdmitOutcome, StoreError> {
        let mut store = self.open_migrated()?;
        store.decide_and_admit(record).inspect_err(|err| {
            tracing::warn!(id = %record.id, error = %err, "admission failed");
        })
    }

    /// Like [`Self::decide_and_admit`], for a record that still needs
    /// decoding. A record that fails to decode is rejected as invalid.
    ///
    /// # Errors
    /// Returns a [`StoreError`] for storage faults.
    pub fn decide_and_admit_json(&self, raw: &str) -> Result<AdmitOutcome, StoreError> {
        match Record::from_json(raw) {
            Ok(record) => self.decide_and_admit(&record),
            Err(err) => Ok(AdmitOutcome::Rejected(Rejection::Invalid(err.to_string()))),
        }
    }

    /// # Errors
    /// Returns a [`StoreError`] when the store cannot be opened or the scan
    /// cannot start.
    pub fn query(&self, filter: &Filter) -> Result<QueryStream, StoreError> {
        let store = self.open_migrated()?;
        store.query(filter).inspect_err(|err| {
            tracing::warn!(error = %err, "query failed to start");
        })
    }

    /// Inspect schema status without mutating data.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus, StoreError> {
        self.open_store()?.schema_status()
    }

    /// Apply pending migrations, or report the planned versions in dry-run
    /// mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult, StoreError> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity probe fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        self.open_migrated()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when bucket occupancy cannot be read.
    pub fn bucket_stats(&self) -> Result<Vec<BucketStats>, StoreError> {
        self.open_migrated()?.bucket_stats()
    }
}

#[cfg(test)]
mod tests {
    use history_relay_core::{Category, StopReason};

    use super::*;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("history-relay-api-{}.sqlite3", ulid::Ulid::new()))
    }

    fn cleanup(db_path: &Path) {
        for suffix in ["", "-wal", "-shm"] {
            let mut raw = db_path.as_os_str().to_owned();
            raw.push(suffix);
            let _ = fs::remove_file(PathBuf::from(raw));
        }
    }

    fn record_json(id_seed: &str, category: u16, created_at: i64) -> String {
        serde_json::json!({
            "id": id_seed.repeat(32),
            "identity": "aa".repeat(32),
            "category": category,
            "created_at": created_at,
            "tags": [["p", "bob"]],
            "content": "hello",
        })
        .to_string()
    }

    // Test IDs: TAPI-001
    #[test]
    fn api_admit_and_query_round_trip() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = HistoryRelayApi::new(db_path.clone(), RelayConfig::default())?;

        let outcome = api.decide_and_admit_json(&record_json("01", 3, 100))?;
        assert!(outcome.is_admitted());
        let again = api.decide_and_admit_json(&record_json("01", 3, 100))?;
        assert_eq!(again, AdmitOutcome::Rejected(Rejection::Duplicate));

        let mut stream = api.query(&Filter::from_json(r#"{"categories": [3, 5]}"#)?)?;
        let records = stream.by_ref().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].category, Category(3));
        assert_eq!(records[0].content, "hello");
        assert_eq!(stream.stats().stop_reason, Some(StopReason::Exhausted));

        let buckets = api.bucket_stats()?;
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].records, 1);

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-002
    #[test]
    fn api_rejects_malformed_records_as_invalid() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = HistoryRelayApi::new(db_path.clone(), RelayConfig::default())?;

        let outcome = api.decide_and_admit_json(r#"{"id": "abc"}"#)?;
        assert!(matches!(
            outcome,
            AdmitOutcome::Rejected(Rejection::Invalid(ref cause)) if !cause.is_empty()
        ));
        let wrong_key = api.decide_and_admit_json(&record_json("z", 0, 1))?;
        assert!(matches!(wrong_key, AdmitOutcome::Rejected(Rejection::Invalid(_))));
        assert!(api.bucket_stats()?.is_empty());

        cleanup(&db_path);
        Ok(())
    }

    // Test IDs: TAPI-003
    #[test]
    fn api_migrate_dry_run_reports_without_applying() -> Result<()> {
        let db_path = unique_temp_db_path();
        let api = HistoryRelayApi::new(db_path.clone(), RelayConfig::default())?;

        let planned = api.migrate(true)?;
        assert!(planned.dry_run);
        assert_eq!(planned.would_apply_versions, vec![1]);
        assert_eq!(api.schema_status()?.current_version, 0);

        let applied = api.migrate(false)?;
        assert_eq!(applied.after_version, Some(1));
        assert_eq!(applied.up_to_date, Some(true));
        assert!(api.integrity_check()?.quick_check_ok);

        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn yaml_config_overrides_defaults() -> Result<()> {
        let config = config_from_yaml_str(
            "accepted_categories: [0, 3, 10002]\nretention_per_bucket: 1\n",
        )?;
        assert!(config.accepts(Category(10002)));
        assert_eq!(config.retention_per_bucket, 1);
        assert_eq!(config.scan_cap, 2000);
        assert_eq!(config.result_cap, 500);

        assert!(config_from_yaml_str("scan_cap: 0\n").is_err());
        assert!(config_from_yaml_str("keep_at_most: 3\n").is_err());
        assert_eq!(config_from_yaml_str("{}")?, RelayConfig::default());
        Ok(())
    }

    #[test]
    fn config_file_retention_applies_to_admission() -> Result<()> {
        let db_path = unique_temp_db_path();
        let config_path = db_path.with_extension("yaml");
        fs::write(&config_path, "retention_per_bucket: 1\n")?;
        let api = HistoryRelayApi::new(db_path.clone(), load_config_file(&config_path)?)?;

        assert!(api.decide_and_admit_json(&record_json("01", 0, 100))?.is_admitted());
        let newer = api.decide_and_admit_json(&record_json("02", 0, 200))?;
        assert!(matches!(newer, AdmitOutcome::Admitted { ref evicted } if evicted.len() == 1));
        let older = api.decide_and_admit_json(&record_json("03", 0, 50))?;
        assert_eq!(older, AdmitOutcome::Rejected(Rejection::TooOld));

        let _ = fs::remove_file(&config_path);
        cleanup(&db_path);
        Ok(())
    }

    #[test]
    fn api_new_rejects_invalid_config() {
        let config = RelayConfig { scan_cap: 0, ..RelayConfig::default() };
        assert!(HistoryRelayApi::new(unique_temp_db_path(), config).is_err());
        assert!(load_config_file(Path::new("/nonexistent/history-relay.yaml")).is_err());
    }
}
