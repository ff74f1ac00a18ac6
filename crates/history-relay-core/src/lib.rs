use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Length in bytes of record identifiers and identity keys.
pub const KEY_LEN: usize = 32;

pub const DEFAULT_ACCEPTED_CATEGORIES: [u16; 2] = [0, 3];
pub const DEFAULT_RETENTION_PER_BUCKET: u32 = 10;
pub const DEFAULT_SCAN_CAP: usize = 2000;
pub const DEFAULT_RESULT_CAP: usize = 500;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum KernelError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("encode error: {0}")]
    Encode(String),
}

fn decode_key(label: &str, raw: &str) -> Result<[u8; KEY_LEN], KernelError> {
    if raw.len() != KEY_LEN * 2 {
        return Err(KernelError::Validation(format!(
            "{label} MUST be {} hex characters, got {}",
            KEY_LEN * 2,
            raw.len()
        )));
    }
    let mut bytes = [0_u8; KEY_LEN];
    hex::decode_to_slice(raw, &mut bytes)
        .map_err(|err| KernelError::Validation(format!("{label} is not valid hex: {err}")))?;
    Ok(bytes)
}

fn key_from_slice(label: &str, raw: &[u8]) -> Result<[u8; KEY_LEN], KernelError> {
    <[u8; KEY_LEN]>::try_from(raw).map_err(|_| {
        KernelError::Validation(format!("{label} MUST be {KEY_LEN} bytes, got {}", raw.len()))
    })
}

macro_rules! opaque_key {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(pub [u8; KEY_LEN]);

        impl $name {
            /// Build from raw bytes as stored in the index.
            ///
            /// # Errors
            /// Returns [`KernelError::Validation`] when `raw` is not exactly
            /// [`KEY_LEN`] bytes long.
            pub fn from_slice(raw: &[u8]) -> Result<Self, KernelError> {
                key_from_slice($label, raw).map(Self)
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
                &self.0
            }

            #[must_use]
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl FromStr for $name {
            type Err = KernelError;

            fn from_str(raw: &str) -> Result<Self, Self::Err> {
                decode_key($label, raw).map(Self)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = String::deserialize(deserializer)?;
                raw.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

opaque_key!(
    /// Globally unique record identifier. Ordered by raw bytes.
    EventId,
    "id"
);

opaque_key!(
    /// Opaque key of the originator of a record.
    Identity,
    "identity"
);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct Category(pub u16);

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The unit of retention bounding: every stored record sharing one
/// `(identity, category)` pair.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Bucket {
    pub identity: Identity,
    pub category: Category,
}

impl Display for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.identity, self.category)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Record {
    pub id: EventId,
    pub identity: Identity,
    pub category: Category,
    pub created_at: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    #[serde(default)]
    pub content: String,
}

impl Record {
    /// Decode a candidate record submitted by a collaborator.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the document is malformed or an
    /// identifier/identity is not a 32-byte hex string.
    pub fn from_json(raw: &str) -> Result<Self, KernelError> {
        serde_json::from_str(raw)
            .map_err(|err| KernelError::Validation(format!("malformed record: {err}")))
    }

    /// Decode a payload previously written by [`Record::to_payload`].
    ///
    /// # Errors
    /// Returns [`KernelError::Decode`] when the stored payload cannot be parsed.
    pub fn decode_payload(raw: &str) -> Result<Self, KernelError> {
        serde_json::from_str(raw).map_err(|err| KernelError::Decode(err.to_string()))
    }

    /// Serialize the full record as it is persisted in the index.
    ///
    /// # Errors
    /// Returns [`KernelError::Encode`] when serialization fails.
    pub fn to_payload(&self) -> Result<String, KernelError> {
        serde_json::to_string(self).map_err(|err| KernelError::Encode(err.to_string()))
    }

    #[must_use]
    pub fn bucket(&self) -> Bucket {
        Bucket { identity: self.identity, category: self.category }
    }

    #[must_use]
    pub fn recency_key(&self) -> RecencyKey {
        RecencyKey { created_at: self.created_at, id: self.id }
    }

    /// Values of every tag named `name` (the second element of each tag).
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags.iter().filter_map(move |tag| match tag.as_slice() {
            [tag_name, value, ..] if tag_name == name => Some(value.as_str()),
            _ => None,
        })
    }
}

/// Position of a record inside its bucket.
///
/// Ascending order of `RecencyKey` is rank order: `created_at` descending,
/// ties broken by `id` ascending. Rank 0 is the most recent record and rank
/// `N-1` is the retention boundary.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct RecencyKey {
    pub created_at: i64,
    pub id: EventId,
}

impl RecencyKey {
    #[must_use]
    pub fn ranks_before(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Less
    }
}

impl Ord for RecencyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other.created_at.cmp(&self.created_at).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for RecencyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Whether a candidate would enter a bucket whose record at rank `N-1` is
/// `boundary` (`None` when the bucket holds fewer than `N` records).
///
/// A retention of zero admits nothing.
#[must_use]
pub fn beats_boundary(
    candidate: &RecencyKey,
    boundary: Option<&RecencyKey>,
    retention_per_bucket: u32,
) -> bool {
    if retention_per_bucket == 0 {
        return false;
    }
    boundary.map_or(true, |boundary| candidate.ranks_before(boundary))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RelayConfig {
    pub accepted_categories: BTreeSet<Category>,
    pub retention_per_bucket: u32,
    pub scan_cap: usize,
    pub result_cap: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            accepted_categories: DEFAULT_ACCEPTED_CATEGORIES.into_iter().map(Category).collect(),
            retention_per_bucket: DEFAULT_RETENTION_PER_BUCKET,
            scan_cap: DEFAULT_SCAN_CAP,
            result_cap: DEFAULT_RESULT_CAP,
        }
    }
}

impl RelayConfig {
    /// Check that the query caps can make progress.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when either cap is zero.
    pub fn validate(&self) -> Result<(), KernelError> {
        if self.scan_cap == 0 {
            return Err(KernelError::Validation("scan_cap MUST be >= 1".to_string()));
        }
        if self.result_cap == 0 {
            return Err(KernelError::Validation("result_cap MUST be >= 1".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn accepts(&self, category: Category) -> bool {
        self.accepted_categories.contains(&category)
    }

    /// The record at this zero-based rank is the retention boundary.
    #[must_use]
    pub fn boundary_rank(&self) -> Option<u32> {
        self.retention_per_bucket.checked_sub(1)
    }
}

/// Why an admission did not store the record. These are expected outcomes,
/// not faults.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(tag = "reason", content = "cause", rename_all = "snake_case")]
pub enum Rejection {
    CategoryNotAccepted,
    Duplicate,
    TooOld,
    Invalid(String),
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CategoryNotAccepted => f.write_str("category not accepted"),
            Self::Duplicate => f.write_str("duplicate"),
            Self::TooOld => f.write_str("too old"),
            Self::Invalid(cause) => write!(f, "invalid: {cause}"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Decision {
    Accept,
    Reject(Rejection),
}

#[derive(Debug, Clone, Serialize, Eq, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdmitOutcome {
    Admitted { evicted: Vec<EventId> },
    Rejected(Rejection),
}

impl AdmitOutcome {
    #[must_use]
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted { .. })
    }

    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(rejection) => Some(rejection),
            Self::Admitted { .. } => None,
        }
    }
}

/// Stateless half of the admission policy: the category allow-list.
///
/// The duplicate probe needs the index and lives with the store.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdmissionPolicy {
    accepted_categories: BTreeSet<Category>,
}

impl AdmissionPolicy {
    #[must_use]
    pub fn new(config: &RelayConfig) -> Self {
        Self { accepted_categories: config.accepted_categories.clone() }
    }

    #[must_use]
    pub fn check_category(&self, record: &Record) -> Decision {
        if self.accepted_categories.contains(&record.category) {
            Decision::Accept
        } else {
            Decision::Reject(Rejection::CategoryNotAccepted)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<Category>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub identities: Vec<Identity>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<EventId>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Filter {
    /// Decode a filter document.
    ///
    /// # Errors
    /// Returns [`KernelError::Validation`] when the document is malformed.
    pub fn from_json(raw: &str) -> Result<Self, KernelError> {
        serde_json::from_str(raw)
            .map_err(|err| KernelError::Validation(format!("malformed filter: {err}")))
    }

    /// Exact filter semantics against a decoded record. Empty lists and unset
    /// bounds do not constrain; present fields are combined with AND.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        if self.since.is_some_and(|since| record.created_at <= since) {
            return false;
        }
        if self.until.is_some_and(|until| record.created_at >= until) {
            return false;
        }
        if !self.categories.is_empty() && !self.categories.contains(&record.category) {
            return false;
        }
        if !self.identities.is_empty() && !self.identities.contains(&record.identity) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&record.id) {
            return false;
        }

        self.tags.iter().filter(|(_, values)| !values.is_empty()).all(|(name, values)| {
            record.tag_values(name).any(|value| values.iter().any(|wanted| wanted == value))
        })
    }

    /// Resolve the filter against the relay configuration.
    ///
    /// Requested categories outside the allow-list are dropped without error.
    /// When every requested category is dropped, the plan matches nothing.
    #[must_use]
    pub fn plan(&self, config: &RelayConfig) -> QueryPlan {
        let mut filter = self.clone();
        let mut matches_nothing = false;

        if !self.categories.is_empty() {
            let mut accepted = self
                .categories
                .iter()
                .copied()
                .filter(|category| config.accepts(*category))
                .collect::<Vec<_>>();
            accepted.sort_unstable();
            accepted.dedup();
            matches_nothing = accepted.is_empty();
            filter.categories = accepted;
        }

        let result_cap = match self.limit {
            Some(limit) if limit > 0 => limit.min(config.result_cap),
            _ => config.result_cap,
        };

        QueryPlan { filter, scan_cap: config.scan_cap, result_cap, matches_nothing }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct QueryPlan {
    pub filter: Filter,
    pub scan_cap: usize,
    pub result_cap: usize,
    pub matches_nothing: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    ScanCap,
    ResultCap,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScanStats {
    pub scanned: usize,
    pub yielded: usize,
    pub undecodable: usize,
    pub stop_reason: Option<StopReason>,
}

/// What happened to one row offered to a [`CappedScan`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ScanStep {
    Matched(Record),
    Filtered,
    Undecodable(KernelError),
}

/// Cap accounting for one query.
///
/// Every offered row counts against the scan cap; only rows that decode and
/// pass exact matching count against the result cap.
#[derive(Debug, Clone)]
pub struct CappedScan {
    plan: QueryPlan,
    stats: ScanStats,
}

impl CappedScan {
    #[must_use]
    pub fn new(plan: QueryPlan) -> Self {
        Self { plan, stats: ScanStats::default() }
    }

    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    /// Checked before reading each row from storage.
    #[must_use]
    pub fn limit_reached(&self) -> Option<StopReason> {
        if self.stats.yielded >= self.plan.result_cap {
            Some(StopReason::ResultCap)
        } else if self.stats.scanned >= self.plan.scan_cap {
            Some(StopReason::ScanCap)
        } else {
            None
        }
    }

    pub fn offer(&mut self, payload: &str) -> ScanStep {
        self.stats.scanned += 1;
        let record = match Record::decode_payload(payload) {
            Ok(record) => record,
            Err(err) => {
                self.stats.undecodable += 1;
                return ScanStep::Undecodable(err);
            }
        };
        if !self.plan.filter.matches(&record) {
            return ScanStep::Filtered;
        }
        self.stats.yielded += 1;
        ScanStep::Matched(record)
    }

    /// Count a row whose payload could not even be read as text.
    pub fn offer_unreadable(&mut self, err: KernelError) -> ScanStep {
        self.stats.scanned += 1;
        self.stats.undecodable += 1;
        ScanStep::Undecodable(err)
    }

    pub fn finish(&mut self, reason: StopReason) -> ScanStats {
        self.stats.stop_reason = Some(reason);
        self.stats
    }

    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.stats
    }
}
