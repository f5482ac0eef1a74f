//! Relational sink for fully processed records.
//!
//! The final pipeline stage writes grant and patent records into a
//! relational store keyed by `(kind, agency, external_id)`. Writes are
//! upserts: an existing record with the same identity is replaced, so
//! re-processing a deposit converges instead of duplicating.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("sink lock poisoned")
}

/// The kinds of record the pipeline produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A research grant.
    Grant,
    /// A patent.
    Patent,
}

impl RecordKind {
    /// Lowercase label for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Patent => "patent",
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record destined for the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkRecord {
    /// Grant or patent.
    pub kind: RecordKind,
    /// Agency the record belongs to.
    pub agency: String,
    /// Identifier assigned upstream. Unique within `(kind, agency)`.
    pub external_id: String,
    /// The record's fields.
    pub payload: serde_json::Value,
    /// When this version of the record was produced.
    pub updated_at: DateTime<Utc>,
}

/// Outcome of one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    /// Records that did not exist before.
    pub inserted: usize,
    /// Records that replaced an existing version.
    pub updated: usize,
}

/// Store for fully processed records.
///
/// Identity is `(kind, agency, external_id)`. Conflicting writes
/// resolve last write wins; implementations that cannot do so return
/// [`Error::SinkConflict`].
#[async_trait]
pub trait RelationalSink: Send + Sync + 'static {
    /// Writes a batch, replacing records that share an identity.
    async fn upsert(&self, records: Vec<SinkRecord>) -> Result<UpsertSummary>;

    /// Fetches one record by identity.
    async fn get(
        &self,
        kind: RecordKind,
        agency: &str,
        external_id: &str,
    ) -> Result<Option<SinkRecord>>;

    /// Number of stored records of a kind.
    async fn count(&self, kind: RecordKind) -> Result<usize>;
}

type RecordIdentity = (RecordKind, String, String);

/// In-memory sink for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: RwLock<HashMap<RecordIdentity, SinkRecord>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelationalSink for MemorySink {
    async fn upsert(&self, records: Vec<SinkRecord>) -> Result<UpsertSummary> {
        let mut store = self.records.write().map_err(poison_err)?;
        let mut summary = UpsertSummary::default();
        for record in records {
            let identity = (
                record.kind,
                record.agency.clone(),
                record.external_id.clone(),
            );
            if store.insert(identity, record).is_some() {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }
        }
        Ok(summary)
    }

    async fn get(
        &self,
        kind: RecordKind,
        agency: &str,
        external_id: &str,
    ) -> Result<Option<SinkRecord>> {
        let store = self.records.read().map_err(poison_err)?;
        Ok(store
            .get(&(kind, agency.to_string(), external_id.to_string()))
            .cloned())
    }

    async fn count(&self, kind: RecordKind) -> Result<usize> {
        let store = self.records.read().map_err(poison_err)?;
        Ok(store.keys().filter(|(k, _, _)| *k == kind).count())
    }
}

/// Parses an ids-assigned deposit into sink records.
///
/// Deposits at the ids-assigned stage are comma-delimited with a
/// header row. The first column holds the assigned external id; the
/// clean stage has already normalized quoting, so a plain split
/// suffices here. Each data row becomes one record whose payload maps
/// header names to cell values.
pub fn records_from_deposit(
    kind: RecordKind,
    agency: &str,
    bytes: &[u8],
) -> Result<Vec<SinkRecord>> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::serialization(format!("deposit is not valid UTF-8: {e}")))?;

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<&str> = match lines.next() {
        Some(line) => line.split(',').map(str::trim).collect(),
        None => return Ok(Vec::new()),
    };
    if header.is_empty() || header[0].is_empty() {
        return Err(Error::serialization(
            "deposit header row has no id column".to_string(),
        ));
    }

    let now = Utc::now();
    let mut records = Vec::new();
    for (row_index, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let external_id = cells.first().copied().unwrap_or_default();
        if external_id.is_empty() {
            return Err(Error::serialization(format!(
                "deposit row {} has an empty id column",
                row_index + 2
            )));
        }
        let mut payload = serde_json::Map::new();
        for (column, cell) in header.iter().zip(cells.iter()) {
            payload.insert(
                (*column).to_string(),
                serde_json::Value::String((*cell).to_string()),
            );
        }
        records.push(SinkRecord {
            kind,
            agency: agency.to_string(),
            external_id: external_id.to_string(),
            payload: serde_json::Value::Object(payload),
            updated_at: now,
        });
    }
    Ok(records)
}
