//! CSV flat file accumulation, deduplicated on the record's natural key.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use apod_core::{PipelineError, Record, Result, RECORD_COLUMNS};
use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum KeepPolicy {
    First,
    /// Most recently merged row wins and takes the position of its last occurrence.
    #[default]
    Last,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    pub path: PathBuf,
    pub rows: usize,
    pub created: bool,
    pub replaced_existing_key: bool,
    pub byte_size: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FlatFileMerger {
    policy: KeepPolicy,
}

impl FlatFileMerger {
    pub fn new(policy: KeepPolicy) -> Self {
        Self { policy }
    }

    pub async fn merge(&self, path: &Path, record: &Record) -> Result<MergeReport> {
        info!(
            path = %path.display(),
            date = %record.natural_key(),
            policy = ?self.policy,
            "merging record into flat file"
        );

        let existing = Self::read_records(path).await?;
        let created = existing.is_none();
        let mut rows = existing.unwrap_or_default();
        let replaced_existing_key = rows.iter().any(|row| row.date == record.date);
        rows.push(record.clone());

        let rows = dedup_by_key(rows, self.policy);
        let bytes = encode_records(path, &rows)?;
        write_atomic(path, &bytes).await?;

        let report = MergeReport {
            path: path.to_path_buf(),
            rows: rows.len(),
            created,
            replaced_existing_key,
            byte_size: bytes.len(),
        };
        info!(
            path = %report.path.display(),
            rows = report.rows,
            created = report.created,
            replaced_existing_key = report.replaced_existing_key,
            bytes = report.byte_size,
            "flat file merge complete"
        );
        Ok(report)
    }

    pub async fn read_records(path: &Path) -> Result<Option<Vec<Record>>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(PipelineError::io(path, err)),
        };
        decode_records(path, &bytes).map(Some)
    }
}

/// Drop rows sharing a natural key, keeping one per key according to `policy`.
pub fn dedup_by_key(rows: Vec<Record>, policy: KeepPolicy) -> Vec<Record> {
    let mut winner: HashMap<_, usize> = HashMap::with_capacity(rows.len());
    for (idx, row) in rows.iter().enumerate() {
        match policy {
            KeepPolicy::First => {
                winner.entry(row.date).or_insert(idx);
            }
            KeepPolicy::Last => {
                winner.insert(row.date, idx);
            }
        }
    }

    rows.into_iter()
        .enumerate()
        .filter(|(idx, row)| winner.get(&row.date) == Some(idx))
        .map(|(_, row)| row)
        .collect()
}

fn encode_records(path: &Path, rows: &[Record]) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    for row in rows {
        writer
            .serialize(row)
            .map_err(|err| PipelineError::io(path, err.into()))?;
    }
    writer
        .into_inner()
        .map_err(|err| PipelineError::io(path, err.into_error()))
}

fn decode_records(path: &Path, bytes: &[u8]) -> Result<Vec<Record>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| PipelineError::io(path, err.into()))?
        .clone();

    let found: BTreeSet<&str> = headers.iter().collect();
    let expected: BTreeSet<&str> = RECORD_COLUMNS.iter().copied().collect();
    if found != expected || headers.len() != RECORD_COLUMNS.len() {
        return Err(PipelineError::SchemaMismatch {
            path: path.to_path_buf(),
            expected: RECORD_COLUMNS.join(","),
            found: headers.iter().collect::<Vec<_>>().join(","),
        });
    }

    reader
        .deserialize::<Record>()
        .map(|row| row.map_err(|err| PipelineError::io(path, err.into())))
        .collect()
}
