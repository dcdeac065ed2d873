use crate::MetaError;
use crate::Result;
use crate::model::JobId;
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorgMode {
    /// Scan row keys and write index entries.
    Backfill,
    /// Scan index keys and remove them.
    Delete,
}

impl ReorgMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ReorgMode::Backfill => "backfill",
            ReorgMode::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "backfill" => Ok(Self::Backfill),
            "delete" => Ok(Self::Delete),
            _ => Err(MetaError::InvalidValue {
                what: "reorg mode",
                value: value.to_string(),
            }),
        }
    }
}

/// Resumable progress of one reorg element over `[start_key, end_key)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorgCheckpoint {
    pub job_id: JobId,
    /// Index being built or removed.
    pub element_id: i64,
    pub mode: ReorgMode,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    /// First key not yet processed.
    pub next_key: Vec<u8>,
    pub batch_size: i64,
    pub processed_rows: i64,
}

impl ReorgCheckpoint {
    pub fn is_complete(&self) -> bool {
        self.next_key >= self.end_key
    }

    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        let mode: String = row.try_get("mode")?;
        Ok(Self {
            job_id: row.try_get("job_id")?,
            element_id: row.try_get("element_id")?,
            mode: ReorgMode::parse(mode.as_str())?,
            start_key: row.try_get("start_key")?,
            end_key: row.try_get("end_key")?,
            next_key: row.try_get("next_key")?,
            batch_size: row.try_get("batch_size")?,
            processed_rows: row.try_get("processed_rows")?,
        })
    }
}

/// Physical key range queued for cleanup after a drop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRange {
    pub job_id: JobId,
    pub element_id: i64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
}

impl DeleteRange {
    pub(crate) fn try_from_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            job_id: row.try_get("job_id")?,
            element_id: row.try_get("element_id")?,
            start_key: row.try_get("start_key")?,
            end_key: row.try_get("end_key")?,
        })
    }
}
