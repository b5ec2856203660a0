// =============================================================================
// Instance Storage — one JSON record per instance, atomic rename commit
// =============================================================================
//
// Layout: `<data_root>/strategies/<instance-id>.json`. Writes go to
// `<id>.json.tmp` first and are renamed into place; the rename is the
// commit, so a reader can never observe a partially-written record.
// =============================================================================

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::analytics::{LedgerEntry, Snapshot};
use crate::types::{InstanceStatus, StrategyKind};

/// Persisted form of a strategy instance. Addresses are base58 strings so
/// records stay readable and stable across SDK versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: StrategyKind,
    pub name: String,
    /// Executor-typed configuration, kept as raw JSON because the schema
    /// differs per kind. Validated against the executor schema at create.
    pub config: serde_json::Value,
    pub status: InstanceStatus,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<String>,
    /// Base58 addresses of the live on-chain position set.
    #[serde(default)]
    pub positions: Vec<String>,
    #[serde(default)]
    pub ledger: Vec<LedgerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_snapshot: Option<Snapshot>,
    /// Terminal reason code when status is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

/// Directory-backed instance store.
pub struct InstanceStorage {
    dir: PathBuf,
}

impl InstanceStorage {
    /// Open (and create if needed) the store under `<data_root>/strategies`.
    pub fn open(data_root: impl AsRef<Path>) -> Result<Self> {
        let dir = data_root.as_ref().join("strategies");
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create storage dir {}", dir.display()))?;
        info!(dir = %dir.display(), "instance storage opened");
        Ok(Self { dir })
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a record. Write to `<id>.json.tmp`, then rename — rename is
    /// the commit.
    pub fn save(&self, record: &InstanceRecord) -> Result<()> {
        let path = self.record_path(&record.id);
        let tmp = self.dir.join(format!("{}.json.tmp", record.id));

        let content = serde_json::to_string_pretty(record)
            .context("failed to serialise instance record")?;

        fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp record {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename tmp record to {}", path.display()))?;

        debug!(id = %record.id, status = %record.status, "instance record committed");
        Ok(())
    }

    pub fn load(&self, id: &str) -> Result<InstanceRecord> {
        let path = self.record_path(id);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read record {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse record {}", path.display()))
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.record_path(id);
        fs::remove_file(&path)
            .with_context(|| format!("failed to delete record {}", path.display()))?;
        info!(id, "instance record deleted");
        Ok(())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.record_path(id).is_file()
    }

    /// Load every record in the store. Unparseable files are skipped with a
    /// warning rather than failing boot.
    pub fn load_all(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("failed to list storage dir {}", self.dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".json"))
                .unwrap_or(false);
            if !is_record {
                continue;
            }

            match fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|c| serde_json::from_str::<InstanceRecord>(&c).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable instance record");
                }
            }
        }

        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}
