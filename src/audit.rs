//! Audit trail for state transitions applied without a direct human
//! request (delinquency sweeps) and for administrative overrides.
//!
//! Appends one JSON record per line to a timestamped session file.

use anyhow::Result;
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::types::{BidId, LotId, TxId};

/// Who triggered the audited transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditActor {
    Sweep,
    Admin,
}

/// A single audited transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub actor: AuditActor,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lot: Option<LotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<BidId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx: Option<TxId>,
    pub detail: String,
}

impl AuditRecord {
    pub fn new(actor: AuditActor, action: &str, detail: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            actor,
            action: action.to_string(),
            lot: None,
            bid: None,
            tx: None,
            detail: detail.to_string(),
        }
    }

    pub fn sweep(action: &str, detail: &str) -> Self {
        Self::new(AuditActor::Sweep, action, detail)
    }

    pub fn admin(action: &str, detail: &str) -> Self {
        Self::new(AuditActor::Admin, action, detail)
    }

    pub fn lot(mut self, lot: LotId) -> Self {
        self.lot = Some(lot);
        self
    }

    pub fn bid(mut self, bid: BidId) -> Self {
        self.bid = Some(bid);
        self
    }

    pub fn tx(mut self, tx: TxId) -> Self {
        self.tx = Some(tx);
        self
    }
}

/// Logger that appends audit records to a session file
pub struct AuditLog {
    writer: Mutex<BufWriter<std::fs::File>>,
    file_path: PathBuf,
}

impl AuditLog {
    /// Create a new log with a timestamped filename in the given directory.
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let filename = format!("audit_{}.json", timestamp);
        let file_path = dir.join(&filename);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            file_path,
        })
    }

    /// Append one record and flush.
    pub fn record(&self, record: AuditRecord) -> Result<()> {
        let json = serde_json::to_string(&record)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        writer.flush()?;
        Ok(())
    }

    pub fn file_path(&self) -> &PathBuf {
        &self.file_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path()).unwrap();

        log.record(AuditRecord::sweep("reassign", "promoted next bidder").lot(LotId(1)))
            .unwrap();
        log.record(AuditRecord::admin("force_confirm", "gateway approved").tx(TxId(9)))
            .unwrap();

        let contents = std::fs::read_to_string(log.file_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: AuditRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.actor, AuditActor::Sweep);
        assert_eq!(first.lot, Some(LotId(1)));
        assert_eq!(first.tx, None);

        let second: AuditRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.actor, AuditActor::Admin);
        assert_eq!(second.tx, Some(TxId(9)));
    }
}
