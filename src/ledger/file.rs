// Sync ledger backed by a text file
//
// One line per synced item: `<kind> <synced_at_ms> <id>`. Lines starting with
// '#' are comments. Recording appends a line; clearing rewrites the file
// atomically (tmp + rename).

use super::{SyncLedger, SyncRecord};
use crate::error::{Result, SyncError};
use crate::protocol::MediaKind;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub struct FileLedger {
    /// None for an in-memory ledger
    path: Option<PathBuf>,
    records: BTreeMap<String, SyncRecord>,
}

impl FileLedger {
    const FORMAT_VERSION: &'static str = "v1";

    /// Open or create the ledger at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let records = if path.exists() {
            Self::load_from_file(&path)?
        } else {
            BTreeMap::new()
        };
        tracing::debug!("Opened ledger {} ({} records)", path.display(), records.len());

        Ok(Self {
            path: Some(path),
            records,
        })
    }

    /// Ledger that forgets everything on drop
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn load_from_file(path: &Path) -> Result<BTreeMap<String, SyncRecord>> {
        let file = fs::File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = BTreeMap::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match Self::parse_line(line) {
                Some(record) => {
                    records.insert(record.id.clone(), record);
                }
                None => tracing::warn!(
                    "Skipping malformed ledger line {} in {}",
                    lineno + 1,
                    path.display()
                ),
            }
        }

        Ok(records)
    }

    fn parse_line(line: &str) -> Option<SyncRecord> {
        let mut parts = line.splitn(3, ' ');
        let kind = MediaKind::parse(parts.next()?)?;
        let ms: i64 = parts.next()?.parse().ok()?;
        let id = parts.next()?.trim();
        if id.is_empty() {
            return None;
        }
        Some(SyncRecord {
            id: id.to_string(),
            kind,
            synced_at: Utc.timestamp_millis_opt(ms).single()?,
        })
    }

    fn format_line(record: &SyncRecord) -> String {
        format!(
            "{} {} {}",
            record.kind.as_str(),
            record.synced_at.timestamp_millis(),
            record.id
        )
    }

    fn write_header(file: &mut fs::File) -> Result<()> {
        writeln!(file, "# mediasync ledger {}", Self::FORMAT_VERSION)?;
        writeln!(file, "# <kind> <synced_at_ms> <id>")?;
        Ok(())
    }

    fn append(path: &Path, record: &SyncRecord) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if file.metadata()?.len() == 0 {
            Self::write_header(&mut file)?;
        }
        writeln!(file, "{}", Self::format_line(record))?;
        Ok(())
    }

    /// Rewrite the whole file from memory (atomic)
    fn save_to_file(&self, path: &Path) -> Result<()> {
        let temp_file = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&temp_file)?;
            Self::write_header(&mut file)?;
            for record in self.records.values() {
                writeln!(file, "{}", Self::format_line(record))?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_file, path)?;
        Ok(())
    }
}

impl SyncLedger for FileLedger {
    fn is_synced(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    fn record_synced(&mut self, id: &str, kind: MediaKind) -> Result<()> {
        if id.is_empty() || id.contains(['\n', '\r']) {
            return Err(SyncError::Ledger(format!("invalid ledger id: {:?}", id)));
        }
        let record = SyncRecord {
            id: id.to_string(),
            kind,
            synced_at: Utc::now(),
        };
        if let Some(path) = &self.path {
            Self::append(path, &record).map_err(|e| {
                SyncError::Ledger(format!("cannot write {}: {}", path.display(), e))
            })?;
        }
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    fn all_synced(&self) -> Vec<SyncRecord> {
        self.records.values().cloned().collect()
    }

    fn clear(&mut self) -> Result<()> {
        self.records.clear();
        if let Some(path) = &self.path {
            self.save_to_file(path)?;
        }
        Ok(())
    }
}
