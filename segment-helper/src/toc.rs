//! Per-segment table of contents: `oid -> [startbyte, endbyte)` into the
//! logical data stream of one segment.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use crate::utils::errors::{HelperError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDataEntry {
    pub startbyte: u64,
    pub endbyte: u64,
}

impl SegmentDataEntry {
    pub fn len(&self) -> u64 {
        self.endbyte - self.startbyte
    }

    pub fn is_empty(&self) -> bool {
        self.endbyte == self.startbyte
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentToc {
    #[serde(default)]
    pub dataentries: BTreeMap<u32, SegmentDataEntry>,
}

impl SegmentToc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, oid: u32, startbyte: u64, endbyte: u64) -> Result<()> {
        if endbyte < startbyte {
            return Err(HelperError::Toc(format!(
                "oid {} ends at byte {} before it starts at byte {}",
                oid, endbyte, startbyte
            )));
        }
        if self.dataentries.contains_key(&oid) {
            return Err(HelperError::Toc(format!("oid {} recorded twice", oid)));
        }
        self.dataentries
            .insert(oid, SegmentDataEntry { startbyte, endbyte });
        Ok(())
    }

    pub fn entry(&self, oid: u32) -> Result<SegmentDataEntry> {
        self.dataentries
            .get(&oid)
            .copied()
            .ok_or_else(|| HelperError::Toc(format!("oid {} not found in segment TOC", oid)))
    }

    /// Total bytes covered by the TOC.
    #[cfg(test)]
    pub(crate) fn end_of_stream(&self) -> u64 {
        self.dataentries
            .values()
            .map(|e| e.endbyte)
            .max()
            .unwrap_or(0)
    }

    /// Entries sorted by start offset must not overlap.
    pub fn validate(&self) -> Result<()> {
        let mut entries: Vec<(u32, SegmentDataEntry)> =
            self.dataentries.iter().map(|(k, v)| (*k, *v)).collect();
        entries.sort_by_key(|(_, e)| (e.startbyte, e.endbyte));

        let mut previous: Option<(u32, SegmentDataEntry)> = None;
        for (oid, entry) in entries {
            if entry.endbyte < entry.startbyte {
                return Err(HelperError::Toc(format!(
                    "oid {} has a negative byte range",
                    oid
                )));
            }
            if let Some((prev_oid, prev)) = previous {
                if entry.startbyte < prev.endbyte {
                    return Err(HelperError::Toc(format!(
                        "byte ranges of oids {} and {} overlap",
                        prev_oid, oid
                    )));
                }
            }
            previous = Some((oid, entry));
        }
        Ok(())
    }

    pub fn read_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            HelperError::Toc(format!("Unable to read segment TOC {}: {}", path.display(), e))
        })?;
        let toc: SegmentToc = serde_yaml::from_str(&contents)?;
        toc.validate()?;
        Ok(toc)
    }

    /// Writes the TOC to a file that must not exist yet, then makes it read-only.
    pub fn write_to_file_and_make_read_only(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                HelperError::Toc(format!(
                    "Unable to create segment TOC {}: {}",
                    path.display(),
                    e
                ))
            })?;
        file.write_all(yaml.as_bytes())?;
        file.sync_all()?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o444))?;
        Ok(())
    }
}
