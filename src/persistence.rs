// Copyright (c) 2026 Pegasus Heavy Industries LLC
// Licensed under the MIT License

//! Persisted fan characterization.
//!
//! One JSON blob per fan id under the configured db directory, holding
//! the PWM -> RPM-window snapshot taken after characterization. Loading
//! anything unreadable degrades to "absent" so the controller simply
//! characterizes again; only the round-trip of keys and values is
//! contractual.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// PWM -> RPM samples (latest window contents).
pub type FanCurveSnapshot = BTreeMap<u8, Vec<f64>>;

pub struct Persistence {
    root: PathBuf,
}

impl Persistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Persist a fan's characterization snapshot atomically.
    pub fn save(&self, fan_id: &str, data: &FanCurveSnapshot) -> Result<()> {
        fs::create_dir_all(&self.root)
            .map_err(|e| Error::persistence(format!("cannot create {}: {e}", self.root.display())))?;

        let path = self.blob_path(fan_id);
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| Error::persistence(format!("cannot encode {fan_id}: {e}")))?;

        // write to a temp file, then rename over the old blob
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| Error::persistence(format!("cannot create {}: {e}", tmp.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| Error::persistence(format!("cannot write {}: {e}", tmp.display())))?;
        file.sync_all()
            .map_err(|e| Error::persistence(format!("cannot sync {}: {e}", tmp.display())))?;
        drop(file);
        fs::rename(&tmp, &path)
            .map_err(|e| Error::persistence(format!("cannot rename {}: {e}", path.display())))?;

        log::debug!("Saved characterization for fan {fan_id} to {}", path.display());
        Ok(())
    }

    /// Load a fan's snapshot. Missing or corrupt blobs come back as
    /// `None` and trigger re-characterization.
    pub fn load(&self, fan_id: &str) -> Option<FanCurveSnapshot> {
        let path = self.blob_path(fan_id);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!(
                    "Discarding corrupt characterization blob {}: {e}",
                    path.display()
                );
                None
            }
        }
    }

    fn blob_path(&self, fan_id: &str) -> PathBuf {
        // fan ids come from user config; keep them from escaping the db dir
        let safe: String = fan_id
            .chars()
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        self.root.join(format!("{safe}.json"))
    }
}
