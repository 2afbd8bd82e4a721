// Timestamped snapshots of raw upstream pages, kept for later inspection
use chrono::Local;
use refwatch_api::ReferralPage;
use std::path::{Path, PathBuf};

use crate::Result;

pub struct ResponseArchive {
    dir: PathBuf,
}

impl ResponseArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `page` as `<YYMMDDHHMM>_referrals.json`.
    /// A page archived in the same minute overwrites the earlier one.
    pub fn write(&self, page: &ReferralPage) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;

        let name = format!("{}_referrals.json", Local::now().format("%y%m%d%H%M"));
        let path = self.dir.join(name);
        let contents = serde_json::to_string_pretty(page)?;
        std::fs::write(&path, contents)?;

        Ok(path)
    }
}
