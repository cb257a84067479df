// SPDX-License-Identifier: MPL-2.0

//! Crash-safe file replacement: all writes go to a temporary companion
//! which atomically renames over the live file on close, so readers only
//! ever observe complete files.

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use crate::prelude::*;

pub struct SafeWriteFile {
    live: PathBuf,
    tmp: PathBuf,
    file: Option<File>,
}

impl SafeWriteFile {
    pub fn new(dir: &Path, name: &str, tmp_name: &str) -> Self {
        Self {
            live: dir.join(name),
            tmp: dir.join(tmp_name),
            file: None,
        }
    }

    pub fn live_path(&self) -> &Path {
        &self.live
    }

    /// Opens (truncating) the temporary companion.
    pub fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.tmp.parent() {
            fs::create_dir_all(parent)?;
        }
        self.file = Some(File::create(&self.tmp)?);
        Ok(())
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self.file.as_mut() {
            Some(file) => {
                file.write_all(data)?;
                Ok(())
            }
            None => return_errno_with_message!(Errno::EINVAL, "safe write file not open"),
        }
    }

    /// Syncs the temporary file and renames it over the live name.
    pub fn close(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return_errno_with_message!(Errno::EINVAL, "safe write file not open");
        };
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp, &self.live)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_publishes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SafeWriteFile::new(dir.path(), "field.redo", ".field.tmp");

        file.open().unwrap();
        file.write_all(b"hello").unwrap();
        // Not visible until closed.
        assert!(!file.live_path().exists());

        file.close().unwrap();
        assert_eq!(fs::read(file.live_path()).unwrap(), b"hello");
        assert!(!dir.path().join(".field.tmp").exists());

        // Reopening truncates the companion, not the live file.
        file.open().unwrap();
        file.write_all(b"x").unwrap();
        file.close().unwrap();
        assert_eq!(fs::read(file.live_path()).unwrap(), b"x");
    }

    #[test]
    fn write_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = SafeWriteFile::new(dir.path(), "a", ".a.tmp");
        assert!(file.write_all(b"nope").is_err());
        assert!(file.close().is_err());
    }
}
