//! Integer counters persisted as small text files.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::error::StatsError;
use crate::recorder::rotator::atomic_write;

/// An integer stored as decimal text in its own file.
///
/// A missing file reads as zero. Writes are atomic.
#[derive(Debug, Clone)]
pub struct PersistentInt {
    path: PathBuf,
}

impl PersistentInt {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Result<u32, StatsError> {
        match fs::read_to_string(&self.path) {
            Ok(text) => text.trim().parse().map_err(|e| {
                StatsError::io(
                    format!("parsing {}", self.path.display()),
                    std::io::Error::new(ErrorKind::InvalidData, e),
                )
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(StatsError::io(format!("reading {}", self.path.display()), e)),
        }
    }

    pub fn set(&self, value: u32) -> Result<(), StatsError> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        atomic_write(dir, &self.path, value.to_string().as_bytes())
    }

    /// Adds one and returns the new value.
    pub fn increment(&self) -> Result<u32, StatsError> {
        let value = self.get()?.saturating_add(1);
        self.set(value)?;
        Ok(value)
    }
}
