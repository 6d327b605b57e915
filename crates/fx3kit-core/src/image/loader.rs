//! Firmware resource lookup.

use std::collections::HashMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::BringupError;

/// Environment variable naming an extra firmware directory.
pub const FIRMWARE_DIR_ENV: &str = "FX3KIT_FIRMWARE_DIR";

/// System firmware directories, searched last.
pub const SYSTEM_FIRMWARE_DIRS: &[&str] = &[
    "/usr/local/share/sigrok-firmware",
    "/usr/share/sigrok-firmware",
];

/// Supplies raw firmware bytes by resource name.
pub trait FirmwareLoader {
    /// Load `name`, refusing anything larger than `max_size` bytes.
    fn load(&self, name: &str, max_size: usize) -> Result<Vec<u8>, BringupError>;
}

/// Loads firmware files from an ordered list of directories.
#[derive(Debug, Clone, Default)]
pub struct FirmwareDirs {
    dirs: Vec<PathBuf>,
}

impl FirmwareDirs {
    /// Search exactly the given directories.
    pub fn new<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            dirs: dirs.into_iter().map(Into::into).collect(),
        }
    }

    /// Search `extra`, then `$FX3KIT_FIRMWARE_DIR`, then the system directories.
    pub fn with_defaults<P: AsRef<Path>>(extra: &[P]) -> Self {
        let mut dirs: Vec<PathBuf> = extra.iter().map(|p| p.as_ref().to_path_buf()).collect();
        if let Some(dir) = env::var_os(FIRMWARE_DIR_ENV) {
            dirs.push(PathBuf::from(dir));
        }
        dirs.extend(SYSTEM_FIRMWARE_DIRS.iter().map(PathBuf::from));
        Self { dirs }
    }

    pub fn dirs(&self) -> &[PathBuf] {
        &self.dirs
    }

    /// First existing file called `name`.
    pub fn locate(&self, name: &str) -> Option<PathBuf> {
        self.dirs
            .iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

impl FirmwareLoader for FirmwareDirs {
    fn load(&self, name: &str, max_size: usize) -> Result<Vec<u8>, BringupError> {
        let path = self.locate(name).ok_or_else(|| BringupError::ResourceNotFound {
            name: name.to_string(),
        })?;

        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        if size > max_size as u64 {
            return Err(BringupError::ResourceTooLarge {
                name: name.to_string(),
                size,
                max: max_size,
            });
        }

        // The file may grow between stat and read; never read past the limit.
        let mut data = Vec::with_capacity(size as usize);
        file.take(max_size as u64 + 1).read_to_end(&mut data)?;
        if data.len() > max_size {
            return Err(BringupError::ResourceTooLarge {
                name: name.to_string(),
                size: data.len() as u64,
                max: max_size,
            });
        }

        info!(path = %path.display(), size = data.len(), "Loaded firmware");
        Ok(data)
    }
}

/// In-memory firmware store.
#[derive(Debug, Clone, Default)]
pub struct MemoryLoader {
    images: HashMap<String, Vec<u8>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, data: Vec<u8>) {
        self.images.insert(name.into(), data);
    }

    pub fn with_image(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.insert(name, data);
        self
    }
}

impl FirmwareLoader for MemoryLoader {
    fn load(&self, name: &str, max_size: usize) -> Result<Vec<u8>, BringupError> {
        let data = self
            .images
            .get(name)
            .ok_or_else(|| BringupError::ResourceNotFound {
                name: name.to_string(),
            })?;
        if data.len() > max_size {
            return Err(BringupError::ResourceTooLarge {
                name: name.to_string(),
                size: data.len() as u64,
                max: max_size,
            });
        }
        debug!(name, size = data.len(), "Loaded firmware from memory");
        Ok(data.clone())
    }
}
