//! Module sources
//!
//! A module source is a read-only collection of encoded units addressed by
//! fully qualified name. Unit `a.b.Box` lives at `a/b/Box.unit` in directory
//! and archive sources.

use rustc_hash::FxHashMap;
use sideload_bytecode::ModuleUnit;
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extension of encoded units
pub const UNIT_EXTENSION: &str = "unit";

/// Errors raised while reading a module source
#[derive(Debug, Error)]
pub enum SourceError {
    /// Failed to read from disk
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failed to read the archive
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    /// Name cannot be mapped to a path
    #[error("Invalid unit name: '{0}'")]
    InvalidName(String),
}

/// Read-only, addressable collection of encoded units
pub trait ModuleSource: Send + Sync {
    /// Raw bytes of the named unit, `None` when absent
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SourceError>;

    /// Names of all units in the source
    fn names(&self) -> Vec<String>;
}

/// Relative path of a unit inside a directory or archive
pub fn unit_path(name: &str) -> Result<PathBuf, SourceError> {
    let segments: Vec<&str> = name.split('.').collect();
    let valid = segments.iter().all(|segment| {
        !segment.is_empty()
            && segment.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '$')
    });
    if !valid {
        return Err(SourceError::InvalidName(name.to_string()));
    }

    let mut path: PathBuf = segments.iter().collect();
    path.set_extension(UNIT_EXTENSION);
    Ok(path)
}

/// Unit name for a relative path, `None` for anything that is not a unit
fn unit_name(path: &str) -> Option<String> {
    let stem = path.strip_suffix(".unit")?;
    let segments: Vec<&str> = stem.split(['/', '\\']).collect();
    if segments.iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(segments.join("."))
}

/// In-memory source
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    units: FxHashMap<String, Vec<u8>>,
}

impl MemorySource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add raw bytes under a name
    pub fn insert(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.units.insert(name.into(), bytes);
    }

    /// Encode a unit and add it under its own name
    pub fn add(&mut self, unit: &ModuleUnit) {
        self.insert(unit.name.clone(), unit.encode());
    }

    /// Builder form of [`MemorySource::add`]
    pub fn with(mut self, unit: &ModuleUnit) -> Self {
        self.add(unit);
        self
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Whether the source is empty
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl FromIterator<(String, Vec<u8>)> for MemorySource {
    fn from_iter<I: IntoIterator<Item = (String, Vec<u8>)>>(iter: I) -> Self {
        Self {
            units: iter.into_iter().collect(),
        }
    }
}

impl ModuleSource for MemorySource {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.units.get(name).cloned())
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.units.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Units stored as files under a root directory
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    /// Use `root` as the source directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn collect(&self, dir: &Path, names: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect(&path, names)?;
            } else if let Ok(relative) = path.strip_prefix(&self.root) {
                if let Some(name) = relative.to_str().and_then(unit_name) {
                    names.push(name);
                }
            }
        }
        Ok(())
    }
}

impl ModuleSource for DirectorySource {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        let path = self.root.join(unit_path(name)?);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names = Vec::new();
        if let Err(e) = self.collect(&self.root, &mut names) {
            tracing::warn!(root = %self.root.display(), error = %e, "failed to list module directory");
        }
        names.sort();
        names
    }
}

/// Units stored in a zip archive
///
/// The archive is read completely when opened, so later reads need no
/// coordination between threads.
#[derive(Debug, Clone, Default)]
pub struct ArchiveSource {
    entries: FxHashMap<String, Vec<u8>>,
}

impl ArchiveSource {
    /// Open an archive file
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        Self::from_reader(File::open(path)?)
    }

    /// Index an archive from any seekable reader
    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Self, SourceError> {
        let mut archive = zip::ZipArchive::new(reader)?;
        let mut entries = FxHashMap::default();

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            if file.is_dir() {
                continue;
            }
            let Some(name) = unit_name(file.name()) else {
                continue;
            };
            let mut bytes = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut bytes)?;
            entries.insert(name, bytes);
        }

        tracing::debug!(units = entries.len(), "indexed module archive");
        Ok(Self { entries })
    }

    /// Number of units
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive holds no units
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ModuleSource for ArchiveSource {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.entries.get(name).cloned())
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }
}
