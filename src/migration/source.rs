//! Migration asset sources
//!
//! A [`Source`] enumerates migration asset names and returns their bodies.
//! Assets are usually embedded into the deploying binary by its build; the
//! [`DirSource`] implementation reads them from a directory instead, which
//! is what the CLI uses.

use crate::migration::MigrationError;
use std::fs;
use std::path::{Path, PathBuf};

/// Provider of migration assets
///
/// `asset_names` yields unordered asset identifiers; `asset` returns the
/// body for one of them. A missing asset during execution is a fatal
/// error.
pub trait Source {
    fn asset_names(&self) -> Result<Vec<String>, MigrationError>;

    fn asset(&self, name: &str) -> Result<Vec<u8>, MigrationError>;
}

/// Filesystem-backed source reading assets from a single directory
pub struct DirSource {
    dir: PathBuf,
}

impl DirSource {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl Source for DirSource {
    fn asset_names(&self) -> Result<Vec<String>, MigrationError> {
        if !self.dir.is_dir() {
            return Err(MigrationError::MissingAsset {
                name: self.dir.display().to_string(),
                detail: "not a migrations directory".to_string(),
            });
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| MigrationError::MissingAsset {
            name: self.dir.display().to_string(),
            detail: e.to_string(),
        })?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrationError::MissingAsset {
                name: self.dir.display().to_string(),
                detail: e.to_string(),
            })?;
            if !entry.path().is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }

        Ok(names)
    }

    fn asset(&self, name: &str) -> Result<Vec<u8>, MigrationError> {
        fs::read(self.dir.join(name)).map_err(|e| MigrationError::MissingAsset {
            name: name.to_string(),
            detail: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_dir_source_lists_and_reads_assets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("1000_initial_migration.up.sql"),
            b"CREATE TABLE some_table (id int);",
        )
        .unwrap();
        fs::write(dir.path().join("README.md"), b"not a migration").unwrap();

        let source = DirSource::new(dir.path());
        let mut names = source.asset_names().unwrap();
        names.sort();
        assert_eq!(names, vec!["1000_initial_migration.up.sql", "README.md"]);

        let body = source.asset("1000_initial_migration.up.sql").unwrap();
        assert!(body.starts_with(b"CREATE TABLE"));
    }

    #[test]
    fn test_dir_source_missing_asset_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = DirSource::new(dir.path());
        let err = source.asset("1000_initial_migration.up.sql").unwrap_err();
        assert!(matches!(err, MigrationError::MissingAsset { .. }));
    }

    #[test]
    fn test_dir_source_missing_directory_is_an_error() {
        let source = DirSource::new("/definitely/not/a/real/migrations/dir");
        assert!(source.asset_names().is_err());
    }
}
