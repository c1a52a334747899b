use std::path::{Path, PathBuf};

use crate::eid::Eid;

pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    /// Names of the files directly under `dir`, hidden ones excluded.
    /// A missing directory lists as empty.
    fn list(&self, dir: &str) -> std::io::Result<Vec<String>>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    fn list(&self, dir: &str) -> std::io::Result<Vec<String>> {
        let entries = match std::fs::read_dir(self.path_of(dir)) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(err) => return Err(err),
        };

        let mut names = vec![];
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with('.') {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Writes through a hidden temp file next to the target and renames it
    /// into place, so readers never see a partially written file.
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        let (Some(dir), Some(file_name)) = (path.parent(), path.file_name()) else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid storage ident: {ident}"),
            ));
        };
        std::fs::create_dir_all(dir)?;

        let temp_path = dir.join(format!(".{}-{}", Eid::new(), file_name.to_string_lossy()));

        if let Err(err) = std::fs::write(&temp_path, data) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(err);
        }

        std::fs::rename(&temp_path, path)
    }
}
