//! Preset persistence boundary. The core only moves opaque byte buffers;
//! what they contain is the command layer's business.

use std::path::PathBuf;

use log::debug;
use midi_hub_core::{HubError, HubResult};

pub trait PresetStore: Send + Sync {
    fn save(&self, id: &str, bytes: &[u8]) -> HubResult<()>;
    fn load(&self, id: &str) -> HubResult<Vec<u8>>;
    fn list(&self) -> HubResult<Vec<String>>;
    fn remove(&self, id: &str) -> HubResult<()>;
}

/// One file per preset under a base directory.
pub struct FilePresetStore {
    dir: PathBuf,
}

impl FilePresetStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> HubResult<PathBuf> {
        // Preset IDs are opaque but must stay inside the store directory.
        if id.is_empty() || id.contains(['/', '\\']) || id.contains("..") {
            return Err(HubError::MalformedPayload(format!("preset id '{id}'")));
        }
        Ok(self.dir.join(format!("{id}.preset")))
    }
}

impl PresetStore for FilePresetStore {
    fn save(&self, id: &str, bytes: &[u8]) -> HubResult<()> {
        let path = self.path_for(id)?;
        std::fs::create_dir_all(&self.dir)?;
        debug!("saving preset {id} ({} bytes)", bytes.len());
        std::fs::write(path, bytes)?;
        Ok(())
    }

    fn load(&self, id: &str) -> HubResult<Vec<u8>> {
        let path = self.path_for(id)?;
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HubError::NotFound {
                entity: "preset",
                id: id.to_string(),
            }),
            Err(e) => Err(HubError::Io(e)),
        }
    }

    fn list(&self) -> HubResult<Vec<String>> {
        let mut ids = Vec::new();
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(HubError::Io(e)),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if let Some(id) = name.to_string_lossy().strip_suffix(".preset") {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn remove(&self, id: &str) -> HubResult<()> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HubError::NotFound {
                entity: "preset",
                id: id.to_string(),
            }),
            Err(e) => Err(HubError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_list_remove() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePresetStore::new(dir.path());

        store.save("warm-pad", b"opaque bytes").unwrap();
        store.save("brass", b"more bytes").unwrap();
        assert_eq!(store.load("warm-pad").unwrap(), b"opaque bytes".to_vec());
        assert_eq!(store.list().unwrap(), vec!["brass", "warm-pad"]);

        store.remove("brass").unwrap();
        assert!(matches!(
            store.load("brass"),
            Err(HubError::NotFound { .. })
        ));
    }

    #[test]
    fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilePresetStore::new(dir.path());
        assert!(store.save("../evil", b"x").is_err());
        assert!(store.save("a/b", b"x").is_err());
        assert!(store.save("", b"x").is_err());
    }
}
