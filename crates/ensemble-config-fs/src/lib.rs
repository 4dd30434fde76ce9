// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem `ConfigStore`: one `<key>.json` per key under the platform
//! config directory (or any directory the operator names).

use directories::ProjectDirs;
use ensemble_app_core::config::{ConfigError, ConfigStore};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// JSON files under a config directory.
///
/// Writes go to a sibling `.tmp` file first and are renamed into place, so a
/// crash mid-save leaves the previous settings intact.
#[derive(Debug)]
pub struct FsConfigStore {
    base: PathBuf,
}

impl FsConfigStore {
    /// Store under the user config dir (`~/.config/ensemble` on Linux).
    pub fn new() -> Result<Self, ConfigError> {
        let proj = ProjectDirs::from("dev", "flyingrobots", "Ensemble")
            .ok_or_else(|| ConfigError::Other("could not resolve config dir".into()))?;
        Self::at(proj.config_dir())
    }

    /// Store under `base`, creating it if needed.
    pub fn at(base: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Directory the store reads and writes.
    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ConfigError> {
        let plain = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !plain {
            return Err(ConfigError::Invalid {
                key: key.to_owned(),
                reason: "keys are plain file stems ([A-Za-z0-9._-], no leading dot)".to_owned(),
            });
        }
        Ok(self.base.join(format!("{key}.json")))
    }
}

impl ConfigStore for FsConfigStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError> {
        match fs::read(self.path_for(key)?) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(ConfigError::NotFound),
            Err(err) => Err(ConfigError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.base)?;
        let staged = self.base.join(format!(".{key}.json.tmp"));
        let mut file = fs::File::create(&staged)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&staged, &path)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ensemble_app_core::config::ConfigService;
    use ensemble_app_core::settings::ServiceSettings;

    #[test]
    fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(dir.path()).unwrap();
        assert!(matches!(store.load_raw("nope"), Err(ConfigError::NotFound)));
    }

    #[test]
    fn settings_persist_as_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let service = ConfigService::new(FsConfigStore::at(dir.path()).unwrap());
        let settings = ServiceSettings::load(&service).unwrap();
        assert!(dir.path().join("ensembled.json").exists());

        let reloaded = ServiceSettings::load(&service).unwrap();
        assert_eq!(settings, reloaded);
    }

    #[test]
    fn save_replaces_without_leaving_staged_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(dir.path()).unwrap();
        store.save_raw("k", b"one").unwrap();
        store.save_raw("k", b"two").unwrap();
        assert_eq!(store.load_raw("k").unwrap(), b"two");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("k.json")]);
    }

    #[test]
    fn keys_cannot_escape_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsConfigStore::at(dir.path().join("cfg")).unwrap();
        for key in ["../escape", "a/b", "", ".hidden"] {
            assert!(
                matches!(store.save_raw(key, b"{}"), Err(ConfigError::Invalid { .. })),
                "{key:?} accepted"
            );
        }
        assert!(!dir.path().join("escape.json").exists());
    }
}
