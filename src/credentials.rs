// src/credentials.rs
//
// Persistent device credentials.
//
// A small TOML key/value file keyed on device id, holding the cloud-issued
// token. Written atomically (write-temp-rename) so a crash mid-write leaves
// either the previous record or the new one, never a torn file: a cleared
// file means "not registered", a stored record means "registered with that
// token".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CredentialsError;

/// One stored credential record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredCredentials {
    pub id: String,
    pub token: String,
}

/// Credential persistence contract consumed by the state machine.
pub trait CredentialStore: Send + Sync {
    /// Read the stored record. `Ok(None)` if nothing is stored.
    fn load(&self) -> Result<Option<StoredCredentials>, CredentialsError>;
    /// Replace the stored record with (id, token).
    fn store(&self, id: &str, token: &str) -> Result<(), CredentialsError>;
    /// Remove any stored record.
    fn clear(&self) -> Result<(), CredentialsError>;
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct CredentialFile {
    #[serde(default)]
    written_at: String,
    #[serde(default)]
    devices: BTreeMap<String, String>,
}

/// TOML-file-backed credential store.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn write_atomic(&self, file: &CredentialFile) -> Result<(), CredentialsError> {
        let body = toml::to_string(file)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<StoredCredentials>, CredentialsError> {
        let body = match fs::read_to_string(&self.path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: CredentialFile = toml::from_str(&body)?;
        Ok(file
            .devices
            .into_iter()
            .next()
            .map(|(id, token)| StoredCredentials { id, token }))
    }

    fn store(&self, id: &str, token: &str) -> Result<(), CredentialsError> {
        let mut devices = BTreeMap::new();
        devices.insert(id.to_string(), token.to_string());
        self.write_atomic(&CredentialFile {
            written_at: chrono::Utc::now().to_rfc3339(),
            devices,
        })
    }

    fn clear(&self) -> Result<(), CredentialsError> {
        self.write_atomic(&CredentialFile {
            written_at: chrono::Utc::now().to_rfc3339(),
            devices: BTreeMap::new(),
        })
    }
}
