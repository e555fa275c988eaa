//! Durable storage for the one piece of state that outlives the process: the
//! auth token that lets a later run resume the same identity.

use directories::BaseDirs;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use time::OffsetDateTime;
use url::Url;

pub const AUTH_TOKEN_KEY: &str = "auth_token";

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unable to determine home directory")]
    NoHomeDir,
    #[error("io error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("serialization error: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for CredentialError {
    fn from(value: toml::de::Error) -> Self {
        CredentialError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for CredentialError {
    fn from(value: toml::ser::Error) -> Self {
        CredentialError::Toml(value.to_string())
    }
}

pub trait CredentialStore: Send + Sync {
    fn load(&self, profile: &str) -> Result<Option<String>, CredentialError>;
    fn save(&self, profile: &str, token: &str) -> Result<(), CredentialError>;
    fn clear(&self, profile: &str) -> Result<(), CredentialError>;
}

/// Tokens are scoped per store endpoint and module, e.g. `local-pixel-canvas@127.0.0.1:3000`.
pub fn profile_key(endpoint: &Url, module: &str) -> String {
    let host = endpoint.host_str().unwrap_or("localhost");
    match endpoint.port() {
        Some(port) => format!("{module}@{host}:{port}"),
        None => format!("{module}@{host}"),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredToken {
    auth_token: String,
    #[serde(with = "time::serde::rfc3339")]
    updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CredentialsFile {
    #[serde(default)]
    profiles: BTreeMap<String, StoredToken>,
}

/// TOML file (mode 0600 on unix) holding one token per profile.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_path() -> Result<PathBuf, CredentialError> {
        let base = BaseDirs::new().ok_or(CredentialError::NoHomeDir)?;
        Ok(base.home_dir().join(".pixel-canvas").join("credentials"))
    }

    pub fn at_default_path() -> Result<Self, CredentialError> {
        Ok(Self::new(Self::default_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> CredentialError {
        CredentialError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn read(&self) -> Result<CredentialsFile, CredentialError> {
        if !self.path.exists() {
            return Ok(CredentialsFile::default());
        }
        let raw = fs::read_to_string(&self.path).map_err(|err| self.io_error(err))?;
        Ok(toml::from_str(&raw)?)
    }

    fn write(&self, file: &CredentialsFile) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }
        let serialized = toml::to_string_pretty(file)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut handle = options.open(&self.path).map_err(|err| self.io_error(err))?;
        handle
            .write_all(serialized.as_bytes())
            .map_err(|err| self.io_error(err))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = handle.metadata().map_err(|err| self.io_error(err))?;
            let mut perms = metadata.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&self.path, perms).map_err(|err| self.io_error(err))?;
        }
        Ok(())
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self, profile: &str) -> Result<Option<String>, CredentialError> {
        let file = self.read()?;
        Ok(file
            .profiles
            .get(profile)
            .map(|stored| stored.auth_token.clone())
            .filter(|token| !token.trim().is_empty()))
    }

    fn save(&self, profile: &str, token: &str) -> Result<(), CredentialError> {
        let mut file = self.read()?;
        file.profiles.insert(
            profile.to_string(),
            StoredToken {
                auth_token: token.to_string(),
                updated_at: OffsetDateTime::now_utc(),
            },
        );
        self.write(&file)
    }

    fn clear(&self, profile: &str) -> Result<(), CredentialError> {
        let mut file = self.read()?;
        if file.profiles.remove(profile).is_some() {
            self.write(&file)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    tokens: Mutex<HashMap<String, String>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self, profile: &str) -> Result<Option<String>, CredentialError> {
        Ok(self.tokens.lock().get(profile).cloned())
    }

    fn save(&self, profile: &str, token: &str) -> Result<(), CredentialError> {
        self.tokens
            .lock()
            .insert(profile.to_string(), token.to_string());
        Ok(())
    }

    fn clear(&self, profile: &str) -> Result<(), CredentialError> {
        self.tokens.lock().remove(profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_roundtrips_per_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("nested").join("credentials"));
        assert_eq!(store.load("a").unwrap(), None);

        store.save("a", "token-a").unwrap();
        store.save("b", "token-b").unwrap();
        store.save("a", "token-a2").unwrap();

        let reopened = FileCredentialStore::new(store.path().to_path_buf());
        assert_eq!(reopened.load("a").unwrap().as_deref(), Some("token-a2"));
        assert_eq!(reopened.load("b").unwrap().as_deref(), Some("token-b"));

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(raw.contains(AUTH_TOKEN_KEY));

        reopened.clear("a").unwrap();
        assert_eq!(store.load("a").unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn file_store_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = FileCredentialStore::new(dir.path().join("credentials"));
        store.save("p", "secret").unwrap();
        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn profile_key_includes_port() {
        let url = Url::parse("ws://127.0.0.1:3000").unwrap();
        assert_eq!(profile_key(&url, "canvas"), "canvas@127.0.0.1:3000");
        let url = Url::parse("wss://maincloud.example.com").unwrap();
        assert_eq!(profile_key(&url, "canvas"), "canvas@maincloud.example.com");
    }
}
