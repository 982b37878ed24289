use crate::cloud::CloudSession;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
#[cfg(windows)]
use windows::Win32::Foundation::{LocalFree, HLOCAL};
#[cfg(windows)]
use windows::Win32::Security::Cryptography::{
    CryptProtectData, CryptUnprotectData, CRYPTPROTECT_UI_FORBIDDEN, CRYPT_INTEGER_BLOB,
};

pub const SESSION_KEY: &str = "cloud_session";
const VAULT_FILE: &str = "vault.json";

type VaultResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Secret store: a JSON map of base64 values, DPAPI-sealed on Windows.
#[derive(Debug)]
pub struct Vault {
    path: PathBuf,
    store: VaultStore,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultStore {
    entries: BTreeMap<String, String>,
}

impl Vault {
    pub fn open(path: Option<&str>) -> VaultResult<Self> {
        let path = match path.map(str::trim).filter(|p| !p.is_empty()) {
            Some(p) => PathBuf::from(p),
            None => default_vault_path(),
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let store = match fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                tracing::warn!(path = %path.display(), error = %err, "vault file unreadable, starting empty");
                VaultStore::default()
            }),
            Err(_) => VaultStore::default(),
        };

        Ok(Self { path, store })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store(&mut self, key: &str, value: &str) -> VaultResult<()> {
        let sealed = protect(value.as_bytes())?;
        self.store
            .entries
            .insert(key.to_string(), general_purpose::STANDARD.encode(sealed));
        self.persist()
    }

    pub fn retrieve(&self, key: &str) -> VaultResult<String> {
        let encoded = self
            .store
            .entries
            .get(key)
            .ok_or_else(|| format!("missing vault key '{key}'"))?;
        let sealed = general_purpose::STANDARD.decode(encoded)?;
        Ok(String::from_utf8(unprotect(&sealed)?)?)
    }

    pub fn list_keys(&self) -> Vec<String> {
        self.store.entries.keys().cloned().collect()
    }

    /// Cached control-plane session, if one was stored and still parses.
    pub fn load_session(&self) -> Option<CloudSession> {
        if !self.store.entries.contains_key(SESSION_KEY) {
            return None;
        }
        let raw = match self.retrieve(SESSION_KEY) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "cached session unreadable");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                tracing::warn!(error = %err, "cached session malformed");
                None
            }
        }
    }

    pub fn store_session(&mut self, session: &CloudSession) -> VaultResult<()> {
        let raw = serde_json::to_string(session)?;
        self.store(SESSION_KEY, &raw)
    }

    fn persist(&self) -> VaultResult<()> {
        let data = serde_json::to_string_pretty(&self.store)?;
        fs::write(&self.path, data)?;
        Ok(())
    }
}

fn default_vault_path() -> PathBuf {
    crate::config::config_dir().join(VAULT_FILE)
}

#[cfg(windows)]
fn dpapi(data: &[u8], seal: bool) -> VaultResult<Vec<u8>> {
    unsafe {
        let in_blob = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut out_blob = CRYPT_INTEGER_BLOB::default();

        if seal {
            CryptProtectData(&in_blob, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob)?;
        } else {
            CryptUnprotectData(&in_blob, None, None, None, None, CRYPTPROTECT_UI_FORBIDDEN, &mut out_blob)?;
        }

        let out = std::slice::from_raw_parts(out_blob.pbData, out_blob.cbData as usize).to_vec();
        let _ = LocalFree(HLOCAL(out_blob.pbData as *mut _));
        Ok(out)
    }
}

#[cfg(windows)]
fn protect(data: &[u8]) -> VaultResult<Vec<u8>> {
    dpapi(data, true)
}

#[cfg(windows)]
fn unprotect(data: &[u8]) -> VaultResult<Vec<u8>> {
    dpapi(data, false)
}

// Encoded only; rely on file permissions off Windows.
#[cfg(not(windows))]
fn protect(data: &[u8]) -> VaultResult<Vec<u8>> {
    Ok(data.to_vec())
}

#[cfg(not(windows))]
fn unprotect(data: &[u8]) -> VaultResult<Vec<u8>> {
    Ok(data.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("dingding-vault-{}", uuid::Uuid::new_v4()))
            .join(VAULT_FILE)
    }

    #[test]
    fn values_survive_reopen() {
        let path = scratch_path();
        let path_str = path.to_str().unwrap();
        let mut vault = Vault::open(Some(path_str)).unwrap();
        vault.store("password", "hunter2").unwrap();
        vault.store("alpha", "1").unwrap();

        let reopened = Vault::open(Some(path_str)).unwrap();
        assert_eq!(reopened.retrieve("password").unwrap(), "hunter2");
        assert_eq!(reopened.list_keys(), vec!["alpha".to_string(), "password".to_string()]);
        assert!(reopened.retrieve("missing").is_err());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn session_round_trips_through_vault() {
        let path = scratch_path();
        let mut vault = Vault::open(path.to_str()).unwrap();
        assert!(vault.load_session().is_none());

        let session = CloudSession {
            token: "tok".to_string(),
            user_id: Some("42".to_string()),
            ..Default::default()
        };
        vault.store_session(&session).unwrap();
        assert_eq!(Vault::open(path.to_str()).unwrap().load_session(), Some(session));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn garbage_file_opens_empty() {
        let path = scratch_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        let vault = Vault::open(path.to_str()).unwrap();
        assert!(vault.list_keys().is_empty());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
