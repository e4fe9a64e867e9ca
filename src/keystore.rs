//! JSON-file key store.
//!
//! Maps each tenant to its agent key chain: the `key` (private, used as
//! the registry slot key) and the `publickey` (the opaque handle viewers
//! connect with). Also answers which tenants a session token may see.
//! The file is shared with the external admin surface, so unrecognized
//! top-level sections are preserved across rewrites.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyChain {
    pub key: String,
    pub publickey: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Permission {
    #[serde(rename = "Devices", default)]
    devices: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct StoreData {
    #[serde(default)]
    agents: BTreeMap<String, KeyChain>,
    #[serde(default)]
    agent_permission: BTreeMap<String, Permission>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

#[derive(Debug)]
pub struct KeyStore {
    path: PathBuf,
    // Serializes read-modify-write cycles on the backing file.
    write_lock: Mutex<()>,
}

impl KeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StoreData, StoreError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreData::default()),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, data: &StoreData) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(data)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }

    /// Reads the store, logging and defaulting on failure. Lookups treat
    /// a broken file like an empty one; only writes surface errors.
    fn load_or_default(&self) -> StoreData {
        match self.load() {
            Ok(data) => data,
            Err(err) => {
                warn!("key store read failed ({}): {}", self.path.display(), err);
                StoreData::default()
            }
        }
    }

    /// The public key registered for a tenant, if any.
    pub fn get_public_by_name(&self, tenant_id: &str) -> Option<String> {
        self.load_or_default()
            .agents
            .get(tenant_id)
            .map(|chain| chain.publickey.clone())
    }

    /// Resolves a public key back to its private counterpart.
    pub fn get_private_by_public(&self, publickey: &str) -> Option<String> {
        self.load_or_default()
            .agents
            .values()
            .find(|chain| chain.publickey == publickey)
            .map(|chain| chain.key.clone())
    }

    /// Inserts or updates a tenant's key chain. An existing public key is
    /// preserved so the handle viewers hold stays stable across agent
    /// re-registrations.
    pub fn upsert_agent(
        &self,
        tenant_id: &str,
        private_key: &str,
        publickey: &str,
    ) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().expect("key store lock poisoned");
        let mut data = self.load()?;
        let publickey = match data.agents.get(tenant_id) {
            Some(existing) => {
                debug!(
                    "agent '{}' exists, preserving public key {}",
                    tenant_id, existing.publickey
                );
                existing.publickey.clone()
            }
            None => publickey.to_string(),
        };
        data.agents.insert(
            tenant_id.to_string(),
            KeyChain {
                key: private_key.to_string(),
                publickey,
            },
        );
        self.save(&data)
    }

    /// Tenants a session token is permitted to see. Device lists are
    /// stored as a comma-separated string.
    pub fn list_devices_for(&self, session_token: &str) -> Vec<String> {
        self.load_or_default()
            .agent_permission
            .get(session_token)
            .map(|permission| {
                permission
                    .devices
                    .split(',')
                    .map(str::trim)
                    .filter(|device| !device.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_store() -> KeyStore {
        let path = std::env::temp_dir().join(format!(
            "relay-keystore-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        KeyStore::new(path)
    }

    #[test]
    fn missing_file_reads_empty() {
        let store = temp_store();
        assert_eq!(store.get_public_by_name("nobody"), None);
        assert_eq!(store.get_private_by_public("nothing"), None);
        assert!(store.list_devices_for("token").is_empty());
    }

    #[test]
    fn upsert_and_resolve() {
        let store = temp_store();
        store.upsert_agent("laptop", "priv-1", "pub-1").unwrap();
        assert_eq!(store.get_public_by_name("laptop").as_deref(), Some("pub-1"));
        assert_eq!(
            store.get_private_by_public("pub-1").as_deref(),
            Some("priv-1")
        );
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn reregistration_preserves_public_key() {
        let store = temp_store();
        store.upsert_agent("laptop", "priv-1", "pub-1").unwrap();
        // Same tenant reconnects with a fresh private key and a freshly
        // minted public key; the stored public key must win.
        store.upsert_agent("laptop", "priv-2", "pub-2").unwrap();
        assert_eq!(store.get_public_by_name("laptop").as_deref(), Some("pub-1"));
        assert_eq!(
            store.get_private_by_public("pub-1").as_deref(),
            Some("priv-2")
        );
        assert_eq!(store.get_private_by_public("pub-2"), None);
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn device_list_splits_and_trims() {
        let store = temp_store();
        let raw = json!({
            "agent_permission": {
                "token-1": {"Devices": "laptop, desktop ,, phone"}
            }
        });
        fs::write(store.path(), raw.to_string()).unwrap();
        assert_eq!(
            store.list_devices_for("token-1"),
            vec!["laptop", "desktop", "phone"]
        );
        let _ = fs::remove_file(store.path());
    }

    #[test]
    fn unknown_sections_survive_rewrite() {
        let store = temp_store();
        let raw = json!({
            "user": {"abc": {"fullName": "Tester"}},
            "agents": {"laptop": {"key": "priv", "publickey": "pub"}}
        });
        fs::write(store.path(), raw.to_string()).unwrap();
        store.upsert_agent("desktop", "priv-2", "pub-2").unwrap();
        let reread: Value =
            serde_json::from_slice(&fs::read(store.path()).unwrap()).unwrap();
        assert_eq!(reread["user"]["abc"]["fullName"], "Tester");
        assert_eq!(reread["agents"]["laptop"]["publickey"], "pub");
        assert_eq!(reread["agents"]["desktop"]["key"], "priv-2");
        let _ = fs::remove_file(store.path());
    }
}
