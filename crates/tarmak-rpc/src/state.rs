//! File-backed collaborators for running the host without live infrastructure.
//!
//! The state document is re-read on every call, so editing the file changes
//! what the host reports:
//!
//! ```json
//! {
//!   "cluster_name": "dev-cluster",
//!   "phase": "apply",
//!   "bastion": { "ready": true },
//!   "vault": { "initialized": true, "tokens": { "worker": "3f0c..." } }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::{VaultClusterStatusArgs, VaultInstanceRoleArgs};
use crate::error::{Result, RpcError};
use crate::service::{CredentialBackend, Inventory, Phase};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    pub cluster_name: String,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub bastion: BastionState,
    #[serde(default)]
    pub vault: VaultState,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionState {
    #[serde(default)]
    pub ready: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultState {
    #[serde(default)]
    pub initialized: bool,
    /// Init tokens by role name.
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

/// [`Inventory`] and [`CredentialBackend`] answered from a JSON file.
///
/// Tokens minted by `ensure_init_token` are kept in memory, never written
/// back.
#[derive(Debug)]
pub struct StateFile {
    path: PathBuf,
    minted: Mutex<BTreeMap<String, String>>,
}

impl StateFile {
    /// Open `path`, failing early if it is missing or malformed.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let state = Self {
            path: path.into(),
            minted: Mutex::new(BTreeMap::new()),
        };
        let document = state.load().await?;
        info!(path = ?state.path, cluster = %document.cluster_name, phase = ?document.phase, "loaded host state");
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<StateDocument> {
        let raw = tokio::fs::read(&self.path).await.map_err(|err| {
            RpcError::backend(format!("cannot read state file {}: {err}", self.path.display()))
        })?;
        serde_json::from_slice(&raw).map_err(|err| {
            RpcError::backend(format!("invalid state file {}: {err}", self.path.display()))
        })
    }

    fn minted(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        self.minted
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn cluster(&self, requested: &str) -> Result<StateDocument> {
        let document = self.load().await?;
        if !requested.is_empty() && requested != document.cluster_name {
            return Err(RpcError::backend(format!(
                "unknown vault cluster {requested}, this host manages {}",
                document.cluster_name
            )));
        }
        Ok(document)
    }

    fn existing_token(&self, document: &StateDocument, role: &str) -> Option<String> {
        self.minted()
            .get(role)
            .or_else(|| document.vault.tokens.get(role))
            .cloned()
    }
}

#[async_trait]
impl Inventory for StateFile {
    async fn phase(&self) -> Result<Phase> {
        Ok(self.load().await?.phase)
    }

    async fn verify_bastion(&self, hostname: &str, username: &str) -> Result<()> {
        if self.load().await?.bastion.ready {
            Ok(())
        } else {
            Err(RpcError::backend(format!(
                "bastion {username}@{hostname} is not reachable"
            )))
        }
    }
}

#[async_trait]
impl CredentialBackend for StateFile {
    async fn verify_init(&self, cluster: &VaultClusterStatusArgs) -> Result<()> {
        if cluster.vault_internal_fqdns.is_empty() {
            return Err(RpcError::backend("no vault instances given"));
        }
        if self.load().await?.vault.initialized {
            Ok(())
        } else {
            Err(RpcError::backend("vault is sealed or not initialised"))
        }
    }

    async fn ensure_cluster(&self, _cluster: &VaultClusterStatusArgs) -> Result<()> {
        let document = self.load().await?;
        debug!(cluster = %document.cluster_name, "vault cluster configuration ensured");
        Ok(())
    }

    async fn init_status(&self, _cluster: &VaultClusterStatusArgs) -> Result<bool> {
        Ok(self.load().await?.vault.initialized)
    }

    async fn ensure_init_token(&self, role: &VaultInstanceRoleArgs) -> Result<String> {
        let document = self.cluster(&role.vault_cluster_name).await?;
        if !role.force {
            if let Some(token) = self.existing_token(&document, &role.role_name) {
                return Ok(token);
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        self.minted()
            .insert(role.role_name.clone(), token.clone());
        info!(role = %role.role_name, forced = role.force, "minted init token");
        Ok(token)
    }

    async fn get_init_token(&self, role: &VaultInstanceRoleArgs) -> Result<String> {
        let document = self.cluster(&role.vault_cluster_name).await?;
        self.existing_token(&document, &role.role_name)
            .ok_or_else(|| {
                RpcError::backend(format!("no init token for role {}", role.role_name))
            })
    }
}
