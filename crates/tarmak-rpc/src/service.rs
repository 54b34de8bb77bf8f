//! Host-side implementation of the catalog.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::catalog::{
    BastionInstanceStatus, BastionInstanceStatusArgs, BastionInstanceStatusReply, PingArgs,
    PingReply, Procedure, VaultClusterInitStatus, VaultClusterStatus, VaultClusterStatusArgs,
    VaultClusterStatusReply, VaultInstanceRoleArgs, VaultInstanceRoleCreate,
    VaultInstanceRoleRead, VaultInstanceRoleReply, STATUS_READY, STATUS_UNKNOWN,
};
use crate::error::{Result, RpcError};

/// One handler per catalog procedure.
///
/// Only `ping` is required; the rest answer with an error until implemented.
#[async_trait]
pub trait TarmakService: Send + Sync {
    async fn ping(&self, args: PingArgs) -> Result<PingReply>;

    async fn bastion_instance_status(
        &self,
        _args: BastionInstanceStatusArgs,
    ) -> Result<BastionInstanceStatusReply> {
        Err(not_implemented::<BastionInstanceStatus>())
    }

    async fn vault_cluster_status(
        &self,
        _args: VaultClusterStatusArgs,
    ) -> Result<VaultClusterStatusReply> {
        Err(not_implemented::<VaultClusterStatus>())
    }

    async fn vault_cluster_init_status(
        &self,
        _args: VaultClusterStatusArgs,
    ) -> Result<VaultClusterStatusReply> {
        Err(not_implemented::<VaultClusterInitStatus>())
    }

    async fn vault_instance_role_create(
        &self,
        _args: VaultInstanceRoleArgs,
    ) -> Result<VaultInstanceRoleReply> {
        Err(not_implemented::<VaultInstanceRoleCreate>())
    }

    async fn vault_instance_role_read(
        &self,
        _args: VaultInstanceRoleArgs,
    ) -> Result<VaultInstanceRoleReply> {
        Err(not_implemented::<VaultInstanceRoleRead>())
    }
}

fn not_implemented<P: Procedure>() -> RpcError {
    RpcError::backend(format!("{} is not implemented by this host", P::NAME))
}

/// Lifecycle phase of the cluster the host is working on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Apply,
    Destroy,
}

impl Phase {
    pub fn is_destroying(self) -> bool {
        self == Phase::Destroy
    }
}

/// Cluster and host lookups.
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn phase(&self) -> Result<Phase>;

    /// Succeeds once the bastion accepts `username` at `hostname`.
    async fn verify_bastion(&self, hostname: &str, username: &str) -> Result<()>;
}

/// The secret/PKI backend fronted by the `Vault*` procedures.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    /// Initialise and unseal the cluster if needed.
    async fn verify_init(&self, cluster: &VaultClusterStatusArgs) -> Result<()>;

    /// Make sure the cluster's roles and policies exist.
    async fn ensure_cluster(&self, cluster: &VaultClusterStatusArgs) -> Result<()>;

    /// Whether the cluster is initialised. Never changes it.
    async fn init_status(&self, cluster: &VaultClusterStatusArgs) -> Result<bool>;

    /// Existing init token for the role, or a newly minted one.
    async fn ensure_init_token(&self, role: &VaultInstanceRoleArgs) -> Result<String>;

    /// Existing init token for the role.
    async fn get_init_token(&self, role: &VaultInstanceRoleArgs) -> Result<String>;
}

/// How long handlers wait for collaborators that are still coming up.
#[derive(Debug, Clone, Copy)]
pub struct HandlerRetry {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for HandlerRetry {
    fn default() -> Self {
        Self {
            attempts: 60,
            delay: Duration::from_secs(1),
        }
    }
}

impl HandlerRetry {
    async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "{what} failed; retrying");
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// [`TarmakService`] backed by live collaborators.
#[derive(Clone)]
pub struct HostService {
    inventory: Arc<dyn Inventory>,
    backend: Arc<dyn CredentialBackend>,
    retry: HandlerRetry,
    version: String,
}

impl HostService {
    pub fn new(inventory: Arc<dyn Inventory>, backend: Arc<dyn CredentialBackend>) -> Self {
        Self {
            inventory,
            backend,
            retry: HandlerRetry::default(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn with_retry(mut self, retry: HandlerRetry) -> Self {
        self.retry = retry;
        self
    }

    /// Version reported by `Ping`.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    async fn destroying(&self) -> Result<bool> {
        Ok(self.inventory.phase().await?.is_destroying())
    }
}

fn failed(message: String) -> RpcError {
    error!(error = %message, "procedure failed");
    RpcError::Backend(message)
}

#[async_trait]
impl TarmakService for HostService {
    async fn ping(&self, _args: PingArgs) -> Result<PingReply> {
        Ok(PingReply {
            version: self.version.clone(),
        })
    }

    async fn bastion_instance_status(
        &self,
        args: BastionInstanceStatusArgs,
    ) -> Result<BastionInstanceStatusReply> {
        debug!(hostname = %args.hostname, "bastion instance status requested");
        if self.destroying().await? {
            return Ok(BastionInstanceStatusReply {
                status: STATUS_UNKNOWN.to_string(),
            });
        }

        let inventory = self.inventory.as_ref();
        let (hostname, username) = (args.hostname.as_str(), args.username.as_str());
        self.retry
            .run("bastion check", move || inventory.verify_bastion(hostname, username))
            .await
            .map_err(|err| failed(format!("bastion instance is not ready: {err}")))?;

        Ok(BastionInstanceStatusReply {
            status: STATUS_READY.to_string(),
        })
    }

    async fn vault_cluster_status(
        &self,
        args: VaultClusterStatusArgs,
    ) -> Result<VaultClusterStatusReply> {
        debug!(fqdns = ?args.vault_internal_fqdns, "vault cluster status requested");
        if self.destroying().await? {
            return Ok(VaultClusterStatusReply {
                status: STATUS_UNKNOWN.to_string(),
            });
        }

        self.backend
            .verify_init(&args)
            .await
            .map_err(|err| failed(format!("failed to initialise vault cluster: {err}")))?;
        self.backend
            .ensure_cluster(&args)
            .await
            .map_err(|err| failed(format!("vault cluster is not ready: {err}")))?;

        Ok(VaultClusterStatusReply {
            status: STATUS_READY.to_string(),
        })
    }

    async fn vault_cluster_init_status(
        &self,
        args: VaultClusterStatusArgs,
    ) -> Result<VaultClusterStatusReply> {
        debug!(fqdns = ?args.vault_internal_fqdns, "vault cluster init status requested");
        if self.destroying().await? {
            return Ok(VaultClusterStatusReply {
                status: STATUS_UNKNOWN.to_string(),
            });
        }

        let (backend, cluster) = (self.backend.as_ref(), &args);
        let initialised = self
            .retry
            .run("init status", move || backend.init_status(cluster))
            .await
            .map_err(|err| failed(format!("failed to retrieve init status: {err}")))?;
        if !initialised {
            return Err(failed("vault cluster is not initialised".to_string()));
        }

        Ok(VaultClusterStatusReply {
            status: STATUS_READY.to_string(),
        })
    }

    async fn vault_instance_role_create(
        &self,
        args: VaultInstanceRoleArgs,
    ) -> Result<VaultInstanceRoleReply> {
        debug!(role = %args.role_name, force = args.force, "init token requested");
        if self.destroying().await? {
            return Ok(VaultInstanceRoleReply::default());
        }

        let (backend, role) = (self.backend.as_ref(), &args);
        let init_token = self
            .retry
            .run("init token", move || backend.ensure_init_token(role))
            .await
            .map_err(|err| {
                failed(format!(
                    "could not get init token for role {}: {err}",
                    args.role_name
                ))
            })?;
        Ok(VaultInstanceRoleReply { init_token })
    }

    async fn vault_instance_role_read(
        &self,
        args: VaultInstanceRoleArgs,
    ) -> Result<VaultInstanceRoleReply> {
        debug!(role = %args.role_name, "init token lookup");
        if self.destroying().await? {
            return Ok(VaultInstanceRoleReply::default());
        }

        let (backend, role) = (self.backend.as_ref(), &args);
        let init_token = self
            .retry
            .run("init token lookup", move || backend.get_init_token(role))
            .await
            .map_err(|err| {
                failed(format!(
                    "could not get init token for role {}: {err}",
                    args.role_name
                ))
            })?;
        Ok(VaultInstanceRoleReply { init_token })
    }
}
