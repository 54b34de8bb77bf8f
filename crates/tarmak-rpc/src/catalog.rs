//! The procedures the host exposes to sandboxed callers.
//!
//! Every procedure is named `Tarmak.<Method>` and has one argument struct and
//! one reply struct. Marker types implementing [`Procedure`] tie the three
//! together so calls and handlers stay statically typed.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Service prefix of every procedure name.
pub const SERVICE_NAME: &str = "Tarmak";

/// Status reported once a checked resource is usable.
pub const STATUS_READY: &str = "ready";

/// Status reported while the cluster is being destroyed.
pub const STATUS_UNKNOWN: &str = "unknown";

/// A named request/reply pair.
pub trait Procedure: Send + Sync + 'static {
    /// Full name, `Tarmak.<Method>`.
    const NAME: &'static str;
    type Args: Serialize + DeserializeOwned + Send + Sync + 'static;
    type Reply: Serialize + DeserializeOwned + Send + 'static;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingArgs {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingReply {
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionInstanceStatusArgs {
    pub hostname: String,
    pub username: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BastionInstanceStatusReply {
    pub status: String,
}

/// Locates a credential backend cluster and the material needed to unseal it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultClusterStatusArgs {
    pub vault_internal_fqdns: Vec<String>,
    pub vault_ca: String,
    #[serde(default)]
    pub vault_kms_key_id: String,
    #[serde(default)]
    pub vault_unseal_key_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultClusterStatusReply {
    pub status: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInstanceRoleArgs {
    pub vault_cluster_name: String,
    pub role_name: String,
    pub vault_internal_fqdns: Vec<String>,
    pub vault_ca: String,
    /// Mint the token if it does not exist yet.
    #[serde(default)]
    pub create: bool,
    /// Mint a fresh token even if one exists.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultInstanceRoleReply {
    pub init_token: String,
}

/// Liveness and version check.
#[derive(Debug, Clone, Copy)]
pub struct Ping;

impl Procedure for Ping {
    const NAME: &'static str = "Tarmak.Ping";
    type Args = PingArgs;
    type Reply = PingReply;
}

/// Waits until the bastion host answers.
#[derive(Debug, Clone, Copy)]
pub struct BastionInstanceStatus;

impl Procedure for BastionInstanceStatus {
    const NAME: &'static str = "Tarmak.BastionInstanceStatus";
    type Args = BastionInstanceStatusArgs;
    type Reply = BastionInstanceStatusReply;
}

/// Initialises, unseals and configures the credential backend.
#[derive(Debug, Clone, Copy)]
pub struct VaultClusterStatus;

impl Procedure for VaultClusterStatus {
    const NAME: &'static str = "Tarmak.VaultClusterStatus";
    type Args = VaultClusterStatusArgs;
    type Reply = VaultClusterStatusReply;
}

/// Reports whether the credential backend is initialised, without changing it.
#[derive(Debug, Clone, Copy)]
pub struct VaultClusterInitStatus;

impl Procedure for VaultClusterInitStatus {
    const NAME: &'static str = "Tarmak.VaultClusterInitStatus";
    type Args = VaultClusterStatusArgs;
    type Reply = VaultClusterStatusReply;
}

/// Returns the init token of a role, minting it if needed.
#[derive(Debug, Clone, Copy)]
pub struct VaultInstanceRoleCreate;

impl Procedure for VaultInstanceRoleCreate {
    const NAME: &'static str = "Tarmak.VaultInstanceRoleCreate";
    type Args = VaultInstanceRoleArgs;
    type Reply = VaultInstanceRoleReply;
}

/// Returns the existing init token of a role.
#[derive(Debug, Clone, Copy)]
pub struct VaultInstanceRoleRead;

impl Procedure for VaultInstanceRoleRead {
    const NAME: &'static str = "Tarmak.VaultInstanceRoleRead";
    type Args = VaultInstanceRoleArgs;
    type Reply = VaultInstanceRoleReply;
}

/// Older single entry point for init tokens; `create` picks the behaviour.
#[derive(Debug, Clone, Copy)]
pub struct VaultInstanceRole;

impl Procedure for VaultInstanceRole {
    const NAME: &'static str = "Tarmak.VaultInstanceRole";
    type Args = VaultInstanceRoleArgs;
    type Reply = VaultInstanceRoleReply;
}

/// Every procedure name in the catalog.
pub const PROCEDURES: &[&str] = &[
    Ping::NAME,
    BastionInstanceStatus::NAME,
    VaultClusterStatus::NAME,
    VaultClusterInitStatus::NAME,
    VaultInstanceRoleCreate::NAME,
    VaultInstanceRoleRead::NAME,
    VaultInstanceRole::NAME,
];

/// Expand `Method` to `Tarmak.Method`; full names pass through.
pub fn qualify(name: &str) -> String {
    if name.contains('.') {
        name.to_string()
    } else {
        format!("{SERVICE_NAME}.{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_carry_service_prefix() {
        for name in PROCEDURES {
            let (service, method) = name.split_once('.').unwrap();
            assert_eq!(service, SERVICE_NAME);
            assert!(!method.is_empty());
        }
    }

    #[test]
    fn qualify_short_names() {
        assert_eq!(qualify("Ping"), "Tarmak.Ping");
        assert_eq!(qualify("Tarmak.Ping"), "Tarmak.Ping");
    }

    #[test]
    fn ping_args_are_an_empty_object() {
        assert_eq!(serde_json::to_string(&PingArgs {}).unwrap(), "{}");
        let _: PingArgs = serde_json::from_str("{}").unwrap();
    }

    #[test]
    fn role_flags_default_to_false() {
        let args: VaultInstanceRoleArgs = serde_json::from_str(
            r#"{"vault_cluster_name":"dev","role_name":"worker","vault_internal_fqdns":[],"vault_ca":""}"#,
        )
        .unwrap();
        assert!(!args.create);
        assert!(!args.force);
    }
}
