use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tracing::{debug, error};

use crate::catalog::{
    BastionInstanceStatus, Ping, Procedure, VaultClusterInitStatus, VaultClusterStatus,
    VaultInstanceRole, VaultInstanceRoleCreate, VaultInstanceRoleRead,
};
use crate::error::RpcError;
use crate::service::TarmakService;

type Handler = Box<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Maps procedure names to typed handlers.
#[derive(Default)]
pub struct ProcedureTable {
    handlers: HashMap<&'static str, Handler>,
}

impl ProcedureTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `P::NAME` to `handler`, replacing any earlier registration.
    pub fn register<P, F, Fut>(mut self, handler: F) -> Self
    where
        P: Procedure,
        F: Fn(P::Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<P::Reply, RpcError>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |params: Value| {
            let call = serde_json::from_value::<P::Args>(params).map(&handler);
            async move {
                let call = call
                    .map_err(|err| format!("rpc: invalid arguments for {}: {err}", P::NAME))?;
                let reply = call.await.map_err(|err| err.to_string())?;
                serde_json::to_value(reply).map_err(|err| err.to_string())
            }
            .boxed()
        });
        self.handlers.insert(P::NAME, handler);
        self
    }

    /// Every procedure of the catalog, answered by `service`.
    pub fn for_service(service: Arc<dyn TarmakService>) -> Self {
        let ping = Arc::clone(&service);
        let bastion = Arc::clone(&service);
        let cluster = Arc::clone(&service);
        let init = Arc::clone(&service);
        let create = Arc::clone(&service);
        let read = Arc::clone(&service);
        let legacy = service;

        Self::new()
            .register::<Ping, _, _>(move |args| {
                let service = Arc::clone(&ping);
                async move { service.ping(args).await }
            })
            .register::<BastionInstanceStatus, _, _>(move |args| {
                let service = Arc::clone(&bastion);
                async move { service.bastion_instance_status(args).await }
            })
            .register::<VaultClusterStatus, _, _>(move |args| {
                let service = Arc::clone(&cluster);
                async move { service.vault_cluster_status(args).await }
            })
            .register::<VaultClusterInitStatus, _, _>(move |args| {
                let service = Arc::clone(&init);
                async move { service.vault_cluster_init_status(args).await }
            })
            .register::<VaultInstanceRoleCreate, _, _>(move |args| {
                let service = Arc::clone(&create);
                async move { service.vault_instance_role_create(args).await }
            })
            .register::<VaultInstanceRoleRead, _, _>(move |args| {
                let service = Arc::clone(&read);
                async move { service.vault_instance_role_read(args).await }
            })
            .register::<VaultInstanceRole, _, _>(move |args| {
                let service = Arc::clone(&legacy);
                async move {
                    if args.create {
                        service.vault_instance_role_create(args).await
                    } else {
                        service.vault_instance_role_read(args).await
                    }
                }
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run the handler for `method`. Failures come back as the message sent
    /// to the caller.
    pub async fn dispatch(&self, method: &str, params: Value) -> Result<Value, String> {
        let Some(handler) = self.handlers.get(method) else {
            let err = RpcError::UnknownProcedure(method.to_string());
            debug!(procedure = method, "{err}");
            return Err(err.to_string());
        };

        debug!(procedure = method, "dispatching call");
        let result = handler(params).await;
        if let Err(message) = &result {
            error!(procedure = method, error = %message, "call failed");
        }
        result
    }
}

impl fmt::Debug for ProcedureTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcedureTable")
            .field("procedures", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::catalog::{
        BastionInstanceStatusReply, PingArgs, PingReply, VaultInstanceRoleArgs,
        VaultInstanceRoleReply, PROCEDURES,
    };
    use crate::error::Result;

    struct Echo;

    #[async_trait]
    impl TarmakService for Echo {
        async fn ping(&self, _args: PingArgs) -> Result<PingReply> {
            Ok(PingReply {
                version: "0.0.1".into(),
            })
        }

        async fn vault_instance_role_create(
            &self,
            args: VaultInstanceRoleArgs,
        ) -> Result<VaultInstanceRoleReply> {
            Ok(VaultInstanceRoleReply {
                init_token: format!("minted-{}", args.role_name),
            })
        }

        async fn vault_instance_role_read(
            &self,
            args: VaultInstanceRoleArgs,
        ) -> Result<VaultInstanceRoleReply> {
            Ok(VaultInstanceRoleReply {
                init_token: format!("existing-{}", args.role_name),
            })
        }
    }

    fn table() -> ProcedureTable {
        ProcedureTable::for_service(Arc::new(Echo))
    }

    #[test]
    fn service_table_covers_catalog() {
        let table = table();
        for name in PROCEDURES {
            assert!(table.contains(name), "{name} missing");
        }
        assert_eq!(table.names().len(), PROCEDURES.len());
    }

    #[tokio::test]
    async fn dispatch_decodes_and_encodes() {
        let reply = table().dispatch("Tarmak.Ping", json!({})).await.unwrap();
        assert_eq!(reply, json!({"version": "0.0.1"}));
    }

    #[tokio::test]
    async fn unknown_method_message() {
        let err = table()
            .dispatch("Tarmak.Missing", json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, "rpc: can't find method Tarmak.Missing");
    }

    #[tokio::test]
    async fn bad_arguments_name_the_procedure() {
        let err = table()
            .dispatch("Tarmak.BastionInstanceStatus", json!({"hostname": 7}))
            .await
            .unwrap_err();
        assert!(err.starts_with("rpc: invalid arguments for Tarmak.BastionInstanceStatus"));
    }

    #[tokio::test]
    async fn legacy_role_procedure_follows_create_flag() {
        let table = table();
        let args = |create: bool| {
            json!({
                "vault_cluster_name": "dev",
                "role_name": "worker",
                "vault_internal_fqdns": ["vault-1.dev"],
                "vault_ca": "",
                "create": create,
            })
        };

        let created = table
            .dispatch("Tarmak.VaultInstanceRole", args(true))
            .await
            .unwrap();
        assert_eq!(created, json!({"init_token": "minted-worker"}));

        let read = table
            .dispatch("Tarmak.VaultInstanceRole", args(false))
            .await
            .unwrap();
        assert_eq!(read, json!({"init_token": "existing-worker"}));
    }

    #[tokio::test]
    async fn handler_errors_become_messages() {
        let table = ProcedureTable::new().register::<BastionInstanceStatus, _, _>(|_args| async {
            Err::<BastionInstanceStatusReply, _>(RpcError::backend("bastion unreachable"))
        });
        let err = table
            .dispatch(
                "Tarmak.BastionInstanceStatus",
                json!({"hostname": "1.2.3.4", "username": "centos"}),
            )
            .await
            .unwrap_err();
        assert_eq!(err, "bastion unreachable");
    }
}
