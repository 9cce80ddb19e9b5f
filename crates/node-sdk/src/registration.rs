//! Registration resources: acquiring one registers the client with the
//! broker, releasing it deregisters.

use std::sync::Arc;

use nl_protocol::ClientSpec;

use crate::behavior::{DeregisterFn, RegisterFn};
use crate::client::Client;
use crate::context::ProtocolContext;
use crate::error::{NodeSdkError, Result};
use crate::scope::ScopedResource;
use crate::service::ServiceMap;

/// Logical name of the registration service in the broker constants.
pub const REGISTRATION_SERVICE: &str = "client_registration";
/// Logical name of the deregistration service in the broker constants.
pub const DEREGISTRATION_SERVICE: &str = "client_deregistration";

/// Registration through a pair of closures.
pub struct FnRegistration {
    label: String,
    register: RegisterFn,
    deregister: DeregisterFn,
}

impl FnRegistration {
    pub fn new(label: impl Into<String>, register: RegisterFn, deregister: DeregisterFn) -> Self {
        Self {
            label: label.into(),
            register,
            deregister,
        }
    }
}

#[async_trait::async_trait]
impl ScopedResource for FnRegistration {
    type Output = ();

    fn name(&self) -> &str {
        &self.label
    }

    async fn acquire(&mut self) -> Result<()> {
        (self.register)().await
    }

    async fn release(self: Box<Self>) -> Result<()> {
        if !(self.deregister)().await? {
            tracing::debug!(resource = %self.label, "broker did not know the client");
        }
        Ok(())
    }
}

/// Registration through the broker's registration services.
///
/// Acquire sends the client's `ClientSpec` to the registration service and adopts
/// the broker-assigned id.  Release sends it to the deregistration
/// service and clears the id; it does nothing when the client has no id.
pub struct ServiceRegistration {
    client: Client,
    services: Arc<dyn ServiceMap>,
    register_topic: String,
    deregister_topic: String,
}

impl ServiceRegistration {
    pub fn new(
        client: Client,
        services: Arc<dyn ServiceMap>,
        register_topic: impl Into<String>,
        deregister_topic: impl Into<String>,
    ) -> Self {
        Self {
            client,
            services,
            register_topic: register_topic.into(),
            deregister_topic: deregister_topic.into(),
        }
    }

    /// Resolve the services through the context's broker constants.
    pub fn from_context(ctx: &ProtocolContext) -> Result<Self> {
        Ok(Self::new(
            ctx.client.clone(),
            ctx.service_map()?,
            ctx.service_topic(REGISTRATION_SERVICE)?,
            ctx.service_topic(DEREGISTRATION_SERVICE)?,
        ))
    }
}

#[async_trait::async_trait]
impl ScopedResource for ServiceRegistration {
    type Output = ();

    fn name(&self) -> &str {
        "registration"
    }

    async fn acquire(&mut self) -> Result<()> {
        let request = serde_json::to_value(self.client.spec())?;
        let reply = self.services.call(&self.register_topic, request).await?;
        let registered: ClientSpec = serde_json::from_value(reply)?;
        if registered.id.is_empty() {
            return Err(NodeSdkError::Service {
                topic: self.register_topic.clone(),
                message: "broker returned no client id".into(),
            });
        }

        self.client.update_spec(|spec| {
            spec.id = registered.id;
            if !registered.devices.is_empty() {
                spec.devices = registered.devices;
            }
        });
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<()> {
        let id = self.client.id();
        if id.is_empty() {
            tracing::debug!(client = %self.client.name(), "not registered; nothing to deregister");
            return Ok(());
        }

        let request = serde_json::to_value(self.client.spec())?;
        self.services.call(&self.deregister_topic, request).await?;
        self.client.set_id("");
        tracing::info!(client_id = %id, "client deregistered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::SlotFuture;
    use crate::service::LocalServiceMap;
    use crate::testing::stub_client;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn broker(deregistrations: Arc<AtomicU32>) -> Arc<LocalServiceMap> {
        let map = LocalServiceMap::new();
        map.register("/register", |req: Value| async move {
            let mut spec: ClientSpec = serde_json::from_value(req)?;
            spec.id = format!("id-{}", spec.name);
            Ok::<_, NodeSdkError>(serde_json::to_value(spec)?)
        })
        .register("/deregister", move |_| {
            let deregistrations = deregistrations.clone();
            async move {
                deregistrations.fetch_add(1, Ordering::SeqCst);
                Ok(json!(true))
            }
        });
        Arc::new(map)
    }

    #[tokio::test]
    async fn service_registration_assigns_and_clears_id() {
        let count = Arc::new(AtomicU32::new(0));
        let client = stub_client("reg-svc");
        let mut reg = Box::new(ServiceRegistration::new(
            client.clone(),
            broker(count.clone()),
            "/register",
            "/deregister",
        ));

        reg.acquire().await.unwrap();
        assert_eq!(client.id(), "id-reg-svc");

        reg.release().await.unwrap();
        assert!(client.id().is_empty());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn release_without_id_is_a_no_op() {
        let count = Arc::new(AtomicU32::new(0));
        let client = stub_client("reg-noop");
        let reg = Box::new(ServiceRegistration::new(
            client,
            broker(count.clone()),
            "/register",
            "/deregister",
        ));
        reg.release().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_id_reply_is_a_service_error() {
        let map = LocalServiceMap::new();
        map.register("/register", |req| async move { Ok(req) });
        let mut reg = ServiceRegistration::new(
            stub_client("reg-empty"),
            Arc::new(map),
            "/register",
            "/deregister",
        );
        assert!(matches!(
            reg.acquire().await,
            Err(NodeSdkError::Service { .. })
        ));
    }

    #[tokio::test]
    async fn fn_registration_tolerates_unknown_client() {
        let mut reg = Box::new(FnRegistration::new(
            "fn",
            Arc::new(|| -> SlotFuture<()> { Box::pin(async { Ok(()) }) }),
            Arc::new(|| -> SlotFuture<bool> { Box::pin(async { Ok(false) }) }),
        ));
        assert_eq!(reg.name(), "fn");
        reg.acquire().await.unwrap();
        reg.release().await.unwrap();
    }
}
