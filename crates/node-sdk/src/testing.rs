//! In-memory protocol used by the unit tests.

use std::sync::Arc;

use nl_protocol::{Constants, ServerDescription, TopicDataRecord};
use parking_lot::Mutex;

use crate::behavior::{BehaviorKind, Publish, PublishFn, Register, SlotFuture};
use crate::client::Client;
use crate::connection::{ChannelConnection, ChannelPeer, DataConnection};
use crate::context::ProtocolContext;
use crate::error::Result;
use crate::lifecycle::ClientProtocol;
use crate::registration::FnRegistration;
use crate::scope::ScopedResource;
use crate::service::{LocalServiceMap, ServiceMap};

pub(crate) fn noop_publish() -> PublishFn {
    Arc::new(|_records: Vec<TopicDataRecord>| -> SlotFuture<()> { Box::pin(async { Ok(()) }) })
}

/// Registers with a fresh uuid, fills `Publish` (and `Register` when
/// declared) and keeps the broker ends of its connections alive.
#[derive(Default)]
pub(crate) struct StubProtocol {
    peers: Mutex<Vec<ChannelPeer>>,
}

#[async_trait::async_trait]
impl ClientProtocol for StubProtocol {
    fn name(&self) -> &str {
        "stub"
    }

    async fn create_service_map(&self, _ctx: &mut ProtocolContext) -> Result<Arc<dyn ServiceMap>> {
        Ok(Arc::new(LocalServiceMap::new()))
    }

    async fn update_config(&self, ctx: &mut ProtocolContext) -> Result<()> {
        ctx.server = Some(ServerDescription {
            id: "stub-server".into(),
            name: "stub".into(),
            ..Default::default()
        });
        ctx.constants = Some(Constants::default());
        Ok(())
    }

    async fn update_services(&self, _ctx: &mut ProtocolContext) -> Result<()> {
        Ok(())
    }

    async fn create_client(&self, _ctx: &mut ProtocolContext) -> Result<()> {
        Ok(())
    }

    async fn register_client(
        &self,
        ctx: &mut ProtocolContext,
    ) -> Result<Box<dyn ScopedResource<Output = ()>>> {
        let on_register = ctx.client.clone();
        let on_deregister = ctx.client.clone();
        Ok(Box::new(FnRegistration::new(
            "stub-registration",
            Arc::new(move || -> SlotFuture<()> {
                on_register.set_id(format!("stub-{}", uuid::Uuid::new_v4()));
                Box::pin(async { Ok(()) })
            }),
            Arc::new(move || -> SlotFuture<bool> {
                on_deregister.set_id("");
                Box::pin(async { Ok(true) })
            }),
        )))
    }

    async fn create_topic_connection(&self, _ctx: &mut ProtocolContext) -> Result<Arc<dyn DataConnection>> {
        let (conn, peer) = ChannelConnection::pair();
        self.peers.lock().push(peer);
        Ok(Arc::new(conn))
    }

    async fn implement_client(&self, ctx: &mut ProtocolContext) -> Result<()> {
        let client = &ctx.client;
        client.update::<Publish>(|p| p.publish = Some(noop_publish()))?;
        if client.wants(&[BehaviorKind::Register]) {
            client.update::<Register>(|r| {
                r.register = Some(Arc::new(|| -> SlotFuture<()> { Box::pin(async { Ok(()) }) }));
                r.deregister = Some(Arc::new(|| -> SlotFuture<bool> { Box::pin(async { Ok(true) }) }));
            })?;
        }
        Ok(())
    }
}

/// A client requiring `Publish` with `Register` optional, driven by
/// [`StubProtocol`].
pub(crate) fn stub_client(name: &str) -> Client {
    Client::builder()
        .name(name)
        .required([BehaviorKind::Publish])
        .optional([BehaviorKind::Register])
        .protocol(StubProtocol::default())
        .build()
        .expect("stub client builds")
}
