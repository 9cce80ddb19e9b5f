//! `nl-node-sdk`: client-side lifecycle engine for nodelink broker nodes.
//!
//! A "client node" connects to a broker, registers, exposes a set of
//! *behaviors* (service calls, subscriptions, publishing, ...) whose slots
//! the broker-version specific [`ClientProtocol`] fills in, and stays usable
//! until it is stopped.  This crate provides the building blocks so broker
//! versions only implement the protocol steps, not the lifecycle plumbing.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  Your Node                                                │
//! │                                                           │
//! │   let client = Client::builder()                          │
//! │       .name("thermometer")                                │
//! │       .protocol(MyBrokerProtocol::new(...))               │
//! │       .build()?;                                          │
//! │                                                           │
//! │   client.scoped(|c| async move {                          │
//! │       let publish = c.get::<Publish>()...;                │
//! │       ...                                                 │
//! │   }).await?;                                              │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle (hard-coded by the SDK)
//!
//! 1. `on_start`: service map, broker configuration, services, client
//! 2. `on_create`: registration, held by the task scope until teardown
//! 3. `on_registration`: data connection, behavior slots, wait usable (5s)
//! 4. `on_connect`: record relay into the topic store
//! 5. `on_stop`: status unavailable, disconnect; the scope then deregisters
//!
//! Every hook runs through the [`HookInterceptor`] chain.
//!
//! # Readiness
//!
//! Behavior writes signal the client's [`ReadinessGate`]; everything that
//! waits on behaviors ([`Client::implements`], [`Client::await_usable`])
//! re-checks its predicate on each signal.

pub mod behavior;
pub mod builder;
pub mod client;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod gate;
pub mod lifecycle;
pub mod loopback;
pub mod pipeline;
pub mod registration;
pub mod registry;
pub mod retry;
pub mod scope;
pub mod service;
pub mod topics;

#[cfg(test)]
pub(crate) mod testing;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use behavior::{AnyBehavior, Behavior, BehaviorKind, Behaviors, SlotFuture};
pub use builder::ClientBuilder;
pub use client::{Client, Implements, DEFAULT_CLIENT_NAME};
pub use config::BrokerConfig;
pub use connection::{ChannelConnection, ChannelPeer, DataConnection};
pub use context::ProtocolContext;
pub use error::{NodeSdkError, Result};
pub use gate::ReadinessGate;
pub use lifecycle::{ClientProtocol, LifecycleState, ProtocolRunner, IMPLEMENT_DEADLINE};
pub use loopback::{LoopbackBroker, LoopbackProtocol};
pub use pipeline::{register_global_interceptor, Hook, HookInterceptor, Next, RetryInterceptor, TracingInterceptor};
pub use registration::{FnRegistration, ServiceRegistration};
pub use registry::ClientRegistry;
pub use retry::RetryBackoff;
pub use scope::{ScopedResource, ScopedTask, TaskScope};
pub use service::{LocalServiceMap, ServerConfigReply, ServiceMap};
pub use topics::{Topic, TopicStore};

// Re-export protocol types so nodes never need to import nl-protocol directly.
pub use nl_protocol::{ClientSpec, ClientStatus, Constants, ServerDescription, TopicData, TopicDataRecord};
