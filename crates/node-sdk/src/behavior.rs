//! Behaviors: typed groups of optional slots that a protocol fills in.
//!
//! Each behavior is a plain struct whose fields are all `Option<_>`.  A
//! behavior is *implemented* once every slot is `Some`.  Clients declare
//! which behaviors they require and which are optional; the client is
//! usable when all required behaviors are implemented.
//!
//! The set of behavior kinds is closed ([`BehaviorKind`]); the slots of a
//! kind are fixed by its struct.  Slot callables return boxed futures so a
//! protocol can capture whatever it needs (service map, topic store, ...).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use nl_protocol::{Device, ModuleStatus, ProcessingModule, Session, SessionList, TopicDataRecord};

use crate::error::{NodeSdkError, Result};
use crate::service::ServiceMap;
use crate::topics::Topic;

// ── Slot signatures ──────────────────────────────────────────────────

pub type SlotFuture<T> = BoxFuture<'static, Result<T>>;

/// Subscribe / unsubscribe by topic names or unix wildcard patterns.
/// Subscribing returns one topic per argument, in order; unsubscribing
/// returns the topics that were actually removed.
pub type SubscribeFn = Arc<dyn Fn(Vec<String>) -> SlotFuture<Vec<Arc<Topic>>> + Send + Sync>;
pub type PublishFn = Arc<dyn Fn(Vec<TopicDataRecord>) -> SlotFuture<()> + Send + Sync>;
pub type RegisterFn = Arc<dyn Fn() -> SlotFuture<()> + Send + Sync>;
/// Resolves to whether the broker knew the client.
pub type DeregisterFn = Arc<dyn Fn() -> SlotFuture<bool> + Send + Sync>;
pub type RegisterDeviceFn = Arc<dyn Fn(Device) -> SlotFuture<Device> + Send + Sync>;
pub type DeregisterDeviceFn = Arc<dyn Fn(Device) -> SlotFuture<()> + Send + Sync>;
pub type StartSessionFn = Arc<dyn Fn(Session) -> SlotFuture<Session> + Send + Sync>;
pub type StopSessionFn = Arc<dyn Fn(Session) -> SlotFuture<bool> + Send + Sync>;
pub type GetSessionsFn = Arc<dyn Fn() -> SlotFuture<SessionList> + Send + Sync>;
/// Wait until the named module reaches one of the statuses
/// (`Initialized` when none are given).
pub type ModuleLookupFn =
    Arc<dyn Fn(String, Vec<ModuleStatus>) -> SlotFuture<ProcessingModule> + Send + Sync>;
pub type ModuleFactory = Arc<dyn Fn() -> ProcessingModule + Send + Sync>;
pub type DiscoverModulesFn = Arc<dyn Fn() -> HashMap<String, ModuleFactory> + Send + Sync>;

// ── Kinds ────────────────────────────────────────────────────────────

/// Tag of every behavior a client can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BehaviorKind {
    Services,
    Subscriptions,
    Publish,
    Register,
    Devices,
    RunProcessingModules,
    InitProcessingModules,
    DiscoverProcessingModules,
    Sessions,
}

impl BehaviorKind {
    pub const ALL: [BehaviorKind; 9] = [
        BehaviorKind::Services,
        BehaviorKind::Subscriptions,
        BehaviorKind::Publish,
        BehaviorKind::Register,
        BehaviorKind::Devices,
        BehaviorKind::RunProcessingModules,
        BehaviorKind::InitProcessingModules,
        BehaviorKind::DiscoverProcessingModules,
        BehaviorKind::Sessions,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BehaviorKind::Services => "Services",
            BehaviorKind::Subscriptions => "Subscriptions",
            BehaviorKind::Publish => "Publish",
            BehaviorKind::Register => "Register",
            BehaviorKind::Devices => "Devices",
            BehaviorKind::RunProcessingModules => "RunProcessingModules",
            BehaviorKind::InitProcessingModules => "InitProcessingModules",
            BehaviorKind::DiscoverProcessingModules => "DiscoverProcessingModules",
            BehaviorKind::Sessions => "Sessions",
        }
    }

    /// Slot names of this kind, in declaration order.
    pub fn slot_names(&self) -> Vec<&'static str> {
        AnyBehavior::empty(*self)
            .slots()
            .into_iter()
            .map(|(name, _)| name)
            .collect()
    }
}

impl fmt::Display for BehaviorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BehaviorKind {
    type Err = NodeSdkError;

    /// Accepts `"RunProcessingModules"`, `"run_processing_modules"` and any
    /// casing of either.
    fn from_str(s: &str) -> Result<Self> {
        let wanted: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        BehaviorKind::ALL
            .into_iter()
            .find(|k| k.as_str().to_ascii_lowercase() == wanted)
            .ok_or_else(|| NodeSdkError::InvalidArgument(format!("unknown behavior: {s:?}")))
    }
}

/// Default required behaviors of a client.
pub const DEFAULT_REQUIRED: [BehaviorKind; 3] = [
    BehaviorKind::Services,
    BehaviorKind::Subscriptions,
    BehaviorKind::Publish,
];

/// Default optional behaviors of a client.
pub const DEFAULT_OPTIONAL: [BehaviorKind; 6] = [
    BehaviorKind::Register,
    BehaviorKind::Devices,
    BehaviorKind::RunProcessingModules,
    BehaviorKind::InitProcessingModules,
    BehaviorKind::DiscoverProcessingModules,
    BehaviorKind::Sessions,
];

/// Declared required / optional behaviors of a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Behaviors {
    pub required: Vec<BehaviorKind>,
    pub optional: Vec<BehaviorKind>,
}

impl Behaviors {
    pub fn contains(&self, kind: BehaviorKind) -> bool {
        self.required.contains(&kind) || self.optional.contains(&kind)
    }

    /// Required first, then optional.
    pub fn iter(&self) -> impl Iterator<Item = BehaviorKind> + '_ {
        self.required.iter().chain(self.optional.iter()).copied()
    }
}

// ── Behavior structs ─────────────────────────────────────────────────

/// Make service calls through the broker's service map.
#[derive(Clone, Default)]
pub struct Services {
    pub service_map: Option<Arc<dyn ServiceMap>>,
}

/// Subscribe to and unsubscribe from topics.  Use the `_regex` slots for
/// wildcard patterns.
#[derive(Clone, Default)]
pub struct Subscriptions {
    pub subscribe_regex: Option<SubscribeFn>,
    pub subscribe_topic: Option<SubscribeFn>,
    pub unsubscribe_regex: Option<SubscribeFn>,
    pub unsubscribe_topic: Option<SubscribeFn>,
}

/// Publish topic data records.
#[derive(Clone, Default)]
pub struct Publish {
    pub publish: Option<PublishFn>,
}

/// Explicitly re-register / deregister the node.
#[derive(Clone, Default)]
pub struct Register {
    pub register: Option<RegisterFn>,
    pub deregister: Option<DeregisterFn>,
}

#[derive(Clone, Default)]
pub struct Devices {
    pub register_device: Option<RegisterDeviceFn>,
    pub deregister_device: Option<DeregisterDeviceFn>,
}

/// Start and stop sessions at the broker.
#[derive(Clone, Default)]
pub struct Sessions {
    /// Sessions started by this node, by id.
    pub sessions: Option<HashMap<String, Session>>,
    pub start_session: Option<StartSessionFn>,
    pub stop_session: Option<StopSessionFn>,
    pub get_sessions: Option<GetSessionsFn>,
}

#[derive(Clone, Default)]
pub struct RunProcessingModules {
    pub get_module_instance: Option<ModuleLookupFn>,
}

/// Custom factories used when the node instantiates processing modules.
#[derive(Clone, Default)]
pub struct InitProcessingModules {
    pub module_factories: Option<HashMap<String, ModuleFactory>>,
}

#[derive(Clone, Default)]
pub struct DiscoverProcessingModules {
    pub discover_processing_modules: Option<DiscoverModulesFn>,
}

// ── Trait + type-erased wrapper ──────────────────────────────────────

/// Implemented by every behavior struct.
pub trait Behavior: Clone + Default + Send + Sync + 'static {
    const KIND: BehaviorKind;

    /// `(slot name, filled)` pairs in declaration order.
    fn slots(&self) -> Vec<(&'static str, bool)>;

    fn into_any(self) -> AnyBehavior;

    fn from_any(any: &AnyBehavior) -> Option<&Self>;

    fn from_any_mut(any: &mut AnyBehavior) -> Option<&mut Self>;

    fn is_implemented(&self) -> bool {
        self.slots().iter().all(|(_, filled)| *filled)
    }
}

macro_rules! behaviors {
    ($($ty:ident { $($slot:ident),+ $(,)? }),+ $(,)?) => {
        $(
            impl Behavior for $ty {
                const KIND: BehaviorKind = BehaviorKind::$ty;

                fn slots(&self) -> Vec<(&'static str, bool)> {
                    vec![$((stringify!($slot), self.$slot.is_some())),+]
                }

                fn into_any(self) -> AnyBehavior {
                    AnyBehavior::$ty(self)
                }

                fn from_any(any: &AnyBehavior) -> Option<&Self> {
                    match any {
                        AnyBehavior::$ty(b) => Some(b),
                        _ => None,
                    }
                }

                fn from_any_mut(any: &mut AnyBehavior) -> Option<&mut Self> {
                    match any {
                        AnyBehavior::$ty(b) => Some(b),
                        _ => None,
                    }
                }
            }

            impl fmt::Debug for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let mut s = f.debug_struct(stringify!($ty));
                    $(
                        s.field(
                            stringify!($slot),
                            &if self.$slot.is_some() { "<set>" } else { "<empty>" },
                        );
                    )+
                    s.finish()
                }
            }
        )+

        /// One behavior instance of any kind.
        #[derive(Clone, Debug)]
        pub enum AnyBehavior {
            $($ty($ty)),+
        }

        impl AnyBehavior {
            /// Fresh instance of `kind` with every slot empty.
            pub fn empty(kind: BehaviorKind) -> Self {
                match kind {
                    $(BehaviorKind::$ty => AnyBehavior::$ty($ty::default())),+
                }
            }

            pub fn kind(&self) -> BehaviorKind {
                match self {
                    $(AnyBehavior::$ty(_) => BehaviorKind::$ty),+
                }
            }

            pub fn slots(&self) -> Vec<(&'static str, bool)> {
                match self {
                    $(AnyBehavior::$ty(b) => b.slots()),+
                }
            }
        }

        $(
            impl From<$ty> for AnyBehavior {
                fn from(b: $ty) -> Self {
                    AnyBehavior::$ty(b)
                }
            }
        )+
    };
}

behaviors! {
    Services { service_map },
    Subscriptions { subscribe_regex, subscribe_topic, unsubscribe_regex, unsubscribe_topic },
    Publish { publish },
    Register { register, deregister },
    Devices { register_device, deregister_device },
    RunProcessingModules { get_module_instance },
    InitProcessingModules { module_factories },
    DiscoverProcessingModules { discover_processing_modules },
    Sessions { sessions, start_session, stop_session, get_sessions },
}

impl AnyBehavior {
    pub fn is_implemented(&self) -> bool {
        self.slots().iter().all(|(_, filled)| *filled)
    }

    pub fn missing_slots(&self) -> Vec<&'static str> {
        self.slots()
            .into_iter()
            .filter(|(_, filled)| !filled)
            .map(|(name, _)| name)
            .collect()
    }

    /// Empty every slot.
    pub fn clear(&mut self) {
        *self = AnyBehavior::empty(self.kind());
    }
}
