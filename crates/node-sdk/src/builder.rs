//! Builder pattern for constructing a [`Client`].

use std::sync::Arc;

use nl_protocol::ClientSpec;

use crate::behavior::{BehaviorKind, Behaviors, DEFAULT_OPTIONAL, DEFAULT_REQUIRED};
use crate::client::{Client, DEFAULT_CLIENT_NAME};
use crate::config::BrokerConfig;
use crate::error::{NodeSdkError, Result};
use crate::lifecycle::ClientProtocol;
use crate::pipeline::HookInterceptor;

/// Fluent builder for [`Client`].
///
/// # Example
///
/// ```rust,ignore
/// let client = Client::builder()
///     .name("thermometer")
///     .tags(vec!["lab".to_string()])
///     .required([BehaviorKind::Services, BehaviorKind::Publish])
///     .optional_names(["register"])
///     .protocol(MyBrokerProtocol::new())
///     .config(BrokerConfig::load_or_default("nodelink.toml").apply_env())
///     .build()?;
/// ```
pub struct ClientBuilder {
    spec: ClientSpec,
    required: Vec<BehaviorKind>,
    optional: Vec<BehaviorKind>,
    protocol: Option<Arc<dyn ClientProtocol>>,
    config: BrokerConfig,
    interceptors: Vec<Arc<dyn HookInterceptor>>,
    /// First bad behavior name; reported by `build`.
    invalid: Option<NodeSdkError>,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self {
            spec: ClientSpec::default(),
            required: DEFAULT_REQUIRED.to_vec(),
            optional: DEFAULT_OPTIONAL.to_vec(),
            protocol: None,
            config: BrokerConfig::default(),
            interceptors: Vec::new(),
            invalid: None,
        }
    }

    // ── Identity / metadata ──────────────────────────────────────────

    /// Set every initial field at once.
    pub fn spec(mut self, spec: ClientSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.spec.name = name.into();
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.spec.description = description.into();
        self
    }

    /// Set optional tags for grouping/filtering.
    pub fn tags(mut self, tags: impl Into<Vec<String>>) -> Self {
        self.spec.tags = tags.into();
        self
    }

    /// Mark the node as dedicated to running processing modules.
    pub fn dedicated_processing_node(mut self, dedicated: bool) -> Self {
        self.spec.is_dedicated_processing_node = dedicated;
        self
    }

    /// Names of the processing modules this node can run.
    pub fn processing_modules(mut self, names: impl Into<Vec<String>>) -> Self {
        self.spec.processing_modules = names.into();
        self
    }

    // ── Behaviors ────────────────────────────────────────────────────

    /// Replace the required behaviors (default: services, subscriptions, publish).
    pub fn required(mut self, kinds: impl IntoIterator<Item = BehaviorKind>) -> Self {
        self.required = kinds.into_iter().collect();
        self
    }

    /// Replace the optional behaviors (default: every other kind).
    pub fn optional(mut self, kinds: impl IntoIterator<Item = BehaviorKind>) -> Self {
        self.optional = kinds.into_iter().collect();
        self
    }

    /// [`required`](Self::required) by name, e.g. `"run_processing_modules"`.
    pub fn required_names<S: AsRef<str>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.required = self.parse_names(names);
        self
    }

    /// [`optional`](Self::optional) by name.
    pub fn optional_names<S: AsRef<str>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.optional = self.parse_names(names);
        self
    }

    fn parse_names<S: AsRef<str>>(&mut self, names: impl IntoIterator<Item = S>) -> Vec<BehaviorKind> {
        let mut kinds = Vec::new();
        for name in names {
            match name.as_ref().parse::<BehaviorKind>() {
                Ok(kind) => kinds.push(kind),
                Err(e) => {
                    self.invalid.get_or_insert(e);
                }
            }
        }
        kinds
    }

    // ── Protocol ─────────────────────────────────────────────────────

    /// The protocol implementation driving this client.  Required.
    pub fn protocol(mut self, protocol: impl ClientProtocol) -> Self {
        self.protocol = Some(Arc::new(protocol));
        self
    }

    pub fn protocol_arc(mut self, protocol: Arc<dyn ClientProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a hook interceptor to this client's runner only.
    pub fn interceptor(mut self, interceptor: impl HookInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Build the [`Client`].
    ///
    /// Fails with [`NodeSdkError::InvalidArgument`] on an unknown behavior
    /// name, a kind declared both required and optional, or a missing
    /// protocol.
    pub fn build(self) -> Result<Client> {
        if let Some(e) = self.invalid {
            return Err(e);
        }
        let protocol = self
            .protocol
            .ok_or_else(|| NodeSdkError::InvalidArgument("a client needs a protocol".into()))?;

        let required = dedup(self.required);
        let optional = dedup(self.optional);
        if let Some(kind) = required.iter().find(|k| optional.contains(k)) {
            return Err(NodeSdkError::InvalidArgument(format!(
                "behavior {kind} declared both required and optional"
            )));
        }

        let mut spec = self.spec;
        if spec.name.is_empty() {
            spec.name = DEFAULT_CLIENT_NAME.into();
        }

        let client = Client::from_parts(spec, Behaviors { required, optional }, protocol, self.config);
        for interceptor in self.interceptors {
            client.runner().intercept_arc(interceptor);
        }
        Ok(client)
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop repeated kinds, keeping first occurrences in order.
fn dedup(kinds: Vec<BehaviorKind>) -> Vec<BehaviorKind> {
    let mut out = Vec::with_capacity(kinds.len());
    for kind in kinds {
        if !out.contains(&kind) {
            out.push(kind);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubProtocol;

    #[test]
    fn defaults_match_the_standard_behavior_sets() {
        let client = ClientBuilder::new()
            .protocol(StubProtocol::default())
            .build()
            .unwrap();
        assert_eq!(client.behaviors().required, DEFAULT_REQUIRED.to_vec());
        assert_eq!(client.behaviors().optional, DEFAULT_OPTIONAL.to_vec());
    }

    #[test]
    fn missing_protocol_is_invalid() {
        let err = ClientBuilder::new().build().unwrap_err();
        assert!(matches!(err, NodeSdkError::InvalidArgument(_)));
    }

    #[test]
    fn unknown_behavior_name_is_invalid() {
        let err = ClientBuilder::new()
            .required_names(["services", "teleport"])
            .protocol(StubProtocol::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::InvalidArgument(_)));
    }

    #[test]
    fn overlap_is_invalid_and_duplicates_collapse() {
        let err = ClientBuilder::new()
            .required([BehaviorKind::Publish])
            .optional([BehaviorKind::Publish])
            .protocol(StubProtocol::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, NodeSdkError::InvalidArgument(_)));

        let client = ClientBuilder::new()
            .required_names(["publish", "Publish", "services"])
            .optional([])
            .protocol(StubProtocol::default())
            .build()
            .unwrap();
        assert_eq!(
            client.behaviors().required,
            vec![BehaviorKind::Publish, BehaviorKind::Services]
        );
    }

    #[test]
    fn identity_fields_become_the_initial_spec() {
        let client = ClientBuilder::new()
            .name("lab-node")
            .description("bench sensors")
            .tags(vec!["lab".to_string()])
            .dedicated_processing_node(true)
            .processing_modules(vec!["smoothing".to_string()])
            .protocol(StubProtocol::default())
            .build()
            .unwrap();
        let initial = client.initial_spec();
        assert_eq!(initial.name, "lab-node");
        assert_eq!(initial.tags, vec!["lab"]);
        assert!(initial.is_dedicated_processing_node);
        assert_eq!(initial.processing_modules, vec!["smoothing"]);
        assert_eq!(client.spec(), initial);
    }
}
