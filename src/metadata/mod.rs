//! The metadata record sent at the start of every intake request.
//!
//! Three layers make up the record: the base built from configuration and
//! [`SystemInfo`], cloud metadata fetched in the background, and extra
//! metadata supplied by the host platform. They are stored separately and
//! merged in that order, so rebuilding the base never loses the other two.

use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    config::Config,
    intake::{EventKind, encoder, truncate::TruncationLimits},
    metadata::system::SystemInfo,
};

pub mod cloud;
pub mod system;

/// Deep-merges `patch` into `target`. Objects merge key by key, anything else
/// in `patch` replaces what is in `target`.
pub fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}

fn insert_opt(map: &mut Map<String, Value>, key: &str, value: Option<&str>) {
    if let Some(value) = value {
        map.insert(key.to_string(), Value::String(value.to_string()));
    }
}

fn name_version(name: &str, version: Option<&str>) -> Value {
    let mut part = Map::new();
    part.insert("name".to_string(), Value::String(name.to_string()));
    insert_opt(&mut part, "version", version);
    Value::Object(part)
}

fn build_service(config: &Config, include_activation_method: bool) -> Value {
    let mut agent = Map::new();
    insert_opt(&mut agent, "name", config.agent_name.as_deref());
    insert_opt(&mut agent, "version", config.agent_version.as_deref());
    if include_activation_method {
        insert_opt(
            &mut agent,
            "activation_method",
            config.agent_activation_method.as_deref(),
        );
    }

    let mut service = Map::new();
    insert_opt(&mut service, "name", config.service_name.as_deref());
    service.insert("environment".to_string(), json!(config.environment));
    insert_opt(&mut service, "version", config.service_version.as_deref());
    service.insert("agent".to_string(), Value::Object(agent));
    service.insert("language".to_string(), json!({ "name": config.language_name }));
    if let Some(runtime) = &config.runtime_name {
        service.insert(
            "runtime".to_string(),
            name_version(runtime, config.runtime_version.as_deref()),
        );
    }
    if let Some(framework) = &config.framework_name {
        service.insert(
            "framework".to_string(),
            name_version(framework, config.framework_version.as_deref()),
        );
    }
    if let Some(node_name) = &config.service_node_name {
        if config.is_lambda() {
            warn!("METADATA | Ignoring service_node_name '{node_name}' when running on AWS Lambda");
        } else {
            service.insert("node".to_string(), json!({ "configured_name": node_name }));
        }
    }
    Value::Object(service)
}

fn build_kubernetes(config: &Config, system: &SystemInfo) -> Option<Value> {
    let pod_uid = config
        .kubernetes_pod_uid
        .as_deref()
        .or(system.cgroup.pod_uid.as_deref());
    let mut pod_name = config.kubernetes_pod_name.as_deref();
    if pod_name.is_none() && system.cgroup.pod_uid.is_some() {
        // The pod name is the hostname unless the downward API says otherwise.
        pod_name = system.detected_hostname.as_deref();
    }

    let mut kubernetes = Map::new();
    insert_opt(
        &mut kubernetes,
        "namespace",
        config.kubernetes_namespace.as_deref(),
    );
    if let Some(node) = &config.kubernetes_node_name {
        kubernetes.insert("node".to_string(), json!({ "name": node }));
    }
    let mut pod = Map::new();
    insert_opt(&mut pod, "name", pod_name);
    insert_opt(&mut pod, "uid", pod_uid);
    if !pod.is_empty() {
        kubernetes.insert("pod".to_string(), Value::Object(pod));
    }
    (!kubernetes.is_empty()).then_some(Value::Object(kubernetes))
}

fn build_system(config: &Config, system: &SystemInfo) -> Value {
    let mut out = Map::new();
    out.insert("architecture".to_string(), json!(system.architecture));
    out.insert("platform".to_string(), json!(system.platform));
    insert_opt(
        &mut out,
        "detected_hostname",
        system.detected_hostname.as_deref(),
    );
    insert_opt(&mut out, "configured_hostname", config.hostname.as_deref());
    let container_id = config
        .container_id
        .as_deref()
        .or(system.cgroup.container_id.as_deref());
    if let Some(id) = container_id {
        out.insert("container".to_string(), json!({ "id": id }));
    }
    if let Some(kubernetes) = build_kubernetes(config, system) {
        out.insert("kubernetes".to_string(), kubernetes);
    }
    Value::Object(out)
}

/// Builds the metadata record derived from configuration alone.
#[must_use]
pub fn build_base(config: &Config, system: &SystemInfo, include_activation_method: bool) -> Value {
    let mut process = Map::new();
    process.insert("pid".to_string(), json!(system.pid));
    if let Some(ppid) = system.ppid {
        process.insert("ppid".to_string(), json!(ppid));
    }
    process.insert("title".to_string(), json!(system.title));
    process.insert("argv".to_string(), json!(system.argv));

    let mut metadata = Map::new();
    metadata.insert(
        "service".to_string(),
        build_service(config, include_activation_method),
    );
    metadata.insert("process".to_string(), Value::Object(process));
    metadata.insert("system".to_string(), build_system(config, system));
    if !config.global_labels.is_empty() {
        metadata.insert(
            "labels".to_string(),
            Value::Object(config.global_labels.clone()),
        );
    }
    Value::Object(metadata)
}

#[derive(Debug)]
pub struct MetadataManager {
    system: SystemInfo,
    limits: TruncationLimits,
    expects_extra: bool,
    include_activation_method: bool,
    base: Value,
    cloud: Option<Value>,
    extra: Option<Value>,
    merged: Value,
    encoded: Vec<u8>,
}

impl MetadataManager {
    #[must_use]
    pub fn new(config: &Config, system: SystemInfo) -> Self {
        let mut manager = MetadataManager {
            system,
            limits: TruncationLimits::from_config(config),
            expects_extra: config.expects_extra_metadata(),
            // Unknown server versions get the field until proven otherwise.
            include_activation_method: true,
            base: Value::Null,
            cloud: None,
            extra: None,
            merged: Value::Null,
            encoded: Vec::new(),
        };
        manager.rebuild(config);
        manager
    }

    /// Regenerates the configuration layer, keeping cloud and extra metadata.
    pub fn rebuild(&mut self, config: &Config) {
        self.limits = TruncationLimits::from_config(config);
        self.expects_extra = config.expects_extra_metadata();
        self.base = build_base(config, &self.system, self.include_activation_method);
        self.remerge();
    }

    fn remerge(&mut self) {
        let mut merged = self.base.clone();
        if let Some(cloud) = &self.cloud {
            deep_merge(&mut merged, json!({ "cloud": cloud }));
        }
        if let Some(extra) = &self.extra {
            deep_merge(&mut merged, extra.clone());
        }
        self.encoded = encoder::encode(EventKind::Metadata, merged.clone(), &self.limits);
        self.merged = merged;
    }

    /// Returns `true` the first time cloud metadata is set.
    pub fn set_cloud_metadata(&mut self, cloud: Value) -> bool {
        if self.cloud.is_some() {
            debug!("METADATA | Cloud metadata already set, ignoring");
            return false;
        }
        self.cloud = Some(cloud);
        self.remerge();
        true
    }

    /// Merges platform supplied metadata over everything else and opens the
    /// extra metadata gate.
    pub fn set_extra_metadata(&mut self, extra: Value) {
        let extra = if extra.is_null() { json!({}) } else { extra };
        match &mut self.extra {
            Some(existing) => deep_merge(existing, extra),
            None => self.extra = Some(extra),
        }
        self.remerge();
    }

    pub fn set_activation_method_supported(&mut self, config: &Config, supported: bool) {
        if self.include_activation_method != supported {
            self.include_activation_method = supported;
            self.rebuild(config);
        }
    }

    /// Whether uploads may start, i.e. extra metadata arrived if required.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        !self.expects_extra || self.extra.is_some()
    }

    #[must_use]
    pub fn metadata(&self) -> &Value {
        &self.merged
    }

    /// The ndjson line for the current metadata.
    #[must_use]
    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }
}
