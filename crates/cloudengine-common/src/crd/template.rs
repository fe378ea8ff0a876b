//! Template Custom Resource Definition
//!
//! Templates are read-only workload definitions referenced by Experiments.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pod settings for an experiment workload
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    /// Container image
    pub image: String,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Container command override
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
}

/// VNC credentials exposed to experiment users
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VncConfig {
    /// Login name
    pub username: String,
    /// Login password
    pub password: String,
}

/// SSH credentials exposed to experiment users
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// Login name
    pub username: String,
    /// Login password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Supported ingress protocols
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IngressProtocol {
    /// Remote desktop over VNC
    Vnc,
    /// Shell over SSH
    Ssh,
}

impl IngressProtocol {
    /// Parse a template protocol string, case-insensitively
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "vnc" => Some(Self::Vnc),
            "ssh" => Some(Self::Ssh),
            _ => None,
        }
    }
}

/// Template data
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cloudengine.io",
    version = "v1",
    kind = "Template",
    plural = "templates",
    shortname = "cet",
    namespaced,
    printcolumn = r#"{"name":"Protocol","type":"string","jsonPath":".spec.ingressProtocol"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.ingressPort"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Workload pod settings
    pub pod_template: PodTemplate,

    /// Protocol users connect with (`vnc` or `ssh`)
    pub ingress_protocol: String,

    /// Container port serving the ingress protocol
    pub ingress_port: i32,

    /// VNC credentials when the protocol is VNC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vnc: Option<VncConfig>,

    /// SSH credentials when the protocol is SSH
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh: Option<SshConfig>,
}

impl TemplateSpec {
    /// Parsed ingress protocol, `None` if unsupported
    pub fn protocol(&self) -> Option<IngressProtocol> {
        IngressProtocol::parse(&self.ingress_protocol)
    }

    /// Lowercased protocol string used in service and port names
    pub fn protocol_name(&self) -> String {
        self.ingress_protocol.to_ascii_lowercase()
    }
}
