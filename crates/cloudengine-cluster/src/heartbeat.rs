//! Heartbeat ingest
//!
//! Agents running on registered clusters post a [`Heartbeat`] every few
//! seconds. Each accepted heartbeat refreshes the Cluster's `Heartbeat`
//! condition and records what the agent reported about its resources and
//! the last command it applied. The cluster controller picks the change up
//! through its watch and re-evaluates the phase.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use cloudengine_common::crd::{Cluster, ClusterConditionType, ConditionStatus};
use cloudengine_common::store::{persist_status, ObjectApi};
use cloudengine_common::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// API group/version/kind of a reported resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct GroupVersionKind {
    /// API group
    #[serde(default)]
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

/// Which registered Cluster a heartbeat belongs to
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterIdentity {
    /// Namespace of the Cluster object
    pub namespace: String,
    /// Name of the Cluster object
    pub name: String,
    /// Cluster ID the agent was given; empty on first contact
    #[serde(default)]
    pub cluster_id: String,
}

/// Condition as reported by an agent
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommonCondition {
    /// Condition type
    #[serde(rename = "type")]
    pub type_: String,
    /// "True", "False" or "Unknown"
    pub status: String,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
}

/// State of one resource on the remote cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    /// Resource type
    pub gvk: GroupVersionKind,
    /// Resource name
    pub resource: String,
    /// Conditions reported for the resource
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CommonCondition>,
    /// Resource version on the remote cluster
    #[serde(default)]
    pub resource_version: String,
}

impl ResourceStatus {
    fn failing(&self) -> Option<&CommonCondition> {
        self.conditions.iter().find(|c| c.status == "False")
    }
}

/// Outcome of the last command the agent applied
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CommandResult {
    /// Whether the command applied cleanly
    pub ok: bool,
    /// Failure detail
    #[serde(default)]
    pub message: String,
}

/// Kind of command sent to an agent
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum CommandType {
    /// Create or update a resource
    #[serde(rename = "APPLY")]
    Apply,
    /// Delete a resource
    #[serde(rename = "DELETE")]
    Delete,
}

/// Command for an agent to execute on its cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct Command {
    /// Apply or delete
    #[serde(rename = "type")]
    pub type_: CommandType,
    /// Resource type
    pub gvk: GroupVersionKind,
    /// Resource name
    pub resource: String,
    /// Serialized manifest
    #[serde(default)]
    pub content: String,
}

/// Heartbeat payload posted by an agent
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Sending cluster
    pub cluster: ClusterIdentity,
    /// Resource states observed since the last heartbeat
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceStatus>,
    /// Result of the last command, if one was applied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_result: Option<CommandResult>,
    /// Agent-side unix timestamp
    pub time: i64,
}

/// Reply to a heartbeat
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Whether the heartbeat was accepted
    pub ok: bool,
    /// Rejection reason
    #[serde(default)]
    pub message: String,
    /// Identity the agent should use from now on
    pub cluster: ClusterIdentity,
    /// Outstanding command for the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
}

impl HeartbeatResponse {
    fn rejected(cluster: ClusterIdentity, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            cluster,
            command: None,
        }
    }
}

/// Applies heartbeats to Cluster status
pub struct HeartbeatIngest {
    clusters: Arc<dyn ObjectApi<Cluster>>,
}

impl HeartbeatIngest {
    /// Create an ingest writing through `clusters`
    pub fn new(clusters: Arc<dyn ObjectApi<Cluster>>) -> Self {
        Self { clusters }
    }

    /// Apply a heartbeat received at `now`
    ///
    /// Unknown clusters and mismatched cluster IDs are rejected in the
    /// response rather than returned as errors.
    pub async fn handle(&self, hb: Heartbeat, now: DateTime<Utc>) -> Result<HeartbeatResponse> {
        let identity = hb.cluster.clone();
        let Some(cluster) = self
            .clusters
            .get_opt(Some(&identity.namespace), &identity.name)
            .await?
        else {
            warn!(namespace = %identity.namespace, name = %identity.name, "heartbeat from unregistered cluster");
            return Ok(HeartbeatResponse::rejected(
                identity.clone(),
                format!(
                    "cluster {}/{} is not registered",
                    identity.namespace, identity.name
                ),
            ));
        };

        let assigned = cluster.cluster_id().map(str::to_string);
        if let Some(assigned) = assigned.as_deref() {
            if !identity.cluster_id.is_empty() && identity.cluster_id != assigned {
                warn!(
                    name = %identity.name,
                    reported = %identity.cluster_id,
                    "heartbeat cluster ID mismatch"
                );
                return Ok(HeartbeatResponse::rejected(
                    identity,
                    "cluster ID does not match the registered cluster",
                ));
            }
        }

        let mut updated = cluster.clone();
        let status = updated.status.get_or_insert_with(Default::default);
        let conditions = &mut status.conditions;

        conditions.set(
            ClusterConditionType::Heartbeat,
            ConditionStatus::True,
            "HeartbeatReceived",
            "",
            now,
        );
        if !conditions.is_true(ClusterConditionType::FirstConnect) {
            info!(name = %identity.name, "first heartbeat received");
            conditions.set(
                ClusterConditionType::FirstConnect,
                ConditionStatus::True,
                "FirstHeartbeat",
                "",
                now,
            );
        }

        let failing: Vec<String> = hb
            .resources
            .iter()
            .filter_map(|r| {
                r.failing()
                    .map(|c| format!("{} {}: {}", r.gvk.kind, r.resource, c.message))
            })
            .collect();
        if failing.is_empty() {
            conditions.set(
                ClusterConditionType::ResourceSync,
                ConditionStatus::True,
                "Synced",
                "",
                now,
            );
        } else {
            conditions.set(
                ClusterConditionType::ResourceSync,
                ConditionStatus::False,
                "ResourceNotSynced",
                failing.join("; "),
                now,
            );
        }

        if let Some(result) = hb.command_result.as_ref() {
            let reason = if result.ok { "CommandApplied" } else { "CommandFailed" };
            conditions.set(
                ClusterConditionType::CommandApply,
                ConditionStatus::from(result.ok),
                reason,
                result.message.clone(),
                now,
            );
        }

        persist_status(self.clusters.as_ref(), &updated).await?;
        debug!(name = %identity.name, resources = hb.resources.len(), "heartbeat applied");

        Ok(HeartbeatResponse {
            ok: true,
            message: String::new(),
            cluster: ClusterIdentity {
                cluster_id: assigned.unwrap_or_default(),
                ..identity
            },
            command: None,
        })
    }
}

/// Build the heartbeat router
pub fn heartbeat_routes(ingest: Arc<HeartbeatIngest>) -> Router {
    Router::new()
        .route("/api/v1/heartbeat", post(receive_heartbeat))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(ingest)
}

/// Serve the heartbeat router on `addr` until the listener fails
pub async fn serve(addr: std::net::SocketAddr, ingest: Arc<HeartbeatIngest>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "heartbeat server started");
    axum::serve(listener, heartbeat_routes(ingest)).await
}

/// Handle `POST /api/v1/heartbeat`
async fn receive_heartbeat(
    State(ingest): State<Arc<HeartbeatIngest>>,
    Json(hb): Json<Heartbeat>,
) -> std::result::Result<(StatusCode, Json<HeartbeatResponse>), (StatusCode, String)> {
    let response = ingest.handle(hb, Utc::now()).await.map_err(|e| {
        warn!(error = %e, "failed to apply heartbeat");
        (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    let code = if response.ok {
        StatusCode::OK
    } else {
        StatusCode::CONFLICT
    };
    Ok((code, Json(response)))
}
