//! k8sd snap refresh client
//!
//! Talks to the k8sd API on the machine's node over HTTPS. Requests carry the
//! per-machine node token, read from the cluster's token Secret, in the
//! `node-token` header. Responses come wrapped in a `{"error", "metadata"}`
//! envelope.

use super::{RefreshClient, RefreshStatus, UpgradeOption};
use crate::config::RefreshSettings;
use crate::crd::Machine;
use crate::error::{Error, Result};
use crate::store::ClusterStore;
use async_trait::async_trait;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const K8SD_API_VERSION: &str = "1.0";
const SNAP_REFRESH_RPC: &str = "k8sd/snap/refresh";
const SNAP_REFRESH_STATUS_RPC: &str = "k8sd/snap/refresh-status";
const NODE_TOKEN_HEADER: &str = "node-token";

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapRefreshRequest {
    #[serde(skip_serializing_if = "String::is_empty")]
    channel: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    revision: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    local_path: String,
}

impl From<UpgradeOption> for SnapRefreshRequest {
    fn from(option: UpgradeOption) -> Self {
        match option {
            UpgradeOption::Channel(channel) => Self {
                channel,
                ..Default::default()
            },
            UpgradeOption::Revision(revision) => Self {
                revision,
                ..Default::default()
            },
            UpgradeOption::LocalPath(local_path) => Self {
                local_path,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapRefreshResponse {
    #[serde(rename = "changeID")]
    change_id: String,
}

#[derive(Debug, Serialize)]
struct SnapRefreshStatusRequest<'a> {
    #[serde(rename = "changeID")]
    change_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: String,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

/// Name of the Secret holding node tokens for a cluster.
pub fn token_secret_name(cluster_name: &str) -> String {
    format!("{}-token", cluster_name)
}

/// Secret entry holding the node token of one machine.
pub fn node_token_entry(machine_name: &str) -> String {
    format!("refresh-token::{}", machine_name)
}

/// Address the node agent is reachable on: InternalIP, else ExternalIP.
pub fn node_address(machine: &Machine) -> Result<&str> {
    machine
        .address_of_type("InternalIP")
        .or_else(|| machine.address_of_type("ExternalIP"))
        .ok_or_else(|| {
            Error::Refresh(format!(
                "machine {} reports no InternalIP or ExternalIP address",
                machine.name_any()
            ))
        })
}

fn decode_envelope<T: DeserializeOwned>(status: u16, body: &[u8]) -> Result<T> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| Error::Refresh(format!("failed to parse HTTP response: {}", e)))?;
    if !(200..300).contains(&status) {
        return Err(Error::Refresh(format!(
            "HTTP request failed with status code: {} ({})",
            status, envelope.error
        )));
    }
    if !envelope.error.is_empty() {
        return Err(Error::Refresh(format!("k8sd request failed: {}", envelope.error)));
    }
    let metadata = envelope
        .metadata
        .ok_or_else(|| Error::Refresh("k8sd response carries no metadata".to_string()))?;
    serde_json::from_value(metadata)
        .map_err(|e| Error::Refresh(format!("failed to parse HTTP response: {}", e)))
}

/// Refresh client for k8sd
pub struct K8sdRefreshClient {
    http: reqwest::Client,
    store: Arc<dyn ClusterStore>,
    port: u16,
}

impl K8sdRefreshClient {
    pub fn new(store: Arc<dyn ClusterStore>, settings: &RefreshSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            store,
            port: settings.k8sd_port,
        })
    }

    fn endpoint(&self, machine: &Machine, rpc: &str) -> Result<String> {
        Ok(format!(
            "https://{}:{}/{}/{}",
            node_address(machine)?,
            self.port,
            K8SD_API_VERSION,
            rpc
        ))
    }

    async fn node_token(&self, machine: &Machine) -> Result<String> {
        let namespace = machine.namespace().unwrap_or_default();
        let secret_name = token_secret_name(&machine.spec.cluster_name);
        let secret = self
            .store
            .get_secret(&namespace, &secret_name)
            .await?
            .ok_or_else(|| Error::Refresh(format!("token secret {} not found", secret_name)))?;

        let entry = node_token_entry(&machine.name_any());
        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get(&entry))
            .ok_or_else(|| {
                Error::Refresh(format!(
                    "node-token for machine {} not found",
                    machine.name_any()
                ))
            })?;
        String::from_utf8(raw.0.clone())
            .map_err(|_| Error::Refresh(format!("node-token entry {} is not UTF-8", entry)))
    }

    async fn call<B, T>(&self, machine: &Machine, rpc: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let url = self.endpoint(machine, rpc)?;
        let token = self.node_token(machine).await?;
        debug!("POST {} for machine {}", url, machine.name_any());

        let response = self
            .http
            .post(&url)
            .header(NODE_TOKEN_HEADER, token)
            .json(body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;
        decode_envelope(status, &bytes)
    }
}

#[async_trait]
impl RefreshClient for K8sdRefreshClient {
    async fn start_refresh(&self, machine: &Machine, target: &str) -> Result<String> {
        let option: UpgradeOption = target.parse()?;
        let request = SnapRefreshRequest::from(option);
        let response: SnapRefreshResponse = self.call(machine, SNAP_REFRESH_RPC, &request).await?;
        Ok(response.change_id)
    }

    async fn refresh_status(&self, machine: &Machine, change_id: &str) -> Result<RefreshStatus> {
        let request = SnapRefreshStatusRequest { change_id };
        self.call(machine, SNAP_REFRESH_STATUS_RPC, &request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{MachineAddress, MachineSpec, MachineStatus};
    use crate::testing::MemoryStore;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;

    fn machine_with_addresses(addresses: &[(&str, &str)]) -> Machine {
        let mut machine = Machine::new(
            "worker-0",
            MachineSpec {
                cluster_name: "c1".to_string(),
                ..Default::default()
            },
        );
        machine.metadata.namespace = Some("default".to_string());
        machine.status = Some(MachineStatus {
            addresses: Some(
                addresses
                    .iter()
                    .map(|(t, a)| MachineAddress {
                        type_: t.to_string(),
                        address: a.to_string(),
                    })
                    .collect(),
            ),
            ..Default::default()
        });
        machine
    }

    fn client(store: Arc<MemoryStore>) -> K8sdRefreshClient {
        K8sdRefreshClient::new(store, &RefreshSettings::default()).unwrap()
    }

    #[test]
    fn test_refresh_request_body() {
        let body = SnapRefreshRequest::from(UpgradeOption::LocalPath("/opt/k8s.snap".to_string()));
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"localPath": "/opt/k8s.snap"})
        );
        let body = SnapRefreshStatusRequest { change_id: "12" };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"changeID": "12"})
        );
    }

    #[test]
    fn test_endpoint_prefers_internal_ip() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store);

        let machine =
            machine_with_addresses(&[("ExternalIP", "203.0.113.5"), ("InternalIP", "10.0.0.5")]);
        assert_eq!(
            client.endpoint(&machine, SNAP_REFRESH_RPC).unwrap(),
            "https://10.0.0.5:6400/1.0/k8sd/snap/refresh"
        );

        let machine = machine_with_addresses(&[("ExternalIP", "203.0.113.5")]);
        assert_eq!(node_address(&machine).unwrap(), "203.0.113.5");

        let machine = machine_with_addresses(&[("Hostname", "worker-0")]);
        assert!(matches!(node_address(&machine), Err(Error::Refresh(_))));
    }

    #[test]
    fn test_decode_envelope() {
        let ok: SnapRefreshResponse =
            decode_envelope(200, br#"{"type":"sync","metadata":{"changeID":"7"}}"#).unwrap();
        assert_eq!(ok.change_id, "7");

        let err = decode_envelope::<SnapRefreshResponse>(500, br#"{"error":"boom"}"#).unwrap_err();
        assert!(err.to_string().contains("500"));

        let err =
            decode_envelope::<SnapRefreshResponse>(200, br#"{"error":"denied"}"#).unwrap_err();
        assert!(err.to_string().contains("denied"));

        assert!(decode_envelope::<SnapRefreshResponse>(200, b"not json").is_err());
    }

    #[tokio::test]
    async fn test_node_token_lookup() {
        let store = Arc::new(MemoryStore::new());
        let machine = machine_with_addresses(&[("InternalIP", "10.0.0.5")]);

        let client = client(store.clone());
        assert!(matches!(
            client.node_token(&machine).await,
            Err(Error::Refresh(_))
        ));

        store.insert_secret(Secret {
            metadata: ObjectMeta {
                name: Some("c1-token".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(
                [(
                    "refresh-token::worker-0".to_string(),
                    ByteString(b"s3cr3t".to_vec()),
                )]
                .into(),
            ),
            ..Default::default()
        });
        assert_eq!(client.node_token(&machine).await.unwrap(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_invalid_option_fails_before_any_request() {
        let store = Arc::new(MemoryStore::new());
        let client = client(store);
        let machine = machine_with_addresses(&[("InternalIP", "10.0.0.5")]);
        let err = client.start_refresh(&machine, "v1.31").await.unwrap_err();
        assert!(matches!(err, Error::InvalidUpgradeOption(_)));
    }
}
