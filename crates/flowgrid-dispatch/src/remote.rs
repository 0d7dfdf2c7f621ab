//! HTTP-backed orchestrator and flow container gateway.
//!
//! Both speak plain HTTP/1.1 over a fresh TCP connection per call. The
//! orchestrator targets the cluster REST API (typically through a local
//! authenticating proxy); the gateway targets the per-execution service in
//! front of a flow container.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use serde_json::Value;
use tracing::{debug, warn};

use flowgrid_core::config::KubernetesConfig;
use flowgrid_core::{
    AutoscalerObject, AutoscalerSpec, ContainerOrchestrator, ContainerRecommendation,
    OrchestratorError, OrchestratorResult, PodInfo, PodSpec, Quantity, ServiceSpec,
};
use flowgrid_state::Execution;

use crate::error::{DispatchError, DispatchResult};
use crate::gateway::FlowContainerGateway;
use crate::pod::service_name;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = "flowgrid-dispatch/0.1";

struct HttpReply {
    status: u16,
    body: Bytes,
}

impl HttpReply {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// `http://host:port/` → `host:port`. Only plain HTTP is supported.
fn authority_of(base_url: &str) -> OrchestratorResult<String> {
    let rest = base_url
        .trim()
        .strip_prefix("http://")
        .ok_or_else(|| OrchestratorError::Request(format!("unsupported endpoint: {base_url}")))?;
    let authority = rest.split('/').next().unwrap_or_default();
    if authority.is_empty() {
        return Err(OrchestratorError::Request(format!("missing host in {base_url}")));
    }
    if authority.contains(':') {
        Ok(authority.to_string())
    } else {
        Ok(format!("{authority}:80"))
    }
}

/// One request on a fresh connection, bounded by `timeout`.
async fn send(
    authority: &str,
    method: http::Method,
    path: &str,
    body: Option<Vec<u8>>,
    timeout: Duration,
) -> OrchestratorResult<HttpReply> {
    let uri = format!("http://{authority}{path}");
    let call = async {
        let stream = tokio::net::TcpStream::connect(authority)
            .await
            .map_err(|e| OrchestratorError::Request(format!("connect {authority}: {e}")))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| OrchestratorError::Request(format!("handshake {authority}: {e}")))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", authority)
            .header("user-agent", USER_AGENT)
            .header("accept", "application/json");
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let req = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .map_err(|e| OrchestratorError::Request(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| OrchestratorError::Request(format!("{uri}: {e}")))?;
        let status = resp.status().as_u16();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| OrchestratorError::Request(format!("{uri}: {e}")))?
            .to_bytes();
        Ok(HttpReply { status, body })
    };

    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => {
            debug!(%uri, "request timed out");
            Err(OrchestratorError::Timeout(timeout.as_secs()))
        }
    }
}

/// Percent-encode a query value.
fn encode_query(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Parse an RFC 3339 UTC timestamp (`2024-05-01T12:00:00Z`) to epoch millis.
fn parse_timestamp(s: &str) -> Option<u64> {
    let s = s.strip_suffix('Z')?;
    let (date, time) = s.split_once('T')?;
    let mut date_parts = date.splitn(3, '-').map(|p| p.parse::<i64>().ok());
    let (year, month, day) = (date_parts.next()??, date_parts.next()??, date_parts.next()??);
    let time = time.split('.').next()?;
    let mut time_parts = time.splitn(3, ':').map(|p| p.parse::<i64>().ok());
    let (hour, minute, second) = (time_parts.next()??, time_parts.next()??, time_parts.next()??);
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }

    // Days since 1970-01-01 in the proleptic Gregorian calendar.
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    let days = era * 146_097 + doe - 719_468;

    let secs = days * 86_400 + hour * 3600 + minute * 60 + second;
    u64::try_from(secs).ok().map(|s| s * 1000)
}

fn created_at(metadata: &Value) -> u64 {
    metadata["creationTimestamp"]
        .as_str()
        .and_then(parse_timestamp)
        .unwrap_or_default()
}

fn parse_pod_list(body: &[u8]) -> OrchestratorResult<Vec<PodInfo>> {
    let list: Value =
        serde_json::from_slice(body).map_err(|e| OrchestratorError::Decode(e.to_string()))?;
    let items = list["items"].as_array().cloned().unwrap_or_default();
    Ok(items
        .iter()
        .filter_map(|item| {
            let metadata = &item["metadata"];
            let name = metadata["name"].as_str()?.to_string();
            let labels = metadata["labels"]
                .as_object()
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                        .collect()
                })
                .unwrap_or_default();
            Some(PodInfo {
                name,
                labels,
                created_at: created_at(metadata),
            })
        })
        .collect())
}

fn quantity_value(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => Quantity::parse(s).ok().map(|q| q.base_value()),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_autoscaler(body: &[u8]) -> OrchestratorResult<AutoscalerObject> {
    let object: Value =
        serde_json::from_slice(body).map_err(|e| OrchestratorError::Decode(e.to_string()))?;
    let metadata = &object["metadata"];
    let name = metadata["name"]
        .as_str()
        .ok_or_else(|| OrchestratorError::Decode("autoscaler without a name".to_string()))?
        .to_string();
    let recommendations = object["status"]["recommendation"]["containerRecommendations"]
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    Some(ContainerRecommendation {
                        container_name: entry["containerName"].as_str()?.to_string(),
                        cpu: quantity_value(&entry["target"]["cpu"])?,
                        memory: quantity_value(&entry["target"]["memory"])?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(AutoscalerObject {
        name,
        created_at: created_at(metadata),
        recommendations,
    })
}

// ── Orchestrator ───────────────────────────────────────────────────

/// Talks to the cluster REST API.
pub struct HttpOrchestrator {
    authority: String,
    namespace: String,
    timeout: Duration,
}

impl HttpOrchestrator {
    pub fn new(config: &KubernetesConfig) -> OrchestratorResult<Self> {
        Ok(Self {
            authority: authority_of(&config.api_server)?,
            namespace: config.namespace.clone(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn core_path(&self, kind: &str) -> String {
        format!("/api/v1/namespaces/{}/{kind}", self.namespace)
    }

    fn autoscaler_path(&self) -> String {
        format!(
            "/apis/autoscaling.k8s.io/v1/namespaces/{}/verticalpodautoscalers",
            self.namespace
        )
    }

    async fn create(&self, path: String, name: &str, manifest: Value) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&manifest).map_err(|e| OrchestratorError::Decode(e.to_string()))?;
        let reply = send(&self.authority, http::Method::POST, &path, Some(body), self.timeout).await?;
        match reply.status {
            409 => Err(OrchestratorError::AlreadyExists(name.to_string())),
            _ if reply.is_success() => Ok(()),
            code => Err(OrchestratorError::Status {
                code,
                body: reply.text(),
            }),
        }
    }

    async fn delete(&self, path: String, name: &str) -> OrchestratorResult<()> {
        let reply = send(&self.authority, http::Method::DELETE, &path, None, self.timeout).await?;
        match reply.status {
            404 => {
                debug!(%name, "delete of missing object ignored");
                Ok(())
            }
            _ if reply.is_success() => Ok(()),
            code => Err(OrchestratorError::Status {
                code,
                body: reply.text(),
            }),
        }
    }
}

#[async_trait]
impl ContainerOrchestrator for HttpOrchestrator {
    async fn create_pod(&self, spec: &PodSpec) -> OrchestratorResult<()> {
        self.create(self.core_path("pods"), &spec.name, spec.to_manifest()).await
    }

    async fn delete_pod(&self, name: &str) -> OrchestratorResult<()> {
        self.delete(format!("{}/{name}", self.core_path("pods")), name).await
    }

    async fn create_service(&self, spec: &ServiceSpec) -> OrchestratorResult<()> {
        self.create(self.core_path("services"), &spec.name, spec.to_manifest()).await
    }

    async fn delete_service(&self, name: &str) -> OrchestratorResult<()> {
        self.delete(format!("{}/{name}", self.core_path("services")), name).await
    }

    async fn list_pods(&self, label_selector: &str) -> OrchestratorResult<Vec<PodInfo>> {
        let path = format!(
            "{}?labelSelector={}",
            self.core_path("pods"),
            encode_query(label_selector)
        );
        let reply = send(&self.authority, http::Method::GET, &path, None, self.timeout).await?;
        if !reply.is_success() {
            return Err(OrchestratorError::Status {
                code: reply.status,
                body: reply.text(),
            });
        }
        parse_pod_list(&reply.body)
    }

    async fn get_autoscaler(&self, name: &str) -> OrchestratorResult<Option<AutoscalerObject>> {
        let path = format!("{}/{name}", self.autoscaler_path());
        let reply = send(&self.authority, http::Method::GET, &path, None, self.timeout).await?;
        match reply.status {
            404 => Ok(None),
            _ if reply.is_success() => parse_autoscaler(&reply.body).map(Some),
            code => Err(OrchestratorError::Status {
                code,
                body: reply.text(),
            }),
        }
    }

    async fn create_autoscaler(&self, spec: &AutoscalerSpec) -> OrchestratorResult<()> {
        self.create(self.autoscaler_path(), &spec.name, spec.to_manifest()).await
    }
}

// ── Gateway ────────────────────────────────────────────────────────

/// Reaches flow containers through their per-execution service.
pub struct HttpGateway {
    config: KubernetesConfig,
    timeout: Duration,
}

impl HttpGateway {
    pub fn new(config: KubernetesConfig) -> Self {
        Self {
            config,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn authority(&self, execution: &Execution) -> String {
        format!(
            "{}:{}",
            service_name(&self.config, execution.id),
            self.config.service_port
        )
    }
}

#[async_trait]
impl FlowContainerGateway for HttpGateway {
    async fn cancel(&self, execution: &Execution, user: &str) -> DispatchResult<()> {
        let authority = self.authority(execution);
        let path = format!(
            "/container?action=cancel&execid={}&user={}",
            execution.id,
            encode_query(user)
        );
        let reply = send(&authority, http::Method::POST, &path, None, self.timeout)
            .await
            .map_err(|e| DispatchError::Gateway(e.to_string()))?;
        if !reply.is_success() {
            return Err(DispatchError::Gateway(format!(
                "{authority} returned {}: {}",
                reply.status,
                reply.text()
            )));
        }
        // The container answers 200 with an `error` field when it refuses.
        if let Ok(body) = serde_json::from_slice::<Value>(&reply.body) {
            if let Some(error) = body["error"].as_str() {
                warn!(execution_id = execution.id, %error, "flow container refused cancel");
                return Err(DispatchError::Gateway(error.to_string()));
            }
        }
        debug!(execution_id = execution.id, %authority, "cancel delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response and hand back the raw request.
    async fn one_shot_server(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 16 * 1024];
            let mut request = Vec::new();
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            l.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });
        (addr, handle)
    }

    fn orchestrator(addr: &str) -> HttpOrchestrator {
        let config = KubernetesConfig {
            api_server: format!("http://{addr}"),
            namespace: "flows".to_string(),
            ..KubernetesConfig::default()
        };
        HttpOrchestrator::new(&config).unwrap()
    }

    #[test]
    fn authority_parsing() {
        assert_eq!(authority_of("http://127.0.0.1:8001").unwrap(), "127.0.0.1:8001");
        assert_eq!(authority_of("http://proxy/").unwrap(), "proxy:80");
        assert!(authority_of("https://secure:443").is_err());
        assert!(authority_of("http://").is_err());
    }

    #[test]
    fn timestamps() {
        assert_eq!(parse_timestamp("1970-01-01T00:00:00Z"), Some(0));
        assert_eq!(parse_timestamp("2024-03-01T00:00:00Z"), Some(1_709_251_200_000));
        assert_eq!(parse_timestamp("2000-02-29T12:30:15.123Z"), Some(951_827_415_000));
        assert_eq!(parse_timestamp("2024-03-01 00:00:00"), None);
        assert_eq!(parse_timestamp("2024-13-01T00:00:00Z"), None);
    }

    #[test]
    fn query_encoding() {
        assert_eq!(encode_query("app=flowgrid-flow"), "app%3Dflowgrid-flow");
        assert_eq!(encode_query("a b&c"), "a%20b%26c");
    }

    #[test]
    fn autoscaler_status_is_parsed() {
        let body = br#"{
            "metadata": {"name": "fc-vpa-proj-flow", "creationTimestamp": "1970-01-01T00:01:00Z"},
            "status": {"recommendation": {"containerRecommendations": [
                {"containerName": "az-flow-container", "target": {"cpu": "250m", "memory": "2Gi"}},
                {"containerName": "broken", "target": {}}
            ]}}
        }"#;
        let object = parse_autoscaler(body).unwrap();
        assert_eq!(object.created_at, 60_000);
        assert_eq!(object.recommendations.len(), 1);
        assert!((object.recommendations[0].cpu - 0.25).abs() < 1e-9);
        assert_eq!(object.recommendations[0].memory, 2.0 * 1024.0 * 1024.0 * 1024.0);
    }

    #[test]
    fn autoscaler_without_status_has_no_recommendations() {
        let object = parse_autoscaler(br#"{"metadata": {"name": "x"}}"#).unwrap();
        assert!(object.recommendations.is_empty());
        assert_eq!(object.created_at, 0);
    }

    #[tokio::test]
    async fn create_pod_posts_manifest() {
        let (addr, server) = one_shot_server(201, "{}").await;
        let pod = PodSpec {
            name: "fc-dep-flowgrid-1".to_string(),
            namespace: "flows".to_string(),
            labels: Default::default(),
            annotations: Default::default(),
            init_containers: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            template: None,
        };
        orchestrator(&addr).create_pod(&pod).await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("POST /api/v1/namespaces/flows/pods HTTP/1.1"));
        assert!(request.contains("\"name\":\"fc-dep-flowgrid-1\""));
    }

    #[tokio::test]
    async fn conflict_maps_to_already_exists() {
        let (addr, _server) = one_shot_server(409, "{}").await;
        let spec = ServiceSpec {
            name: "svc".to_string(),
            namespace: "flows".to_string(),
            selector: Default::default(),
            port: 1,
        };
        let err = orchestrator(&addr).create_service(&spec).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn delete_of_missing_pod_is_ok() {
        let (addr, server) = one_shot_server(404, "{}").await;
        orchestrator(&addr).delete_pod("gone").await.unwrap();
        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE /api/v1/namespaces/flows/pods/gone "));
    }

    #[tokio::test]
    async fn list_pods_parses_items() {
        let (addr, server) = one_shot_server(
            200,
            r#"{"items": [{"metadata": {"name": "p1", "labels": {"app": "flowgrid-flow"}, "creationTimestamp": "1970-01-01T00:00:10Z"}}]}"#,
        )
        .await;
        let pods = orchestrator(&addr).list_pods("app=flowgrid-flow").await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].name, "p1");
        assert_eq!(pods[0].created_at, 10_000);
        assert_eq!(pods[0].labels["app"], "flowgrid-flow");
        let request = server.await.unwrap();
        assert!(request.contains("labelSelector=app%3Dflowgrid-flow"));
    }

    #[tokio::test]
    async fn missing_autoscaler_is_none() {
        let (addr, _server) = one_shot_server(404, "{}").await;
        assert!(orchestrator(&addr).get_autoscaler("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = orchestrator(&addr).delete_service("svc").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Request(_)));
    }
}
