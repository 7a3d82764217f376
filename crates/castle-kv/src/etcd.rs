//! etcd v2 keys API backend

use crate::path;
use crate::store::{
    EventKind, KvNode, KvStore, StoreError, StoreResult, TxnOp, WatchEvent, Watcher,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const INDEX_HEADER: &str = "X-Etcd-Index";
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);

// etcd v2 error codes
const ERR_KEY_NOT_FOUND: u64 = 100;
const ERR_TEST_FAILED: u64 = 101;
const ERR_NOT_FILE: u64 = 102;
const ERR_NOT_DIR: u64 = 104;
const ERR_NODE_EXIST: u64 = 105;
const ERR_DIR_NOT_EMPTY: u64 = 108;
const ERR_EVENT_INDEX_CLEARED: u64 = 401;

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: EtcdNode,
    #[serde(rename = "prevNode")]
    prev_node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: Option<String>,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

impl EtcdNode {
    fn into_kv(self) -> KvNode {
        let mut children: Vec<KvNode> = self.nodes.into_iter().map(Self::into_kv).collect();
        children.sort_by(|a, b| a.key.cmp(&b.key));
        KvNode {
            key: self.key.unwrap_or_else(|| "/".to_string()),
            value: if self.dir { None } else { self.value },
            dir: self.dir,
            children,
            modified_index: self.modified_index,
        }
    }
}

fn map_error(body: EtcdErrorBody) -> StoreError {
    let key = body.cause;
    match body.error_code {
        ERR_KEY_NOT_FOUND => StoreError::NotFound(key),
        ERR_TEST_FAILED | ERR_NOT_FILE | ERR_NOT_DIR | ERR_NODE_EXIST | ERR_DIR_NOT_EMPTY => {
            StoreError::conflict(key, body.message)
        }
        ERR_EVENT_INDEX_CLEARED => StoreError::Unavailable(body.message),
        code => StoreError::Transport(format!("etcd error {code}: {}", body.message)),
    }
}

fn event_kind(action: &str, had_prev: bool) -> EventKind {
    match action {
        "delete" | "compareAndDelete" => EventKind::Delete,
        "expire" => EventKind::Expire,
        "create" => EventKind::Create,
        _ if had_prev => EventKind::Update,
        _ => EventKind::Create,
    }
}

/// [`KvStore`] over the etcd v2 HTTP API
pub struct EtcdStore {
    endpoints: Vec<String>,
    next: AtomicUsize,
    client: reqwest::Client,
    /// Long-poll watches must not be cut off by the request timeout
    watch_client: reqwest::Client,
}

impl EtcdStore {
    /// Create a client for the given endpoints (`http://host:port`)
    pub fn new(endpoints: Vec<String>, timeout: Duration) -> StoreResult<Self> {
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable("no etcd endpoints configured".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        let watch_client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| StoreError::Transport(e.to_string()))?;
        Ok(Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
            client,
            watch_client,
        })
    }

    fn url(&self, key: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        format!("{}/v2/keys{}", self.endpoints[n], path::normalize(key))
    }

    async fn send(
        request: reqwest::RequestBuilder,
    ) -> StoreResult<(Option<EtcdResponse>, u64)> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                StoreError::Unavailable(e.to_string())
            } else {
                StoreError::Transport(e.to_string())
            }
        })?;
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| StoreError::Transport(e.to_string()))?;

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok((None, index));
            }
            let parsed: EtcdResponse = serde_json::from_str(&body)
                .map_err(|e| StoreError::Transport(format!("bad etcd response: {e}")))?;
            return Ok((Some(parsed), index));
        }
        match serde_json::from_str::<EtcdErrorBody>(&body) {
            Ok(err) => Err(map_error(err)),
            Err(_) => Err(StoreError::Transport(format!(
                "etcd returned status {status}: {body}"
            ))),
        }
    }

    async fn request(request: reqwest::RequestBuilder) -> StoreResult<(EtcdResponse, u64)> {
        match Self::send(request).await? {
            (Some(resp), index) => Ok((resp, index)),
            (None, _) => Err(StoreError::Transport("empty etcd response".into())),
        }
    }

    async fn put(
        &self,
        key: &str,
        form: &[(&str, String)],
    ) -> StoreResult<u64> {
        let (resp, _) = Self::request(self.client.put(self.url(key)).form(form)).await?;
        Ok(resp.node.modified_index)
    }

    async fn checked_value(&self, key: &str) -> StoreResult<Option<String>> {
        match self.get(key).await {
            Ok(v) => Ok(Some(v)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn ttl_field(ttl: Option<Duration>) -> Option<(&'static str, String)> {
    ttl.map(|ttl| ("ttl", ttl.as_secs().max(1).to_string()))
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn get(&self, key: &str) -> StoreResult<String> {
        let (resp, _) = Self::request(self.client.get(self.url(key))).await?;
        if resp.node.dir {
            return Err(StoreError::conflict(key, "is a directory"));
        }
        resp.node
            .value
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn get_recursive(&self, key: &str) -> StoreResult<KvNode> {
        let request = self
            .client
            .get(self.url(key))
            .query(&[("recursive", "true"), ("sorted", "true")]);
        let (resp, _) = Self::request(request).await?;
        Ok(resp.node.into_kv())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<u64> {
        let mut form = vec![("value", value.to_string())];
        form.extend(ttl_field(ttl));
        self.put(key, &form).await
    }

    async fn create_dir(&self, key: &str) -> StoreResult<()> {
        let form = [("dir", "true".to_string()), ("prevExist", "false".to_string())];
        match self.put(key, &form).await {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                // Fine if it is already a directory
                let node = self.get_recursive(key).await?;
                if node.dir {
                    Ok(())
                } else {
                    Err(StoreError::conflict(key, "not a directory"))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str, recursive: bool) -> StoreResult<()> {
        let mut request = self.client.delete(self.url(key));
        if recursive {
            request = request.query(&[("recursive", "true")]);
        }
        match Self::request(request).await {
            Err(StoreError::Conflict { .. }) if !recursive => {
                // Empty directories need dir=true
                let request = self.client.delete(self.url(key)).query(&[("dir", "true")]);
                Self::request(request).await.map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<u64> {
        let mut form = vec![("value", value.to_string())];
        match expected {
            Some(prev) => form.push(("prevValue", prev.to_string())),
            None => form.push(("prevExist", "false".to_string())),
        }
        form.extend(ttl_field(ttl));
        self.put(key, &form).await
    }

    async fn transaction(&self, ops: Vec<TxnOp>) -> StoreResult<u64> {
        // The v2 API has no multi-key transactions: verify every check up
        // front, then apply writes in order.
        for op in &ops {
            if let TxnOp::Check { key, expected } = op {
                let current = self.checked_value(key).await?;
                if current != *expected {
                    return Err(StoreError::conflict(
                        key.as_str(),
                        format!("compare failed: expected {expected:?}, found {current:?}"),
                    ));
                }
            }
        }
        let mut index = 0;
        for op in ops {
            match op {
                TxnOp::Check { .. } => {}
                TxnOp::Set { key, value } => index = self.set(&key, &value, None).await?,
                TxnOp::Delete { key, recursive } => match self.delete(&key, recursive).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                },
            }
        }
        if index == 0 {
            index = self.current_index().await?;
        }
        Ok(index)
    }

    async fn watch(
        &self,
        key: &str,
        recursive: bool,
        after_index: Option<u64>,
    ) -> StoreResult<Watcher> {
        let start = match after_index {
            Some(index) => index,
            None => self.current_index().await?,
        };
        let key = path::normalize(key);
        let client = self.watch_client.clone();
        let urls: Vec<String> = self
            .endpoints
            .iter()
            .map(|e| format!("{e}/v2/keys{key}"))
            .collect();

        debug!("Watching etcd key {} from index {}", key, start);

        let (tx, rx) = mpsc::channel(64);
        let task = tokio::spawn(async move {
            let mut wait_index = start + 1;
            let mut attempt = 0usize;
            loop {
                let url = &urls[attempt % urls.len()];
                let mut query = vec![
                    ("wait", "true".to_string()),
                    ("waitIndex", wait_index.to_string()),
                ];
                if recursive {
                    query.push(("recursive", "true".to_string()));
                }
                match Self::send(client.get(url).query(&query)).await {
                    Ok((Some(resp), _)) => {
                        let had_prev = resp.prev_node.is_some();
                        let index = resp.node.modified_index;
                        let event = WatchEvent {
                            kind: event_kind(&resp.action, had_prev),
                            key: resp.node.key.unwrap_or_else(|| key.clone()),
                            value: resp.node.value,
                            prev_value: resp.prev_node.and_then(|n| n.value),
                            index,
                        };
                        wait_index = index + 1;
                        if tx.send(Ok(event)).await.is_err() {
                            return;
                        }
                    }
                    // Long poll ended without an event
                    Ok((None, _)) => {}
                    Err(StoreError::Unavailable(msg)) if msg.contains("cleared") => {
                        let _ = tx.send(Err(StoreError::Unavailable(msg))).await;
                        return;
                    }
                    Err(e) => {
                        warn!("Watch on '{}' interrupted: {}", key, e);
                        attempt += 1;
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Watcher::new(rx, start, Some(task)))
    }

    async fn current_index(&self) -> StoreResult<u64> {
        let (_, index) = Self::send(self.client.get(self.url("/"))).await?;
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_error_codes() {
        let err = map_error(EtcdErrorBody {
            error_code: 100,
            message: "Key not found".into(),
            cause: "/castle/x".into(),
        });
        assert_eq!(err, StoreError::NotFound("/castle/x".into()));

        let err = map_error(EtcdErrorBody {
            error_code: 101,
            message: "Compare failed".into(),
            cause: "[a != b]".into(),
        });
        assert!(err.is_conflict());

        let err = map_error(EtcdErrorBody {
            error_code: 401,
            message: "The event in requested index is outdated and cleared".into(),
            cause: String::new(),
        });
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_parse_recursive_response() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/castle/nodes",
                "dir": true,
                "nodes": [
                    {"key": "/castle/nodes/b", "value": "2", "modifiedIndex": 7},
                    {"key": "/castle/nodes/a", "dir": true, "nodes": [
                        {"key": "/castle/nodes/a/ip", "value": "10.0.0.1", "modifiedIndex": 5}
                    ], "modifiedIndex": 4}
                ],
                "modifiedIndex": 3
            }
        }"#;
        let resp: EtcdResponse = serde_json::from_str(body).unwrap();
        let node = resp.node.into_kv();
        assert_eq!(node.child_names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(node.descend("a/ip").unwrap().value.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_event_kind() {
        assert_eq!(event_kind("set", false), EventKind::Create);
        assert_eq!(event_kind("set", true), EventKind::Update);
        assert_eq!(event_kind("compareAndSwap", true), EventKind::Update);
        assert_eq!(event_kind("expire", true), EventKind::Expire);
        assert_eq!(event_kind("delete", true), EventKind::Delete);
    }

    #[test]
    fn test_requires_endpoints() {
        assert!(EtcdStore::new(Vec::new(), Duration::from_secs(1)).is_err());
    }
}
