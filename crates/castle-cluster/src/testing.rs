//! Test doubles for code that talks to the cluster

use crate::command::MonCommand;
use crate::connection::{ClusterConnection, ConnectionFactory};
use crate::info::{ClusterInfo, MonitorEndpoint};
use async_trait::async_trait;
use castle_common::{Error, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

type Handler = Arc<dyn Fn(&MonCommand) -> Result<Vec<u8>> + Send + Sync>;

/// A command seen by a mock connection
#[derive(Debug, Clone, PartialEq)]
pub struct MonCall {
    pub user: String,
    pub prefix: String,
    pub json: Value,
    pub input: Option<Vec<u8>>,
}

#[derive(Default)]
struct Inner {
    handlers: Mutex<Vec<(String, Handler)>>,
    calls: Mutex<Vec<MonCall>>,
    connects: Mutex<Vec<String>>,
}

impl Inner {
    fn dispatch(&self, user: &str, cmd: &MonCommand, input: Option<&[u8]>) -> Result<Vec<u8>> {
        self.calls.lock().push(MonCall {
            user: user.to_string(),
            prefix: cmd.prefix().to_string(),
            json: cmd.to_json(),
            input: input.map(<[u8]>::to_vec),
        });
        let handler = self
            .handlers
            .lock()
            .iter()
            .rev()
            .find(|(prefix, _)| prefix == cmd.prefix())
            .map(|(_, h)| Arc::clone(h));
        handler.map_or_else(|| Ok(b"{}".to_vec()), |h| h(cmd))
    }
}

/// [`ConnectionFactory`] whose connections answer from per-prefix handlers.
///
/// Unhandled commands succeed with `{}`. Clones share handlers and history.
#[derive(Clone, Default)]
pub struct MockConnectionFactory {
    inner: Arc<Inner>,
}

impl MockConnectionFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `prefix` with a computed result; later handlers win
    pub fn handle<F>(&self, prefix: &str, f: F)
    where
        F: Fn(&MonCommand) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .lock()
            .push((prefix.to_string(), Arc::new(f)));
    }

    /// Answer `prefix` with a fixed buffer
    pub fn on(&self, prefix: &str, output: Vec<u8>) {
        self.handle(prefix, move |_| Ok(output.clone()));
    }

    pub fn on_json(&self, prefix: &str, value: Value) {
        self.on(prefix, value.to_string().into_bytes());
    }

    /// Fail `prefix` as if the target entity does not exist
    pub fn fail_not_found(&self, prefix: &str) {
        let prefix_owned = prefix.to_string();
        self.handle(prefix, move |_| Err(Error::not_found(prefix_owned.clone())));
    }

    /// Fail `prefix` with an external error
    pub fn fail(&self, prefix: &str, message: &str) {
        let message = message.to_string();
        self.handle(prefix, move |_| Err(Error::external(message.clone())));
    }

    #[must_use]
    pub fn calls(&self) -> Vec<MonCall> {
        self.inner.calls.lock().clone()
    }

    #[must_use]
    pub fn calls_with_prefix(&self, prefix: &str) -> Vec<MonCall> {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|c| c.prefix == prefix)
            .cloned()
            .collect()
    }

    /// Users connected as, in order
    #[must_use]
    pub fn connects(&self) -> Vec<String> {
        self.inner.connects.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.inner.calls.lock().clear();
        self.inner.connects.lock().clear();
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, _info: &ClusterInfo, user: &str) -> Result<Box<dyn ClusterConnection>> {
        self.inner.connects.lock().push(user.to_string());
        Ok(Box::new(MockConnection {
            user: user.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct MockConnection {
    user: String,
    inner: Arc<Inner>,
}

#[async_trait]
impl ClusterConnection for MockConnection {
    async fn mon_command(&self, cmd: &MonCommand) -> Result<Vec<u8>> {
        self.inner.dispatch(&self.user, cmd, None)
    }

    async fn mon_command_with_input_buffer(
        &self,
        cmd: &MonCommand,
        input: &[u8],
    ) -> Result<Vec<u8>> {
        self.inner.dispatch(&self.user, cmd, Some(input))
    }

    async fn shutdown(&self) {}
}

/// Cluster info with one monitor `mon0` on node `a`
#[must_use]
pub fn sample_info() -> ClusterInfo {
    let mut monitors = BTreeMap::new();
    monitors.insert("a".to_string(), MonitorEndpoint::new("mon0", "1.2.3.4:6790"));
    ClusterInfo {
        fsid: "f0b3ad7e-0000-4000-8000-000000000001".to_string(),
        name: "c1".to_string(),
        monitor_secret: "AQBmonsecret==".to_string(),
        admin_secret: "AQBadminsecret==".to_string(),
        monitors,
    }
}
