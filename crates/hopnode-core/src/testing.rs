//! Test doubles shared by the unit tests.

use crate::exec::{CommandError, CommandRunner, CommandSpec};
use crate::resolve::{HostResolver, ResolveError};
use crate::store::{
    ChainRecord, MemoryStore, NodeFilter, NodePatch, NodeRecord, Repository, SessionFilter, StoreError,
    TrafficRecord, TunnelSession,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Records every command and answers from a script.
#[derive(Default)]
pub struct ScriptedRunner {
    log: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    outputs: Mutex<Vec<(String, String)>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every command whose rendered line contains `pattern`.
    pub fn fail_on(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Return `output` for commands containing `pattern`.
    pub fn respond(&self, pattern: &str, output: &str) {
        self.outputs
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }

    pub fn count_matching(&self, pattern: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &CommandSpec) -> Result<String, CommandError> {
        let line = command.to_string();
        self.log.lock().unwrap().push(line.clone());

        if self.failures.lock().unwrap().iter().any(|p| line.contains(p.as_str())) {
            return Err(CommandError::Failed {
                command: line,
                code: 1,
                stderr: "scripted failure".to_string(),
            });
        }

        let outputs = self.outputs.lock().unwrap();
        Ok(outputs
            .iter()
            .rev()
            .find(|(pattern, _)| line.contains(pattern.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

/// Resolver answering from a fixed table.
#[derive(Default)]
pub struct StaticResolver {
    table: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn with(mut self, host: &str, addrs: &[&str]) -> Self {
        self.table.insert(
            host.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, ResolveError> {
        self.table
            .get(host)
            .cloned()
            .ok_or_else(|| ResolveError::NoAddresses(host.to_string()))
    }
}

/// [`MemoryStore`] whose node listing stalls for a fixed delay.
pub struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStore::new(),
            delay,
        }
    }
}

#[async_trait]
impl Repository for SlowStore {
    async fn get_node(&self, id: &str) -> Result<Option<NodeRecord>, StoreError> {
        self.inner.get_node(id).await
    }

    async fn put_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.inner.put_node(node).await
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Vec<NodeRecord>, StoreError> {
        tokio::time::sleep(self.delay).await;
        self.inner.list_nodes(filter).await
    }

    async fn patch_node(&self, id: &str, patch: &NodePatch) -> Result<(), StoreError> {
        self.inner.patch_node(id, patch).await
    }

    async fn adjust_connections(&self, node_id: &str, delta: i64) -> Result<u32, StoreError> {
        self.inner.adjust_connections(node_id, delta).await
    }

    async fn insert_session(&self, session: &TunnelSession) -> Result<(), StoreError> {
        self.inner.insert_session(session).await
    }

    async fn update_session(&self, session: &TunnelSession) -> Result<(), StoreError> {
        self.inner.update_session(session).await
    }

    async fn delete_session(&self, id: Uuid) -> Result<(), StoreError> {
        self.inner.delete_session(id).await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<TunnelSession>, StoreError> {
        self.inner.get_session(id).await
    }

    async fn find_sessions(&self, filter: &SessionFilter) -> Result<Vec<TunnelSession>, StoreError> {
        self.inner.find_sessions(filter).await
    }

    async fn insert_chain(&self, chain: &ChainRecord) -> Result<(), StoreError> {
        self.inner.insert_chain(chain).await
    }

    async fn update_chain(&self, chain: &ChainRecord) -> Result<(), StoreError> {
        self.inner.update_chain(chain).await
    }

    async fn get_chain(&self, id: Uuid) -> Result<Option<ChainRecord>, StoreError> {
        self.inner.get_chain(id).await
    }

    async fn chains_for_user(&self, user_id: &str) -> Result<Vec<ChainRecord>, StoreError> {
        self.inner.chains_for_user(user_id).await
    }

    async fn record_traffic(&self, sample: &TrafficRecord) -> Result<(), StoreError> {
        self.inner.record_traffic(sample).await
    }
}
