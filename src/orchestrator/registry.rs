//! In-memory record of containers started through the bridge.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::OrchestratorError;

/// State of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A container the bridge started.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub container_id: String,
    pub name: String,
    pub image: String,
    pub agent_type: String,
    pub key_id: String,
    pub state: ContainerState,
    /// Control socket path as seen from inside the container.
    pub endpoint: String,
    /// Host directory holding this container's secret endpoint.
    pub secret_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Registry guarded by a single reader/writer lock.
pub struct ContainerRegistry {
    max: usize,
    records: RwLock<HashMap<String, ContainerRecord>>,
}

impl ContainerRegistry {
    pub fn new(max: usize) -> Self {
        Self {
            max,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub async fn insert(&self, record: ContainerRecord) -> Result<(), OrchestratorError> {
        let mut records = self.records.write().await;
        if records.len() >= self.max {
            return Err(OrchestratorError::LimitReached { max: self.max });
        }
        records.insert(record.container_id.clone(), record);
        Ok(())
    }

    pub async fn get(&self, container_id: &str) -> Option<ContainerRecord> {
        self.records.read().await.get(container_id).cloned()
    }

    pub async fn remove(&self, container_id: &str) -> Option<ContainerRecord> {
        self.records.write().await.remove(container_id)
    }

    pub async fn is_full(&self) -> bool {
        self.records.read().await.len() >= self.max
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Container ids, oldest first.
    pub async fn ids(&self) -> Vec<String> {
        let records = self.records.read().await;
        let mut all: Vec<&ContainerRecord> = records.values().collect();
        all.sort_by_key(|r| r.created_at);
        all.into_iter().map(|r| r.container_id.clone()).collect()
    }

    pub async fn drain(&self) -> Vec<ContainerRecord> {
        self.records.write().await.drain().map(|(_, r)| r).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord {
            container_id: id.to_string(),
            name: format!("armorclaw-{id}"),
            image: "armorclaw/agent:v1".to_string(),
            agent_type: "openclaw".to_string(),
            key_id: "k".to_string(),
            state: ContainerState::Running,
            endpoint: "/run/armorclaw/bridge.sock".to_string(),
            secret_dir: PathBuf::from("/tmp"),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_container_state_display() {
        assert_eq!(ContainerState::Running.to_string(), "running");
        assert_eq!(ContainerState::Stopped.to_string(), "stopped");
    }

    #[tokio::test]
    async fn test_capacity_is_enforced() {
        let registry = ContainerRegistry::new(1);
        registry.insert(record("a")).await.unwrap();
        assert!(registry.is_full().await);
        assert!(matches!(
            registry.insert(record("b")).await,
            Err(OrchestratorError::LimitReached { max: 1 })
        ));
    }

    #[tokio::test]
    async fn test_remove_returns_record() {
        let registry = ContainerRegistry::new(4);
        registry.insert(record("a")).await.unwrap();
        let removed = registry.remove("a").await.unwrap();
        assert_eq!(removed.name, "armorclaw-a");
        assert!(registry.get("a").await.is_none());
        assert_eq!(registry.len().await, 0);
    }
}
