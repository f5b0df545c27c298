// ABOUTME: In-memory sandbox records and the lifecycle state machine
// ABOUTME: Tracks each sandbox's state, history, addresses and deadline behind an async lock

use crate::exposure::ExposureKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox already exists: {0}")]
    AlreadyExists(String),

    #[error("Sandbox {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: SandboxState,
        to: SandboxState,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    Created,
    Provisioning,
    Starting,
    Probing,
    Exposed,
    Running,
    Terminated,
}

impl SandboxState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Created => "created",
            Self::Provisioning => "provisioning",
            Self::Starting => "starting",
            Self::Probing => "probing",
            Self::Exposed => "exposed",
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }

    /// Forward edges follow the stage order; any live state may terminate
    pub fn can_transition_to(&self, next: SandboxState) -> bool {
        use SandboxState::*;
        matches!(
            (self, next),
            (Created, Provisioning)
                | (Provisioning, Starting)
                | (Starting, Probing)
                | (Probing, Exposed)
                | (Exposed, Running)
        ) || (next == Terminated && *self != Terminated)
    }

    pub fn is_terminal(&self) -> bool {
        *self == Self::Terminated
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateChange {
    pub state: SandboxState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MountRecord {
    pub source: String,
    pub target: String,
    /// Survives the sandbox (the shared volume)
    pub persistent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: String,
    pub owner_id: String,
    pub provider: String,
    pub image_key: Option<String>,
    pub image_tag: Option<String>,
    pub container_id: Option<String>,
    pub mounts: Vec<MountRecord>,
    pub ports: Vec<u16>,

    // Lifetime
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub deadline: DateTime<Utc>,

    pub state: SandboxState,
    pub history: Vec<StateChange>,

    // Networking
    pub internal_address: Option<String>,
    pub public_url: Option<String>,
    pub exposure: Option<ExposureKind>,

    pub last_error: Option<String>,
}

impl Sandbox {
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        provider: impl Into<String>,
        timeout_secs: u64,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            id: id.into(),
            owner_id: owner_id.into(),
            provider: provider.into(),
            image_key: None,
            image_tag: None,
            container_id: None,
            mounts: Vec::new(),
            ports: Vec::new(),
            created_at,
            timeout_secs,
            deadline: created_at + chrono::Duration::seconds(timeout_secs as i64),
            state: SandboxState::Created,
            history: vec![StateChange {
                state: SandboxState::Created,
                at: created_at,
            }],
            internal_address: None,
            public_url: None,
            exposure: None,
            last_error: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }

    /// States visited so far, oldest first
    pub fn visited(&self) -> Vec<SandboxState> {
        self.history.iter().map(|change| change.state).collect()
    }
}

/// Live and terminated sandbox records, keyed by id
#[derive(Default)]
pub struct SandboxStorage {
    records: RwLock<HashMap<String, Sandbox>>,
}

impl SandboxStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, sandbox: Sandbox) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&sandbox.id) {
            return Err(StorageError::AlreadyExists(sandbox.id));
        }
        records.insert(sandbox.id.clone(), sandbox);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    /// All records, newest first, optionally limited to one owner
    pub async fn list(&self, owner_id: Option<&str>) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self
            .records
            .read()
            .await
            .values()
            .filter(|s| owner_id.map_or(true, |owner| s.owner_id == owner))
            .cloned()
            .collect();
        sandboxes.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sandboxes
    }

    /// Move a sandbox to `next`, recording the change in its history
    pub async fn transition(&self, id: &str, next: SandboxState) -> Result<Sandbox> {
        let mut records = self.records.write().await;
        let sandbox = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if !sandbox.state.can_transition_to(next) {
            return Err(StorageError::InvalidTransition {
                id: id.to_string(),
                from: sandbox.state,
                to: next,
            });
        }

        sandbox.state = next;
        sandbox.history.push(StateChange {
            state: next,
            at: Utc::now(),
        });
        Ok(sandbox.clone())
    }

    /// Mark a sandbox terminated; a no-op when it already is
    pub async fn terminate(&self, id: &str, reason: Option<String>) -> Result<Sandbox> {
        let mut records = self.records.write().await;
        let sandbox = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;

        if !sandbox.state.is_terminal() {
            sandbox.state = SandboxState::Terminated;
            sandbox.history.push(StateChange {
                state: SandboxState::Terminated,
                at: Utc::now(),
            });
            sandbox.public_url = None;
            sandbox.internal_address = None;
        }
        if reason.is_some() {
            sandbox.last_error = reason;
        }
        Ok(sandbox.clone())
    }

    /// Apply a field update that does not change state
    pub async fn update<F>(&self, id: &str, apply: F) -> Result<Sandbox>
    where
        F: FnOnce(&mut Sandbox),
    {
        let mut records = self.records.write().await;
        let sandbox = records
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        let state = sandbox.state;
        let history_len = sandbox.history.len();
        apply(sandbox);
        sandbox.state = state;
        sandbox.history.truncate(history_len);
        Ok(sandbox.clone())
    }

    /// Drop terminated records whose last state change is before `cutoff`; returns how many
    pub async fn prune_terminated(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, s| {
            let last_change = s.history.last().map_or(s.created_at, |change| change.at);
            !(s.state.is_terminal() && last_change < cutoff)
        });
        before - records.len()
    }

    /// Live records whose deadline has passed
    pub async fn expired(&self, now: DateTime<Utc>) -> Vec<Sandbox> {
        self.records
            .read()
            .await
            .values()
            .filter(|s| !s.state.is_terminal() && s.is_expired(now))
            .cloned()
            .collect()
    }
}
