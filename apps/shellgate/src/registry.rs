use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::ssh::{self, SshHandle};

/// Period of the per-connection keep-alive probe.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UserIdentity {
    pub username: String,
    pub cluster: String,
    pub home_path: String,
}

/// One authenticated remote connection. Relays borrow the handle for the
/// duration of a terminal; the registry owns the entry until logout or
/// process exit.
pub struct SessionEntry {
    pub key: String,
    pub handle: SshHandle,
    pub identity: UserIdentity,
    pub created_at: DateTime<Utc>,
    keepalive: JoinHandle<()>,
}

impl SessionEntry {
    pub fn new(key: String, handle: SshHandle, identity: UserIdentity) -> Self {
        let keepalive = spawn_keepalive(key.clone(), handle.clone());
        Self {
            key,
            handle,
            identity,
            created_at: Utc::now(),
            keepalive,
        }
    }

    fn stop_keepalive(&self) {
        self.keepalive.abort();
    }
}

/// Concurrency-safe map from opaque session key to authenticated connection.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate an opaque session key for a fresh login.
    pub fn generate_key(cluster: &str, host: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{cluster}_{host}_{}", Uuid::new_v4()));
        format!("sgk_{:x}", hasher.finalize())
    }

    pub fn insert(&self, entry: SessionEntry) -> Arc<SessionEntry> {
        let entry = Arc::new(entry);
        self.sessions.insert(entry.key.clone(), entry.clone());
        entry
    }

    /// The collaborator contract consumed by the terminal orchestrator.
    pub fn lookup(&self, key: &str) -> Option<Arc<SessionEntry>> {
        self.sessions.get(key).map(|entry| entry.value().clone())
    }

    /// Drop a session and stop its heartbeat. The caller disconnects the
    /// underlying SSH client.
    pub fn remove(&self, key: &str) -> Option<Arc<SessionEntry>> {
        let (_, entry) = self.sessions.remove(key)?;
        entry.stop_keepalive();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Heartbeat: a trivial no-op command every 30 seconds over a fresh channel.
/// The first failure means the remote connection is dead; the task ends
/// silently and leaves teardown to logout or a failing relay.
fn spawn_keepalive(key: String, handle: SshHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        // The first tick fires immediately; the login path already proved
        // the connection works, so skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(err) = ssh::exec_capture(&handle, "echo -n").await {
                debug!(session = %key, error = %err, "keep-alive failed; stopping heartbeat");
                return;
            }
        }
    })
}
