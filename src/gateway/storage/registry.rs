//! Connection registry: logical key to live SSH connection.
//!
//! # Resolution
//!
//! `resolve` computes the request's fingerprint and, under a per-key async
//! lock, either hands back the live connection registered at the key or
//! dials a new one. The lock serializes concurrent requests for one key so
//! a burst of identical connects produces exactly one dial; requests for
//! different keys never wait on each other.
//!
//! Every successful `resolve` returns the connection with one lease taken
//! for the caller. [`ConnectionRegistry::release`] gives it back; the last
//! release closes the connection and removes every key that points at it,
//! including route aliases.
//!
//! A failed dial registers nothing. Per-key locks live only while a resolve
//! holds them or a connection is registered at the key.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info};

use crate::gateway::connection::ServerConnection;
use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::fingerprint::Fingerprint;
use crate::gateway::transport::Connector;
use crate::gateway::types::{AuthSpec, ConnectTarget, ConnectionInfo, ResolvePolicy};

/// Registry slot. Aliases share the connection but carry their own
/// fingerprint, computed for the externally visible target.
#[derive(Clone)]
struct RegistryEntry {
    connection: Arc<ServerConnection>,
    fingerprint: Fingerprint,
}

pub struct ConnectionRegistry {
    entries: DashMap<String, RegistryEntry>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    connector: Arc<dyn Connector>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            entries: DashMap::new(),
            key_locks: DashMap::new(),
            connector,
        }
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.key_locks
                .entry(key.to_string())
                .or_default()
                .value(),
        )
    }

    /// Drop the lock for `key` once no resolve holds it and nothing is
    /// registered there.
    fn prune_key_lock(&self, key: &str) {
        self.key_locks.remove_if(key, |_, lock| {
            Arc::strong_count(lock) == 1 && !self.entries.contains_key(key)
        });
    }

    fn lookup(&self, key: &str) -> Option<RegistryEntry> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Return a leased connection for `target`, dialing if needed.
    pub async fn resolve(
        &self,
        target: &ConnectTarget,
        auth: &AuthSpec,
        policy: ResolvePolicy,
    ) -> GatewayResult<Arc<ServerConnection>> {
        let key = target.key();
        let fingerprint = Fingerprint::compute(target, auth);

        let lock = self.key_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(target, auth, policy, key.clone(), fingerprint)
                .await
        };
        drop(lock);
        self.prune_key_lock(&key);

        result
    }

    async fn resolve_locked(
        &self,
        target: &ConnectTarget,
        auth: &AuthSpec,
        policy: ResolvePolicy,
        key: String,
        fingerprint: Fingerprint,
    ) -> GatewayResult<Arc<ServerConnection>> {
        if policy == ResolvePolicy::Reuse
            && let Some(existing) = self.lookup(&key)
        {
            if existing.connection.is_connected() {
                if existing.fingerprint != fingerprint {
                    return Err(GatewayError::IdentityMismatch(key));
                }
                if existing.connection.try_acquire() {
                    debug!("Reusing SSH connection {} ({})", key, fingerprint);
                    return Ok(existing.connection);
                }
            }

            debug!("Evicting stale SSH connection at {}", key);
            self.entries
                .remove_if(&key, |_, entry| Arc::ptr_eq(&entry.connection, &existing.connection));
            if !existing.connection.is_connected() {
                existing.connection.close().await;
            }
        }

        let transport = self.connector.connect(target, auth).await?;
        let connection = Arc::new(ServerConnection::new(target.clone(), fingerprint, transport));
        connection.try_acquire();

        let displaced = self.entries.insert(
            key.clone(),
            RegistryEntry {
                connection: Arc::clone(&connection),
                fingerprint,
            },
        );
        if displaced.is_some() {
            info!("SSH connection at {} replaced", key);
        }

        Ok(connection)
    }

    /// Whether a live connection is registered at `key`.
    pub fn has_active(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|entry| entry.connection.is_connected())
            .unwrap_or(false)
    }

    /// Live connection at `key`, without taking a lease.
    pub fn get(&self, key: &str) -> GatewayResult<Arc<ServerConnection>> {
        match self.lookup(key) {
            Some(entry) if entry.connection.is_connected() => Ok(entry.connection),
            _ => Err(GatewayError::UnknownKey(key.to_string())),
        }
    }

    /// Take an extra lease on the live connection at `key`.
    pub fn acquire(&self, key: &str) -> GatewayResult<Arc<ServerConnection>> {
        let connection = self.get(key)?;
        if connection.try_acquire() {
            Ok(connection)
        } else {
            Err(GatewayError::UnknownKey(key.to_string()))
        }
    }

    /// Make `alias` resolve to the connection registered at `key`.
    pub fn alias(&self, key: &str, alias: &str, fingerprint: Fingerprint) -> GatewayResult<()> {
        let connection = self.get(key)?;
        self.entries.insert(
            alias.to_string(),
            RegistryEntry {
                connection,
                fingerprint,
            },
        );
        debug!("Registry alias {} -> {}", alias, key);
        Ok(())
    }

    /// Return a lease. The last one closes the connection.
    pub async fn release(&self, connection: &Arc<ServerConnection>) {
        if !connection.release() {
            return;
        }

        let mut removed = Vec::new();
        self.entries.retain(|key, entry| {
            let keep = !Arc::ptr_eq(&entry.connection, connection);
            if !keep {
                removed.push(key.clone());
            }
            keep
        });
        for key in &removed {
            self.prune_key_lock(key);
        }
        connection.close().await;
    }

    /// Snapshots of registered connections, aliases excluded.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let connections: Vec<Arc<ServerConnection>> = self
            .entries
            .iter()
            .filter(|entry| entry.key() == entry.connection.key())
            .map(|entry| Arc::clone(&entry.connection))
            .collect();

        let mut infos: Vec<ConnectionInfo> = connections.iter().map(|c| c.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }
}
