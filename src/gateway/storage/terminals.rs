//! DashMap-based terminal storage.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::gateway::error::{GatewayError, GatewayResult};
use crate::gateway::terminal::Terminal;
use crate::gateway::types::TerminalInfo;

/// Terminal storage operations.
///
/// Implementations must be thread-safe (`Send + Sync`) for use across
/// async tasks.
pub trait TerminalStorage: Send + Sync {
    /// Register a terminal under its id. Fails if the id is taken.
    fn register(&self, terminal: Arc<Terminal>) -> GatewayResult<()>;

    /// Remove `terminal` only if it is the instance stored under its id.
    fn unregister_if_current(&self, terminal: &Arc<Terminal>) -> bool;

    fn get(&self, terminal_id: &str) -> Option<Arc<Terminal>>;

    fn contains(&self, terminal_id: &str) -> bool;

    fn list_all(&self) -> Vec<TerminalInfo>;
}

/// DashMap-based implementation of `TerminalStorage`, keyed by terminal id.
pub struct DashMapTerminalStorage {
    terminals: DashMap<String, Arc<Terminal>>,
}

impl DashMapTerminalStorage {
    pub fn new() -> Self {
        Self {
            terminals: DashMap::new(),
        }
    }
}

impl Default for DashMapTerminalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalStorage for DashMapTerminalStorage {
    fn register(&self, terminal: Arc<Terminal>) -> GatewayResult<()> {
        match self.terminals.entry(terminal.id().to_string()) {
            Entry::Occupied(slot) => Err(GatewayError::TerminalExists(slot.key().clone())),
            Entry::Vacant(slot) => {
                slot.insert(terminal);
                Ok(())
            }
        }
    }

    fn unregister_if_current(&self, terminal: &Arc<Terminal>) -> bool {
        self.terminals
            .remove_if(terminal.id(), |_, current| Arc::ptr_eq(current, terminal))
            .is_some()
    }

    fn get(&self, terminal_id: &str) -> Option<Arc<Terminal>> {
        self.terminals.get(terminal_id).map(|t| Arc::clone(t.value()))
    }

    fn contains(&self, terminal_id: &str) -> bool {
        self.terminals.contains_key(terminal_id)
    }

    fn list_all(&self) -> Vec<TerminalInfo> {
        let terminals: Vec<Arc<Terminal>> =
            self.terminals.iter().map(|t| Arc::clone(t.value())).collect();
        let mut infos: Vec<TerminalInfo> = terminals.iter().map(|t| t.info()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }
}
