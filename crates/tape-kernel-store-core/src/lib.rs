#![forbid(unsafe_code)]

//! Storage contract for tapes. Backends implement [`TapeStore`]; everything
//! above it (agents, CLI) depends only on this crate.

use serde::{Deserialize, Serialize};
use tape_kernel_domain::{Tape, TapeId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tape not found: {0}")]
    NotFound(TapeId),
    #[error("store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Filter for [`TapeStore::search_tapes`]. Empty filters match every tape.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TapeSearch {
    /// Match tapes containing at least one step by this agent.
    pub agent: Option<String>,
    /// Match tapes containing at least one step recorded at this node.
    pub node: Option<String>,
}

impl TapeSearch {
    #[must_use]
    pub fn by_agent(agent: impl Into<String>) -> Self {
        Self {
            agent: Some(agent.into()),
            node: None,
        }
    }

    #[must_use]
    pub fn by_node(node: impl Into<String>) -> Self {
        Self {
            agent: None,
            node: Some(node.into()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agent.is_none() && self.node.is_none()
    }
}

/// Keyed, lineage-aware tape storage.
///
/// Saving is an upsert keyed by the tape's own id: saving the same tape
/// again persists only the steps appended since the previous save, so a
/// grown tape can be checkpointed repeatedly. Stored steps are never
/// rewritten.
pub trait TapeStore: Send + Sync {
    /// Create or upgrade the backend schema. Idempotent.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when migration fails.
    fn migrate(&self) -> Result<(), StoreError>;

    /// Persist the tape under its `tape_id` and return that id.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when persistence fails.
    fn save_tape(&self, tape: &Tape) -> Result<TapeId, StoreError>;

    /// Load a tape with its full step sequence in original order.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] for unknown ids, [`StoreError::Backend`]
    /// for backend failures.
    fn load_tape(&self, tape_id: TapeId) -> Result<Tape, StoreError>;

    /// Walk the fork lineage from this tape to its root, child first.
    /// Traversal stops silently at a parent that was never saved.
    ///
    /// # Errors
    /// [`StoreError::NotFound`] when the starting tape is unknown.
    fn get_tape_history(&self, tape_id: TapeId) -> Result<Vec<TapeId>, StoreError>;

    /// Ids of every stored tape matching the filter, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the query fails.
    fn search_tapes(&self, filter: &TapeSearch) -> Result<Vec<TapeId>, StoreError>;

    /// Ids of every stored tape, newest first.
    ///
    /// # Errors
    /// Returns [`StoreError::Backend`] when the query fails.
    fn list_tapes(&self) -> Result<Vec<TapeId>, StoreError> {
        self.search_tapes(&TapeSearch::default())
    }
}

#[cfg(test)]
mod tests {
    use super::TapeSearch;

    #[test]
    fn default_filter_is_empty() {
        assert!(TapeSearch::default().is_empty());
        assert!(!TapeSearch::by_agent("a").is_empty());
        assert!(!TapeSearch::by_node("n").is_empty());
    }
}
