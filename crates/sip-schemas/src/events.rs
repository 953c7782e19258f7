//! Entity-change events.
//!
//! Write paths in the run store publish one of these after a committed
//! mutation; the cache-invalidation fabric subscribes and evicts the list
//! views affected by the entity. The store stays ignorant of cache concerns
//! and the coupling is single-directional.

use serde::{Deserialize, Serialize};

/// Which entity kind was created, updated, or deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityChanged {
    Stock,
    Exchange,
    Sector,
}
