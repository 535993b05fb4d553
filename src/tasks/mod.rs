//! Background Tasks Module
//!
//! Long-lived tasks spawned by the cache: one expiration sweeper per shard.

pub(crate) mod cleanup;

pub(crate) use cleanup::{spawn_cleaner, CleanerHandle};
