//! Request coalescing.
//!
//! Requests that share a grouping key and arrive within one window are merged
//! into a single backend call; the single result is partitioned back to each
//! participant.

mod group;
mod strategy;

pub use group::{BatchQuery, Coalescer, CoalescingGroup, FlushedGroup, GroupKey, GroupState, Joined, Participant};
pub use strategy::{BatchStrategy, HousekeepingBatch, KeyedBatch};
