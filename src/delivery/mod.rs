//! Delivery Batcher: campaign -> tracked per-recipient deliveries -> provider.

mod batcher;
mod send_gate;

pub use batcher::*;
pub use send_gate::SendGate;

use crate::domain::InvalidTransition;
use crate::store::StoreError;
use crate::telemetry::error_chain_fmt;
use serde::Serialize;

#[derive(thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
}

impl std::fmt::Debug for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueReport {
    /// Eligible recipients after suppression filtering.
    pub recipients: usize,
    /// Rows actually created; re-enqueueing skips existing pairs.
    pub queued: usize,
    pub suppressed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub claimed: usize,
    pub accepted: usize,
    pub deferred: usize,
    pub retrying: usize,
    pub failed: usize,
    pub suppressed: usize,
    pub conflicts: usize,
    pub errors: usize,
    pub requeued_stale: usize,
}
