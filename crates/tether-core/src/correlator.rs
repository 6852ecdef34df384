//! Host-side table of pending operations keyed by request id.
//!
//! Every in-flight call registers its id and receives a oneshot receiver.
//! [`CallbackCorrelator::deliver`] is the single inbound entry point for
//! completions: it removes the matching entry and hands the reply over. A
//! second delivery for the same id finds nothing and reports
//! [`DeliveryStatus::NotFound`], which is expected for late or duplicated
//! responses.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::trace;

use crate::envelope::ResponseEnvelope;

/// A response received from the device for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReply {
    pub envelope: ResponseEnvelope,
    pub binary: Vec<u8>,
}

/// Result of [`CallbackCorrelator::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The reply was handed to the waiting operation.
    Delivered,
    /// No operation with that id is pending.
    NotFound,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CorrelatorError {
    #[error("request id {0} is already pending")]
    DuplicateId(String),
}

/// Shared pending-operations table. Clones refer to the same table.
#[derive(Debug, Clone, Default)]
pub struct CallbackCorrelator {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<DeviceReply>>>>,
}

impl CallbackCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<DeviceReply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` and return the receiver its reply will arrive on.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<DeviceReply>, CorrelatorError> {
        let mut table = self.table();
        if table.contains_key(id) {
            return Err(CorrelatorError::DuplicateId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        table.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Remove `id` without delivering. Returns whether it was pending.
    pub fn cancel(&self, id: &str) -> bool {
        self.table().remove(id).is_some()
    }

    /// Hand `reply` to the operation pending under `id`.
    pub fn deliver(&self, id: &str, reply: DeviceReply) -> DeliveryStatus {
        let Some(tx) = self.table().remove(id) else {
            trace!(id, "no pending operation");
            return DeliveryStatus::NotFound;
        };
        match tx.send(reply) {
            Ok(()) => DeliveryStatus::Delivered,
            // The caller stopped waiting between lookup and send.
            Err(_) => DeliveryStatus::NotFound,
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.table().contains_key(id)
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}
