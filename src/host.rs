//! Host server — the processing pipeline valves are installed into.
//!
//! [`HostServer`] is the contract the lifecycle service consumes.
//! [`ValvePipeline`] is the in-process implementation: an ordered chain of
//! registered valves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::debug;

use crate::valve::Valve;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("valve instance is already registered")]
    AlreadyRegistered,

    #[error("no registration with id {0}")]
    UnknownRegistration(u64),

    #[error("host rejected valve: {0}")]
    Rejected(String),

    #[error("host pipeline lock poisoned")]
    Poisoned,
}

/// Proof of a live registration. Not `Clone`; [`HostServer::deregister`]
/// consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct RegistrationToken {
    id: u64,
}

impl RegistrationToken {
    /// Mint a token. Only [`HostServer`] implementations should call this.
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

pub trait HostServer: Send + Sync {
    fn register(&self, valve: Arc<dyn Valve>) -> Result<RegistrationToken, HostError>;
    fn deregister(&self, token: RegistrationToken) -> Result<(), HostError>;
}

struct Entry {
    id: u64,
    valve: Arc<dyn Valve>,
}

/// Ordered valve chain. Valves run in registration order.
#[derive(Default)]
pub struct ValvePipeline {
    chain: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
}

impl ValvePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read access that survives poisoning; entries are only ever pushed or
    /// removed whole.
    fn read(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the chain in processing order.
    pub fn valves(&self) -> Vec<Arc<dyn Valve>> {
        self.read().iter().map(|e| e.valve.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether any registered valve was created from `class`.
    pub fn contains(&self, class: &str) -> bool {
        self.valves().iter().any(|v| v.class_name() == class)
    }
}

impl HostServer for ValvePipeline {
    fn register(&self, valve: Arc<dyn Valve>) -> Result<RegistrationToken, HostError> {
        let mut chain = self.chain.lock().map_err(|_| HostError::Poisoned)?;
        if chain.iter().any(|e| Arc::ptr_eq(&e.valve, &valve)) {
            return Err(HostError::AlreadyRegistered);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, class = valve.class_name(), position = chain.len(), "valve added to pipeline");
        chain.push(Entry { id, valve });
        Ok(RegistrationToken::new(id))
    }

    fn deregister(&self, token: RegistrationToken) -> Result<(), HostError> {
        let mut chain = self.chain.lock().map_err(|_| HostError::Poisoned)?;
        let pos = chain
            .iter()
            .position(|e| e.id == token.id)
            .ok_or(HostError::UnknownRegistration(token.id))?;
        let removed = chain.remove(pos);
        debug!(id = token.id, class = removed.valve.class_name(), "valve removed from pipeline");
        Ok(())
    }
}
