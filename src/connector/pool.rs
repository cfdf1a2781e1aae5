//! Pre-allocated addresses partitioned across the runs of a batch.

use tracing::error;

use super::ConnectorError;

/// Addresses discovered once by `prepare` and read-only afterwards.
///
/// Run `i` of the batch always receives entry `i`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressPool<T> {
    entries: Vec<T>,
}

impl<T> Default for AddressPool<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T> AddressPool<T> {
    /// Wraps discovered entries.
    #[must_use]
    pub const fn new(entries: Vec<T>) -> Self {
        Self { entries }
    }

    /// Builds a pool after checking it can serve `planned` runs.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::InsufficientAddresses`] when fewer entries
    /// than `planned` were discovered.
    pub fn for_batch(entries: Vec<T>, planned: usize) -> Result<Self, ConnectorError> {
        if entries.len() < planned {
            error!(
                available = entries.len(),
                needed = planned,
                "Not enough free addresses for the planned virtual machines"
            );
            return Err(ConnectorError::InsufficientAddresses {
                available: entries.len(),
                needed: planned,
            });
        }
        Ok(Self::new(entries))
    }

    /// Entry reserved for run `index`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::NoAddressForRun`] when the pool has no entry
    /// at `index`.
    pub fn for_run(&self, index: usize) -> Result<&T, ConnectorError> {
        self.entries
            .get(index)
            .ok_or(ConnectorError::NoAddressForRun { index })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when nothing was discovered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
