//! Process-wide state shared by every connector and run.

use std::sync::atomic::{AtomicBool, Ordering};

/// Records that at least one cloud resource could not be deleted.
///
/// The flag only ever moves from lowered to raised, so concurrent writers
/// cannot lose an update.
#[derive(Debug, Default)]
pub struct IncompleteDeletionFlag(AtomicBool);

impl IncompleteDeletionFlag {
    /// Marks the deletion as incomplete.
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once any deletion has been abandoned.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Settings and flags that outlive a single run.
#[derive(Debug, Default)]
pub struct Session {
    show_secrets: bool,
    incomplete_deletion: IncompleteDeletionFlag,
}

impl Session {
    /// Creates a session; `show_secrets` disables masking in logs.
    #[must_use]
    pub fn new(show_secrets: bool) -> Self {
        Self {
            show_secrets,
            incomplete_deletion: IncompleteDeletionFlag::default(),
        }
    }

    /// Whether secret values are written to logs unmasked.
    #[must_use]
    pub const fn show_secrets(&self) -> bool {
        self.show_secrets
    }

    /// Flag raised when a resource had to be abandoned.
    #[must_use]
    pub const fn incomplete_deletion(&self) -> &IncompleteDeletionFlag {
        &self.incomplete_deletion
    }
}
