//! What to decide while the counter store cannot be consulted.

/// Outcome policy for requests that arrive while the store is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegradedPolicy {
    /// Admit everything and report the full quota
    AllowAll,
    /// Reject everything, exactly like a quota breach
    #[default]
    RejectAll,
}

impl DegradedPolicy {
    /// Policy for the `allow_if_store_down` setting.
    pub fn from_allow(allow_if_store_down: bool) -> Self {
        if allow_if_store_down {
            DegradedPolicy::AllowAll
        } else {
            DegradedPolicy::RejectAll
        }
    }

    /// Admission decision without store state.
    pub fn admits(&self) -> bool {
        matches!(self, DegradedPolicy::AllowAll)
    }

    /// Remaining quota to report without store state.
    ///
    /// The true state is unknown, so an admitting policy reports the
    /// optimistic value and a rejecting one reports nothing left.
    pub fn remaining(&self, limit: u64) -> u64 {
        match self {
            DegradedPolicy::AllowAll => limit,
            DegradedPolicy::RejectAll => 0,
        }
    }
}
