use std::time::Instant;

/// Why a descriptor is currently `Resting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestReason {
    Overloaded,
    Forced,
}

/// The three mutually-exclusive states a descriptor can be in. The
/// Registry is the sole mutator; every transition acquires the
/// Registry's selection lock.
#[derive(Debug, Clone)]
pub enum ProxyState {
    /// Eligible for selection.
    Available,
    /// Failed health check or exceeded the failure budget; ineligible,
    /// subject to periodic probing.
    Unavailable,
    /// Temporarily withdrawn; ineligible until `now >= until`. The
    /// streak that produced `until` lives on `ProxyRecord` rather than
    /// here, since it must survive the round-trip back to `Available`:
    /// `overload_streak` is monotonically non-decreasing until a
    /// successful request resets it to zero, and a plain timer expiry
    /// is not a success.
    Resting { until: Instant, reason: RestReason },
}

impl ProxyState {
    pub fn is_available(&self) -> bool {
        matches!(self, ProxyState::Available)
    }

    pub fn is_resting(&self) -> bool {
        matches!(self, ProxyState::Resting { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            ProxyState::Available => "available",
            ProxyState::Unavailable => "unavailable",
            ProxyState::Resting { .. } => "resting",
        }
    }
}
