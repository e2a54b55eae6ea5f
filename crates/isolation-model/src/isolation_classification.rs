//! Isolation classification: the single comparable value a navigation's
//! cross-origin-isolation requirements reduce to.
//!
//! A browsing context is either non-isolated, cross-origin isolated bound to
//! a top-level origin, or isolated at "application" strength (which implies
//! an origin). The classification is a pure value: constructed by one of
//! three factories, copied freely, no identity beyond value equality.
//!
//! Two relations matter to callers:
//!
//! - the **total order** (non-isolated < isolated < application-isolated,
//!   then by origin within a tier), used to keep classification-keyed
//!   structures deterministic;
//! - the **compatibility relation** over *optional* classifications, used
//!   mid-navigation while the classification is not yet known: absent is
//!   compatible with everything, two present values only when equal.
//!
//! Plain `==` between an optional and a concrete classification would
//! silently treat "unknown" as a concrete value and mask a real isolation
//! mismatch; that comparison does not type-check in Rust, so misuse is
//! rejected at compile time. Use [`IsolationClassification::are_compatible`]
//! wherever an operand may be absent.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::url_info::Origin;

/// Whether a browsing context is non-isolated, cross-origin isolated, or
/// application-isolated. See the module docs for the two comparison
/// relations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsolationClassification {
    /// Present iff the context is isolated; the top-level origin the
    /// isolation is bound to.
    origin: Option<Origin>,
    /// Application-strength isolation. Implies `origin` is present; the
    /// factories are the only constructors, so the invariant holds by
    /// construction.
    application_isolation: bool,
}

impl IsolationClassification {
    pub fn non_isolated() -> Self {
        Self {
            origin: None,
            application_isolation: false,
        }
    }

    pub fn isolated(origin: Origin) -> Self {
        Self {
            origin: Some(origin),
            application_isolation: false,
        }
    }

    pub fn application_isolated(origin: Origin) -> Self {
        Self {
            origin: Some(origin),
            application_isolation: true,
        }
    }

    pub fn is_isolated(&self) -> bool {
        self.origin.is_some()
    }

    pub fn is_application_isolated(&self) -> bool {
        self.application_isolation
    }

    /// The origin the isolation is bound to; `None` for non-isolated.
    pub fn origin(&self) -> Option<&Origin> {
        self.origin.as_ref()
    }

    /// Compatibility over possibly-absent classifications: an absent value is
    /// compatible with everything (the classification is not yet known and
    /// must not force premature commitment); two present values are
    /// compatible iff equal.
    pub fn are_compatible(a: Option<&Self>, b: Option<&Self>) -> bool {
        match (a, b) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }

    fn tier_rank(&self) -> u8 {
        match (self.origin.is_some(), self.application_isolation) {
            (false, _) => 0,
            (true, false) => 1,
            (true, true) => 2,
        }
    }
}

impl Ord for IsolationClassification {
    // Tier first, then origin within the isolated tiers. A derived ordering
    // would compare origins before tiers and break
    // isolated(b) < application-isolated(a).
    fn cmp(&self, other: &Self) -> Ordering {
        self.tier_rank()
            .cmp(&other.tier_rank())
            .then_with(|| self.origin.cmp(&other.origin))
    }
}

impl PartialOrd for IsolationClassification {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for IsolationClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.origin, self.application_isolation) {
            (None, _) => write!(f, "non-isolated"),
            (Some(origin), false) => write!(f, "isolated({origin})"),
            (Some(origin), true) => write!(f, "application-isolated({origin})"),
        }
    }
}
