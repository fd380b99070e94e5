//! Domain matching against a policy snapshot.

use crate::policy::{self, PolicySnapshot};

/// Decide whether a domain is blocked under the given snapshot.
///
/// The domain is normalized (lowercased, trailing dot stripped) and
/// tested against every active category: a wildcard pattern `*.x`
/// matches proper subdomains of `x` only, an exact pattern matches the
/// identical normalized name only. Inactive categories are skipped
/// entirely. The result is a pure disjunction over categories, so
/// iteration order cannot change the outcome.
pub fn is_blocked(snapshot: &PolicySnapshot, domain: &str) -> bool {
    let normalized = policy::normalize(domain);
    snapshot
        .categories()
        .filter(|category| category.is_active())
        .any(|category| category.matches(&normalized))
}
