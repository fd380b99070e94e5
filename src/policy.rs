//! Block policy snapshots and the store that publishes them.
//!
//! The external policy source hands us an uncompiled [`PolicyRules`]
//! triple; we validate and compile it into an immutable
//! [`PolicySnapshot`] and swap it in atomically. Readers load the
//! current snapshot without locking and hold that one reference for the
//! whole request, so a concurrent publish can never produce a decision
//! based on a mix of old and new rules.

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Uncompiled policy input, as supplied by the external policy source.
#[derive(Debug, Clone, Default)]
pub struct PolicyRules {
    /// Category name → domain patterns (exact or `*.suffix`).
    pub blocked_domains: FxHashMap<String, Vec<String>>,
    /// Category name → whether its patterns are actively blocking.
    /// Categories without an entry default to active.
    pub subcategory_enabled: FxHashMap<String, bool>,
    /// Source addresses permitted to query.
    pub allowed_requesters: FxHashSet<IpAddr>,
}

/// Why a submitted policy was rejected.
///
/// Rejection is all-or-nothing: the previously published snapshot stays
/// in effect.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("category name cannot be empty")]
    EmptyCategoryName,

    #[error("category {category:?} contains an empty pattern")]
    EmptyPattern { category: String },

    #[error("category {category:?} has invalid wildcard pattern {pattern:?}")]
    InvalidWildcard { category: String, pattern: String },

    #[error("category {category:?} has invalid pattern {pattern:?}")]
    InvalidPattern { category: String, pattern: String },
}

/// Compiled patterns for one category.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Category {
    active: bool,
    /// Exact matches, lowercased with trailing dot stripped.
    exact: FxHashSet<String>,
    /// Wildcard suffixes stored with a leading dot (`*.x.y` → `.x.y`),
    /// so `ends_with` respects label boundaries and excludes the bare
    /// suffix domain itself.
    wildcard_suffixes: Vec<String>,
}

impl Category {
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn matches(&self, normalized: &str) -> bool {
        if self.exact.contains(normalized) {
            return true;
        }
        self.wildcard_suffixes
            .iter()
            .any(|suffix| normalized.ends_with(suffix.as_str()))
    }
}

/// An immutable, fully-formed policy state.
///
/// Constructed once per publish and never mutated afterwards.
#[derive(Debug, PartialEq, Eq)]
pub struct PolicySnapshot {
    categories: FxHashMap<String, Category>,
    allowed_requesters: FxHashSet<IpAddr>,
    pattern_count: usize,
}

impl PolicySnapshot {
    /// Validate and compile uncompiled rules.
    ///
    /// Fails on the first structural problem without producing a
    /// partially usable snapshot.
    pub fn compile(rules: &PolicyRules) -> Result<Self, PolicyError> {
        let mut categories = FxHashMap::default();
        let mut pattern_count = 0usize;

        for (name, patterns) in &rules.blocked_domains {
            if name.trim().is_empty() {
                return Err(PolicyError::EmptyCategoryName);
            }

            let active = rules.subcategory_enabled.get(name).copied().unwrap_or(true);
            let mut exact = FxHashSet::default();
            let mut wildcard_suffixes = Vec::new();

            for pattern in patterns {
                let normalized = normalize(pattern);
                if normalized.is_empty() {
                    return Err(PolicyError::EmptyPattern {
                        category: name.clone(),
                    });
                }

                if let Some(suffix) = normalized.strip_prefix("*.") {
                    if suffix.is_empty() || suffix.contains('*') {
                        return Err(PolicyError::InvalidWildcard {
                            category: name.clone(),
                            pattern: pattern.clone(),
                        });
                    }
                    wildcard_suffixes.push(format!(".{suffix}"));
                } else if normalized.contains('*') || normalized.contains(char::is_whitespace) {
                    return Err(PolicyError::InvalidPattern {
                        category: name.clone(),
                        pattern: pattern.clone(),
                    });
                } else {
                    exact.insert(normalized);
                }
                pattern_count += 1;
            }

            categories.insert(
                name.clone(),
                Category {
                    active,
                    exact,
                    wildcard_suffixes,
                },
            );
        }

        Ok(Self {
            categories,
            allowed_requesters: rules.allowed_requesters.clone(),
            pattern_count,
        })
    }

    /// Whether a source address is permitted to query.
    pub fn allows_requester(&self, addr: IpAddr) -> bool {
        self.allowed_requesters.contains(&addr)
    }

    /// Total number of compiled patterns across all categories.
    pub fn pattern_count(&self) -> usize {
        self.pattern_count
    }

    pub(crate) fn categories(&self) -> impl Iterator<Item = &Category> {
        self.categories.values()
    }
}

/// Holds the currently published snapshot.
///
/// Reads are lock-free atomic loads; publishes validate and compile the
/// whole submission before swapping the reference, so concurrent
/// readers see either the entire old snapshot or the entire new one.
pub struct PolicyStore {
    current: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Create a store with an already-compiled initial snapshot.
    pub fn new(initial: PolicySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Compile initial rules and create the store, rejecting invalid
    /// input before anything is published.
    pub fn from_rules(rules: &PolicyRules) -> Result<Self, PolicyError> {
        Ok(Self::new(PolicySnapshot::compile(rules)?))
    }

    /// The currently published snapshot.
    ///
    /// Callers take exactly one snapshot per request and use it for
    /// every decision in that request.
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Atomically replace the published snapshot.
    ///
    /// A structurally invalid submission is rejected in full and the
    /// previous snapshot remains authoritative.
    pub fn publish(&self, rules: &PolicyRules) -> Result<(), PolicyError> {
        let compiled = PolicySnapshot::compile(rules)?;
        self.current.store(Arc::new(compiled));
        Ok(())
    }
}

/// Lowercase and strip a single trailing dot.
pub(crate) fn normalize(domain: &str) -> String {
    let domain = domain.trim();
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    domain.to_ascii_lowercase()
}
