//! DNS query filtering module.
//!
//! Classifies decoded queries against the currently published policy
//! snapshot and synthesizes sinkhole responses for blocked domains.

pub mod matcher;

use std::net::Ipv4Addr;

pub use matcher::is_blocked;

use crate::dns::DnsQuery;
use crate::policy::PolicySnapshot;

/// Check a decoded query against a policy snapshot.
///
/// Returns `Some(response)` with a ready-to-send sinkhole answer if the
/// domain is blocked, `None` if the query should be forwarded upstream.
pub fn filter_query(
    snapshot: &PolicySnapshot,
    query: &DnsQuery,
    sinkhole: Ipv4Addr,
    ttl: u32,
) -> Option<Vec<u8>> {
    if is_blocked(snapshot, &query.domain) {
        Some(query.sinkhole_response(sinkhole, ttl))
    } else {
        None
    }
}
