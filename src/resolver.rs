//! DNS query resolution logic.
//!
//! Handles the per-query decision pipeline:
//! 1. Authorize the requester against the allow-list
//! 2. Decode the datagram
//! 3. Classify A queries against the current policy snapshot
//! 4. Decide whether to drop, answer with a sinkhole, or forward
//!
//! The dispatcher handles the actual I/O, the resolver handles
//! decisions. Exactly one policy snapshot is taken per query and used
//! for every decision about it.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use crate::dns::{DnsQuery, TYPE_A};
use crate::filter;
use crate::policy::PolicyStore;

/// Why a query was dropped without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Source address is not on the requester allow-list.
    Unauthorized,
    /// Datagram failed to decode (includes zero question count).
    Malformed,
}

/// Action to take for a DNS query.
#[derive(Debug)]
pub enum QueryAction {
    /// Drop silently; no packet goes back to the requester.
    Drop(DropReason),
    /// Domain is blocked; send this sinkhole response immediately.
    Sinkhole { response: Vec<u8>, domain: String },
    /// Relay the raw query to the upstream resolver.
    Forward(DnsQuery),
}

/// Resolver handles DNS query processing decisions.
pub struct Resolver {
    store: Arc<PolicyStore>,
    sinkhole_address: Ipv4Addr,
    sinkhole_ttl: u32,
    restrict_requesters: bool,
}

impl Resolver {
    pub fn new(
        store: Arc<PolicyStore>,
        sinkhole_address: Ipv4Addr,
        sinkhole_ttl: u32,
        restrict_requesters: bool,
    ) -> Self {
        Self {
            store,
            sinkhole_address,
            sinkhole_ttl,
            restrict_requesters,
        }
    }

    /// Process one inbound datagram and decide what to do with it.
    ///
    /// Non-A queries are forwarded without classification. Unauthorized
    /// and malformed datagrams are dropped with no reply, so the wire
    /// never learns whether an address is admitted or why a packet was
    /// refused.
    pub fn process_query(&self, datagram: &[u8], src: IpAddr) -> QueryAction {
        // One snapshot per request; authorization and classification
        // both read from it.
        let snapshot = self.store.snapshot();

        if self.restrict_requesters && !snapshot.allows_requester(src) {
            return QueryAction::Drop(DropReason::Unauthorized);
        }

        let query = match DnsQuery::decode(datagram) {
            Ok(query) => query,
            Err(_) => return QueryAction::Drop(DropReason::Malformed),
        };

        if query.qtype != TYPE_A {
            return QueryAction::Forward(query);
        }

        match filter::filter_query(&snapshot, &query, self.sinkhole_address, self.sinkhole_ttl) {
            Some(response) => QueryAction::Sinkhole {
                response,
                domain: query.domain,
            },
            None => QueryAction::Forward(query),
        }
    }

    /// The policy store backing this resolver.
    pub fn store(&self) -> &PolicyStore {
        &self.store
    }
}
