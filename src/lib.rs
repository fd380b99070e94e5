//! Dnsgate - a filtering DNS interceptor.
//!
//! Classifies A queries from admitted requesters against an atomically
//! replaceable block policy and either sinkholes them or relays them to
//! an upstream resolver. This library exposes the components for
//! benchmarking and testing.

pub mod dns;
pub mod filter;
pub mod forward;
pub mod policy;
pub mod resolver;
pub mod server;
pub mod stats;
