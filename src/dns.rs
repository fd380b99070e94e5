//! DNS message parsing and construction.
//!
//! Decodes the header and first question of an inbound datagram, and
//! builds the synthesized responses this server sends itself: sinkhole
//! answers for blocked domains and failure replies when the upstream
//! does not answer. Forwarded traffic is relayed as raw bytes and only
//! passes through here for transaction id checks.

use std::net::Ipv4Addr;

use thiserror::Error;

const HEADER_LEN: usize = 12;
/// Maximum encoded length of a domain name (RFC 1035 §2.3.4).
const MAX_NAME_LEN: usize = 255;
/// Maximum length of a single label (RFC 1035 §2.3.4).
const MAX_LABEL_LEN: usize = 63;

/// QTYPE for IPv4 host addresses.
pub const TYPE_A: u16 = 1;
/// QCLASS for the Internet.
pub const CLASS_IN: u16 = 1;

/// Flags for a standard response, recursion available, no error.
const FLAGS_NOERROR: u16 = 0x8180;
/// Same, with RCODE set to SERVFAIL.
const FLAGS_SERVFAIL: u16 = 0x8182;

/// Why a datagram could not be decoded as a DNS query.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("datagram truncated")]
    Truncated,

    #[error("question count is zero")]
    NoQuestion,

    #[error("question name is empty")]
    EmptyName,

    #[error("label exceeds 63 bytes or uses compression")]
    BadLabel,

    #[error("label is not valid UTF-8")]
    BadEncoding,

    #[error("name exceeds 255 bytes")]
    NameTooLong,
}

/// How to answer the client when the upstream fails or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// Respond with RCODE SERVFAIL.
    ServFail,
    /// Respond with NOERROR and an empty answer section.
    Empty,
}

/// A parsed DNS query.
///
/// Only the first question is decoded; additional questions are ignored
/// for classification but the raw datagram is kept intact so the query
/// can be forwarded upstream byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Dot-separated question name, lowercased at decode time.
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
    raw: Vec<u8>,
    /// Offset one past the first question's QCLASS field.
    question_end: usize,
}

impl DnsQuery {
    /// Decode a DNS query from raw bytes.
    ///
    /// Every read is bounds-checked against the buffer; truncated labels,
    /// compression pointers in the question name, and oversized names are
    /// rejected rather than read past the end of attacker-controlled
    /// input.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < HEADER_LEN {
            return Err(DecodeError::Truncated);
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        if qdcount == 0 {
            return Err(DecodeError::NoQuestion);
        }

        // Parse the first question's name: length-prefixed labels,
        // terminated by a zero-length label.
        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();
        let mut name_len = 0usize;

        loop {
            let label_len = *data.get(pos).ok_or(DecodeError::Truncated)? as usize;
            pos += 1;
            if label_len == 0 {
                break;
            }
            if label_len > MAX_LABEL_LEN {
                // Also rejects compression pointers (top bits set), which
                // are not valid in a question we synthesize answers for.
                return Err(DecodeError::BadLabel);
            }
            name_len += label_len + 1;
            if name_len > MAX_NAME_LEN {
                return Err(DecodeError::NameTooLong);
            }
            let label = data
                .get(pos..pos + label_len)
                .ok_or(DecodeError::Truncated)?;
            let label = std::str::from_utf8(label).map_err(|_| DecodeError::BadEncoding)?;
            domain_parts.push(label.to_ascii_lowercase());
            pos += label_len;
        }

        if domain_parts.is_empty() {
            return Err(DecodeError::EmptyName);
        }

        // QTYPE and QCLASS
        let fixed = data.get(pos..pos + 4).ok_or(DecodeError::Truncated)?;
        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Ok(Self {
            id,
            flags,
            domain: domain_parts.join("."),
            qtype,
            qclass,
            raw: data.to_vec(),
            question_end: pos + 4,
        })
    }

    /// The original datagram, for verbatim forwarding.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Build a sinkhole response for this query.
    ///
    /// Reuses the transaction id and the question section verbatim, and
    /// appends a single A record whose name is a compression pointer to
    /// the question name at offset 12.
    pub fn sinkhole_response(&self, address: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.question_end + 16);

        self.push_header_and_question(&mut data, FLAGS_NOERROR, 1);

        // Answer record
        data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
        data.extend_from_slice(&TYPE_A.to_be_bytes());
        data.extend_from_slice(&CLASS_IN.to_be_bytes());
        data.extend_from_slice(&ttl.to_be_bytes());
        data.extend_from_slice(&4u16.to_be_bytes()); // RDLENGTH
        data.extend_from_slice(&address.octets());

        data
    }

    /// Build a best-effort failure response for this query.
    pub fn failure_response(&self, mode: FailureMode) -> Vec<u8> {
        let flags = match mode {
            FailureMode::ServFail => FLAGS_SERVFAIL,
            FailureMode::Empty => FLAGS_NOERROR,
        };

        let mut data = Vec::with_capacity(self.question_end);
        self.push_header_and_question(&mut data, flags, 0);
        data
    }

    fn push_header_and_question(&self, data: &mut Vec<u8>, flags: u16, ancount: u16) {
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&flags.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
        data.extend_from_slice(&ancount.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT
        data.extend_from_slice(&self.raw[HEADER_LEN..self.question_end]);
    }
}

/// Transaction id of a raw DNS message, if it is long enough to have one.
pub fn response_id(message: &[u8]) -> Option<u16> {
    let bytes = message.get(..2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}
