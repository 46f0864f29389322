//! DNS name validation and the small slice of wire format the resolver needs:
//! building a single-question query, checking that a response answers it,
//! and reading the minimum record TTL.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ValidationError;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

const FLAG_QR: u16 = 0x8000;
const FLAG_RD: u16 = 0x0100;
const RCODE_MASK: u16 = 0x000F;
const RCODE_SERVFAIL: u16 = 2;
const RCODE_REFUSED: u16 = 5;

/// Lowercase `name`, strip one trailing dot, and check length and label rules.
pub fn normalize_name(name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    let name = name.strip_suffix('.').unwrap_or(name);

    if name.is_empty() {
        return Err(ValidationError::Empty);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong);
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err(ValidationError::EmptyLabel);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(ValidationError::LabelTooLong);
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        {
            return Err(ValidationError::InvalidCharacter);
        }
    }

    Ok(name.to_ascii_lowercase())
}

/// Query type, parsed from its mnemonic or from `TYPEnnn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryType(u16);

impl QueryType {
    pub const A: QueryType = QueryType(1);
    pub const NS: QueryType = QueryType(2);
    pub const CNAME: QueryType = QueryType(5);
    pub const SOA: QueryType = QueryType(6);
    pub const PTR: QueryType = QueryType(12);
    pub const MX: QueryType = QueryType(15);
    pub const TXT: QueryType = QueryType(16);
    pub const AAAA: QueryType = QueryType(28);
    pub const SRV: QueryType = QueryType(33);
    pub const SVCB: QueryType = QueryType(64);
    pub const HTTPS: QueryType = QueryType(65);
    pub const CAA: QueryType = QueryType(257);

    const NAMES: [(&'static str, QueryType); 12] = [
        ("A", Self::A),
        ("NS", Self::NS),
        ("CNAME", Self::CNAME),
        ("SOA", Self::SOA),
        ("PTR", Self::PTR),
        ("MX", Self::MX),
        ("TXT", Self::TXT),
        ("AAAA", Self::AAAA),
        ("SRV", Self::SRV),
        ("SVCB", Self::SVCB),
        ("HTTPS", Self::HTTPS),
        ("CAA", Self::CAA),
    ];

    pub fn code(self) -> u16 {
        self.0
    }
}

impl FromStr for QueryType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        if let Some((_, qtype)) = Self::NAMES.iter().find(|(name, _)| *name == upper) {
            return Ok(*qtype);
        }
        upper
            .strip_prefix("TYPE")
            .and_then(|n| n.parse::<u16>().ok())
            .filter(|&n| n != 0)
            .map(QueryType)
            .ok_or(ValidationError::QueryType)
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match Self::NAMES.iter().find(|(_, qtype)| qtype == self) {
            Some((name, _)) => f.write_str(name),
            None => write!(f, "TYPE{}", self.0),
        }
    }
}

/// A single-question DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// Build a recursive IN query for an already normalized domain.
    pub fn new(id: u16, domain: &str, qtype: QueryType) -> Self {
        Self {
            id,
            domain: domain.to_string(),
            qtype: qtype.code(),
            qclass: 1,
        }
    }

    /// Parse the header id and first question from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);

        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();

        while pos < data.len() {
            let label_len = data[pos] as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            // Compression is not valid in the first question.
            if label_len > MAX_LABEL_LEN {
                return None;
            }
            pos += 1;
            if pos + label_len > data.len() {
                return None;
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
            domain_parts.push(label);
            pos += label_len;
        }

        if domain_parts.is_empty() {
            return None;
        }

        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        Some(Self {
            id,
            domain: domain_parts.join(".").to_lowercase(),
            qtype,
            qclass,
        })
    }

    /// Encode to wire format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&FLAG_RD.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for label in self.domain.split('.') {
            data.push(label.len() as u8);
            data.extend_from_slice(label.as_bytes());
        }
        data.push(0);

        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());
        data
    }

    /// Whether `response` is a usable answer to this query.
    ///
    /// The id, QR flag and question must match. SERVFAIL and REFUSED are
    /// treated as upstream failures; NXDOMAIN is a valid answer.
    pub fn accepts(&self, response: &[u8]) -> bool {
        let Some(answered) = Self::parse(response) else {
            return false;
        };
        let flags = u16::from_be_bytes([response[2], response[3]]);
        let rcode = flags & RCODE_MASK;

        flags & FLAG_QR != 0
            && rcode != RCODE_SERVFAIL
            && rcode != RCODE_REFUSED
            && answered.id == self.id
            && answered.qtype == self.qtype
            && answered.qclass == self.qclass
            && answered.domain == self.domain
    }
}

/// Copy of `response` with its transaction id replaced.
pub fn with_id(response: &[u8], id: u16) -> Option<Vec<u8>> {
    if response.len() < 2 {
        return None;
    }
    let mut out = response.to_vec();
    out[..2].copy_from_slice(&id.to_be_bytes());
    Some(out)
}

/// Minimum TTL across all answer, authority and additional records.
///
/// Returns `None` when the response carries no records. OPT pseudo-records
/// are skipped since their TTL field holds EDNS flags.
pub fn min_ttl(response: &[u8]) -> Option<Duration> {
    const TYPE_OPT: u16 = 41;

    if response.len() < HEADER_LEN {
        return None;
    }

    let qdcount = u16::from_be_bytes([response[4], response[5]]) as usize;
    let ancount = u16::from_be_bytes([response[6], response[7]]) as usize;
    let nscount = u16::from_be_bytes([response[8], response[9]]) as usize;
    let arcount = u16::from_be_bytes([response[10], response[11]]) as usize;
    let total_rrs = ancount + nscount + arcount;

    if total_rrs == 0 {
        return None;
    }

    let mut pos = HEADER_LEN;

    for _ in 0..qdcount {
        pos = skip_name(response, pos);
        pos += 4; // QTYPE + QCLASS
    }

    let mut min = u32::MAX;

    for _ in 0..total_rrs {
        if pos >= response.len() {
            break;
        }
        pos = skip_name(response, pos);
        if pos + 10 > response.len() {
            break;
        }

        let rtype = u16::from_be_bytes([response[pos], response[pos + 1]]);
        let ttl = u32::from_be_bytes([
            response[pos + 4],
            response[pos + 5],
            response[pos + 6],
            response[pos + 7],
        ]);
        if rtype != TYPE_OPT {
            min = min.min(ttl);
        }

        let rdlength = u16::from_be_bytes([response[pos + 8], response[pos + 9]]) as usize;
        pos += 10 + rdlength;
    }

    (min != u32::MAX).then(|| Duration::from_secs(min as u64))
}

/// Position just past the (possibly compressed) name starting at `pos`.
fn skip_name(data: &[u8], mut pos: usize) -> usize {
    while pos < data.len() {
        let b = data[pos];
        if b == 0 {
            return pos + 1;
        }
        if b >= 0xC0 {
            return pos + 2;
        }
        pos += 1 + b as usize;
    }
    pos
}
