use std::fmt;
use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source-ip predicate an agent record is constrained to: `any`, matching
/// every peer address, an exact literal, or a CIDR block (spec.md §4.3
/// step 3 / §6: "an accepted CIDR literal").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IpPredicate {
    Any,
    Exact(IpAddr),
    Cidr(IpAddr, u8),
}

impl IpPredicate {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("any") {
            return Some(Self::Any);
        }
        if let Some((addr_part, prefix_part)) = raw.split_once('/') {
            let addr: IpAddr = addr_part.parse().ok()?;
            let prefix: u8 = prefix_part.parse().ok()?;
            let max_prefix = if addr.is_ipv4() { 32 } else { 128 };
            if prefix > max_prefix {
                return None;
            }
            return Some(Self::Cidr(addr, prefix));
        }
        raw.parse::<IpAddr>().ok().map(Self::Exact)
    }

    pub fn matches(&self, peer: &IpAddr) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(addr) => addr == peer,
            Self::Cidr(network, prefix) => cidr_contains(network, *prefix, peer),
        }
    }
}

/// Whether `peer` falls inside `network/prefix`. Mixed IPv4/IPv6 never
/// matches; the shift is guarded against the full-width case (`prefix ==
/// 0`), which would otherwise be an out-of-range shift.
fn cidr_contains(network: &IpAddr, prefix: u8, peer: &IpAddr) -> bool {
    match (network, peer) {
        (IpAddr::V4(net), IpAddr::V4(addr)) => {
            let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
            u32::from(*net) & mask == u32::from(*addr) & mask
        }
        (IpAddr::V6(net), IpAddr::V6(addr)) => {
            let mask = if prefix == 0 { 0 } else { u128::MAX << (128 - prefix) };
            u128::from(*net) & mask == u128::from(*addr) & mask
        }
        _ => false,
    }
}

impl fmt::Display for IpPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => write!(f, "any"),
            Self::Exact(addr) => write!(f, "{addr}"),
            Self::Cidr(addr, prefix) => write!(f, "{addr}/{prefix}"),
        }
    }
}

/// A single enrolled agent identity. Mirrors spec.md §3's essential
/// attribute list; `removed` is a lazy tombstone, distinct from the
/// record being dropped from the table entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub id: u32,
    pub name: String,
    pub ip: IpPredicate,
    pub raw_key: String,
    pub created_at: u64,
    pub group: Option<String>,
    pub removed: bool,
}

impl AgentRecord {
    pub fn new(id: u32, name: String, ip: IpPredicate, raw_key: String, group: Option<String>) -> Self {
        Self {
            id,
            name,
            ip,
            raw_key,
            created_at: now_unix(),
            group,
            removed: false,
        }
    }

    /// Textual id as it appears in the wire response and keystore file,
    /// zero-padded to three digits to match the on-disk grammar for small
    /// ids while still holding arbitrarily large ones.
    pub fn id_str(&self) -> String {
        format!("{:03}", self.id)
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
