//! Swiss numbers: vat-scoped addresses for exported objects and result slots.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::SlotNaming;
use crate::error::VatError;

/// Identity of a vat, as used in addresses and descriptors.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VatId(String);

impl VatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VatId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for VatId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Opaque address of an export or result slot inside its owning vat.
///
/// On the wire this is either an unsigned integer (numbers handed out by the
/// allocator) or a string (root addresses and result-slot hashes).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SwissNum {
    Num(u64),
    Text(String),
}

impl fmt::Display for SwissNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwissNum::Num(n) => write!(f, "{n}"),
            SwissNum::Text(s) => f.write_str(s),
        }
    }
}

impl From<u64> for SwissNum {
    fn from(n: u64) -> Self {
        SwissNum::Num(n)
    }
}

impl From<&str> for SwissNum {
    fn from(s: &str) -> Self {
        SwissNum::Text(s.to_string())
    }
}

/// A `<vatID>/<swiss>` address such as `vat2/0`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    pub vat: VatId,
    pub swiss: SwissNum,
}

impl Address {
    pub fn parse(text: &str) -> Result<Address, VatError> {
        let Some((vat, swiss)) = text.rsplit_once('/') else {
            return Err(VatError::MalformedAddress(text.to_string()));
        };
        if vat.is_empty() || swiss.is_empty() {
            return Err(VatError::MalformedAddress(text.to_string()));
        }
        Ok(Address {
            vat: VatId::from(vat),
            swiss: SwissNum::from(swiss),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vat, self.swiss)
    }
}

/// Per-vat counter behind every swissbase and export number.
///
/// One counter serves both kinds so a number is never handed out twice.
#[derive(Clone, Debug)]
pub struct SwissAllocator {
    next: u64,
}

impl SwissAllocator {
    pub fn new(first: u64) -> Self {
        Self { next: first }
    }

    /// Allocate the provisional name of an outbound call's result slot.
    pub fn next_base(&mut self) -> String {
        let n = self.bump();
        format!("base-{n}")
    }

    pub fn next_export(&mut self) -> SwissNum {
        SwissNum::Num(self.bump())
    }

    pub fn peek(&self) -> u64 {
        self.next
    }

    fn bump(&mut self) -> u64 {
        let n = self.next;
        self.next += 1;
        n
    }
}

/// Map a swissbase to the stable swiss number of its result slot.
///
/// Both ends of a connection must agree on the naming mode.
pub fn hash_of(naming: SlotNaming, base: &str) -> SwissNum {
    match naming {
        SlotNaming::Readable => SwissNum::Text(format!("hash-of-{base}")),
        SlotNaming::Sha256 => SwissNum::Text(format!("h-{}", to_hex(&digest(base.as_bytes())))),
    }
}

fn digest(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(HEX[(byte >> 4) as usize] as char);
        out.push(HEX[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_root_address() {
        let addr = Address::parse("vat2/0").unwrap();
        assert_eq!(addr.vat, VatId::from("vat2"));
        assert_eq!(addr.swiss, SwissNum::Text("0".into()));
        assert_eq!(addr.to_string(), "vat2/0");
    }

    #[test]
    fn parse_rejects_missing_parts() {
        assert!(Address::parse("vat2").is_err());
        assert!(Address::parse("/0").is_err());
        assert!(Address::parse("vat2/").is_err());
    }

    #[test]
    fn allocator_shares_one_counter() {
        let mut alloc = SwissAllocator::new(1);
        assert_eq!(alloc.next_base(), "base-1");
        assert_eq!(alloc.next_export(), SwissNum::Num(2));
        assert_eq!(alloc.next_base(), "base-3");
        assert_eq!(alloc.peek(), 4);
    }

    #[test]
    fn readable_hash_matches_reference_trace() {
        assert_eq!(
            hash_of(SlotNaming::Readable, "base-1"),
            SwissNum::Text("hash-of-base-1".into())
        );
    }

    #[test]
    fn sha256_hash_is_stable_and_distinct() {
        let a = hash_of(SlotNaming::Sha256, "base-1");
        let b = hash_of(SlotNaming::Sha256, "base-2");
        assert_eq!(a, hash_of(SlotNaming::Sha256, "base-1"));
        assert_ne!(a, b);
        let SwissNum::Text(text) = a else {
            panic!("expected text swiss");
        };
        assert!(text.starts_with("h-"));
        assert_eq!(text.len(), 2 + 64);
    }

    #[test]
    fn swiss_serializes_untagged() {
        assert_eq!(serde_json::to_string(&SwissNum::Num(3)).unwrap(), "3");
        assert_eq!(
            serde_json::to_string(&SwissNum::from("0")).unwrap(),
            "\"0\""
        );
        let parsed: SwissNum = serde_json::from_str("\"hash-of-base-1\"").unwrap();
        assert_eq!(parsed, SwissNum::from("hash-of-base-1"));
    }
}
