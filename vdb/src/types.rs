// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Prefix4 {
    pub value: Ipv4Addr,
    pub length: u8,
}

impl Prefix4 {
    /// Create a prefix with any host bits below `length` cleared.
    pub fn new(value: Ipv4Addr, length: u8) -> Self {
        let bits = u32::from(value) & mask4(length);
        Self {
            value: Ipv4Addr::from(bits),
            length,
        }
    }

    pub fn covers(&self, other: &Prefix4) -> bool {
        self.length <= other.length
            && u32::from(other.value) & mask4(self.length)
                == u32::from(self.value)
    }
}

fn mask4(length: u8) -> u32 {
    if length == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(length.min(32)))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Prefix6 {
    pub value: Ipv6Addr,
    pub length: u8,
}

impl Prefix6 {
    /// Create a prefix with any host bits below `length` cleared.
    pub fn new(value: Ipv6Addr, length: u8) -> Self {
        let bits = u128::from(value) & mask6(length);
        Self {
            value: Ipv6Addr::from(bits),
            length,
        }
    }

    pub fn covers(&self, other: &Prefix6) -> bool {
        self.length <= other.length
            && u128::from(other.value) & mask6(self.length)
                == u128::from(self.value)
    }
}

fn mask6(length: u8) -> u128 {
    if length == 0 {
        0
    } else {
        u128::MAX << (128 - u128::from(length.min(128)))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum Prefix {
    V4(Prefix4),
    V6(Prefix6),
}

impl Prefix {
    pub fn length(&self) -> u8 {
        match self {
            Self::V4(p) => p.length,
            Self::V6(p) => p.length,
        }
    }

    /// Width of the address family in bits, 32 for IPv4 and 128 for IPv6.
    pub fn family_width(&self) -> u8 {
        match self {
            Self::V4(_) => 32,
            Self::V6(_) => 128,
        }
    }

    pub fn is_v4(&self) -> bool {
        matches!(self, Self::V4(_))
    }

    /// True if `other` is equal to or more specific than this prefix.
    pub fn covers(&self, other: &Prefix) -> bool {
        match (self, other) {
            (Self::V4(a), Prefix::V4(b)) => a.covers(b),
            (Self::V6(a), Prefix::V6(b)) => a.covers(b),
            _ => false,
        }
    }
}

impl Display for Prefix {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(p) => write!(f, "{}/{}", p.value, p.length),
            Self::V6(p) => write!(f, "{}/{}", p.value, p.length),
        }
    }
}

impl FromStr for Prefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) = s
            .split_once('/')
            .ok_or_else(|| Error::InvalidPrefix(s.to_owned()))?;
        let length: u8 = len
            .parse()
            .map_err(|_| Error::InvalidPrefix(s.to_owned()))?;
        if let Ok(v4) = addr.parse::<Ipv4Addr>() {
            if length > 32 {
                return Err(Error::InvalidPrefix(s.to_owned()));
            }
            return Ok(Prefix::V4(Prefix4::new(v4, length)));
        }
        if let Ok(v6) = addr.parse::<Ipv6Addr>() {
            if length > 128 {
                return Err(Error::InvalidPrefix(s.to_owned()));
            }
            return Ok(Prefix::V6(Prefix6::new(v6, length)));
        }
        Err(Error::InvalidPrefix(s.to_owned()))
    }
}

/// A Validated ROA Payload: `asn` may originate any prefix covered by
/// `prefix` up to `max_length` bits. Identity is the full triple, so sets of
/// these perform the dedup required by the RTR data model.
#[derive(
    Debug,
    Copy,
    Clone,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Vrp {
    pub prefix: Prefix,
    pub asn: u32,
    pub max_length: u8,
}

impl Vrp {
    /// A VRP is accepted only when the network length is non-zero, no longer
    /// than `max_length`, and `max_length` fits the address family.
    pub fn is_valid(&self) -> bool {
        let len = self.prefix.length();
        len != 0 && len <= self.max_length
            && self.max_length <= self.prefix.family_width()
    }
}

impl Display for Vrp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> AS{} maxlen {}", self.prefix, self.asn, self.max_length)
    }
}

pub type VrpSet = BTreeSet<Vrp>;

/// Count (v4, v6) members of a set.
pub fn family_counts(set: &VrpSet) -> (usize, usize) {
    let v4 = set.iter().filter(|v| v.prefix.is_v4()).count();
    (v4, set.len() - v4)
}

/// The change between two consecutive snapshots. A VRP never appears on both
/// sides.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Delta {
    pub announced: Vec<Vrp>,
    pub withdrawn: Vec<Vrp>,
}

impl Delta {
    pub fn compute(from: &VrpSet, to: &VrpSet) -> Delta {
        Delta {
            announced: to.difference(from).copied().collect(),
            withdrawn: from.difference(to).copied().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.announced.is_empty() && self.withdrawn.is_empty()
    }

    pub fn apply(&self, set: &VrpSet) -> VrpSet {
        let mut result = set.clone();
        for v in &self.withdrawn {
            result.remove(v);
        }
        for v in &self.announced {
            result.insert(*v);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn vrp(s: &str, asn: u32, max_length: u8) -> Vrp {
        Vrp {
            prefix: s.parse().unwrap(),
            asn,
            max_length,
        }
    }

    #[test]
    fn prefix_parse_masks_host_bits() {
        let p: Prefix = "10.1.2.3/24".parse().unwrap();
        assert_eq!(p.to_string(), "10.1.2.0/24");

        let p: Prefix = "2001:db8::1/32".parse().unwrap();
        assert_eq!(p.to_string(), "2001:db8::/32");
    }

    #[test]
    fn prefix_parse_rejects_garbage() {
        assert!("10.0.0.0".parse::<Prefix>().is_err());
        assert!("10.0.0.0/33".parse::<Prefix>().is_err());
        assert!("2001:db8::/129".parse::<Prefix>().is_err());
        assert!("banana/24".parse::<Prefix>().is_err());
    }

    #[test]
    fn prefix_covers() {
        let p: Prefix = "10.0.0.0/8".parse().unwrap();
        assert!(p.covers(&"10.1.0.0/16".parse().unwrap()));
        assert!(p.covers(&"10.0.0.0/8".parse().unwrap()));
        assert!(!p.covers(&"11.0.0.0/16".parse().unwrap()));
        assert!(!p.covers(&"10.0.0.0/7".parse().unwrap()));
        assert!(!p.covers(&"2001:db8::/32".parse().unwrap()));
    }

    #[test]
    fn vrp_validity() {
        assert!(vrp("10.0.0.0/24", 1, 24).is_valid());
        assert!(vrp("2001:db8::/32", 2, 48).is_valid());
        // max length shorter than the network length
        assert!(!vrp("10.0.0.0/24", 1, 23).is_valid());
        // max length wider than the family
        assert!(!vrp("10.0.0.0/24", 1, 64).is_valid());
        // zero length network
        assert!(!vrp("0.0.0.0/0", 1, 0).is_valid());
    }

    #[test]
    fn delta_round_trip() {
        let a: VrpSet = [vrp("10.0.0.0/24", 1, 24), vrp("2001:db8::/32", 2, 48)]
            .into_iter()
            .collect();
        let b: VrpSet = [vrp("10.0.0.0/24", 1, 24), vrp("10.0.1.0/24", 1, 24)]
            .into_iter()
            .collect();

        let d = Delta::compute(&a, &b);
        assert_eq!(d.announced, vec![vrp("10.0.1.0/24", 1, 24)]);
        assert_eq!(d.withdrawn, vec![vrp("2001:db8::/32", 2, 48)]);
        assert_eq!(d.apply(&a), b);
    }
}
