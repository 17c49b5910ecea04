//! Opaque 64-bit identifiers for members and clusters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// Identifier of a member or a cluster.
///
/// Ids are derived by hashing membership data, never chosen by the operator.
/// Zero is reserved to mean "no addressee" and is never assigned.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Id(pub u64);

impl Id {
    /// The reserved "no addressee" id.
    pub const fn none() -> Id {
        Id(0)
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Zero-padded 16-character hex form used in durable store keys.
    pub fn padded_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for Id {
    /// Unpadded lower-case hex, the form carried in wire headers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for Id {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s, 16).map(Id)
    }
}

impl From<u64> for Id {
    fn from(v: u64) -> Id {
        Id(v)
    }
}
