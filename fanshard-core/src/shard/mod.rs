mod handle;
mod native;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use handle::{OpenSessionEvent, Shard, ShardRef};
pub use native::{NativeSession, NativeSessionFactory, NativeTransaction};

/// Identifier of a physical or virtual shard.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct ShardId(u64);

impl ShardId {
    #[inline]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for ShardId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<ShardId> for u64 {
    fn from(value: ShardId) -> Self {
        value.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ShardId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(ShardId)
    }
}
