use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::error::ShardError;
use crate::shard::ShardId;
use crate::strategy::access::{
    MergeOrder, ParallelShardAccessStrategy, SequentialShardAccessStrategy,
    ShardAccessStrategy, ShardOrdering,
};

#[derive(Envconfig, Clone, Debug)]
pub struct FanshardConfig {
    #[envconfig(from = "FANSHARD_ACCESS_STRATEGY", default = "sequential")]
    pub access_strategy: AccessStrategyKind,

    #[envconfig(from = "FANSHARD_SHARD_ORDERING", default = "input")]
    pub shard_ordering: OrderingKind,

    #[envconfig(from = "FANSHARD_MAX_CONCURRENCY", default = "0")]
    pub max_concurrency: usize,

    #[envconfig(from = "FANSHARD_MERGE_ORDER", default = "shard")]
    pub merge_order: MergeOrder,

    #[envconfig(from = "FANSHARD_TXN_TIMEOUT_SECS")]
    pub txn_timeout_secs: Option<u32>,

    #[envconfig(from = "FANSHARD_VIRTUAL_SHARDS")]
    pub virtual_shards: Option<VirtualShardMap>,
}

impl Default for FanshardConfig {
    fn default() -> Self {
        Self {
            access_strategy: AccessStrategyKind::Sequential,
            shard_ordering: OrderingKind::Input,
            max_concurrency: 0,
            merge_order: MergeOrder::ShardOrder,
            txn_timeout_secs: None,
            virtual_shards: None,
        }
    }
}

impl FanshardConfig {
    pub fn build_access_strategy(&self) -> ShardAccessStrategy {
        let ordering = ShardOrdering::from(self.shard_ordering);
        match self.access_strategy {
            AccessStrategyKind::Sequential => {
                SequentialShardAccessStrategy::new()
                    .with_ordering(ordering)
                    .into()
            }
            AccessStrategyKind::Parallel => ParallelShardAccessStrategy::new()
                .with_ordering(ordering)
                .with_max_concurrency(self.max_concurrency)
                .with_merge_order(self.merge_order)
                .into(),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AccessStrategyKind {
    #[default]
    Sequential,
    Parallel,
}

impl FromStr for AccessStrategyKind {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sequential" => Ok(AccessStrategyKind::Sequential),
            "parallel" | "concurrent" => Ok(AccessStrategyKind::Parallel),
            other => Err(ShardError::configuration(format!(
                "unknown access strategy `{}`",
                other
            ))),
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum OrderingKind {
    #[default]
    Input,
    RoundRobin,
    Random,
}

impl FromStr for OrderingKind {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "input_order" => Ok(OrderingKind::Input),
            "round_robin" | "round-robin" => Ok(OrderingKind::RoundRobin),
            "random" => Ok(OrderingKind::Random),
            other => Err(ShardError::configuration(format!(
                "unknown shard ordering `{}`",
                other
            ))),
        }
    }
}

impl From<OrderingKind> for ShardOrdering {
    fn from(kind: OrderingKind) -> Self {
        match kind {
            OrderingKind::Input => ShardOrdering::InputOrder,
            OrderingKind::RoundRobin => ShardOrdering::round_robin(),
            OrderingKind::Random => ShardOrdering::Random,
        }
    }
}

/// Many-to-one map from virtual shard ids to the physical shards hosting
/// them. An empty map means every shard id is its own physical shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VirtualShardMap {
    map: BTreeMap<ShardId, ShardId>,
}

impl VirtualShardMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, virtual_id: ShardId, physical_id: ShardId) -> Self {
        self.map.insert(virtual_id, physical_id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn physical_of(&self, virtual_id: ShardId) -> Option<ShardId> {
        self.map.get(&virtual_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShardId, ShardId)> + '_ {
        self.map.iter().map(|(v, p)| (*v, *p))
    }

    /// Physical shard id to the virtual ids it hosts.
    pub fn inverse(&self) -> BTreeMap<ShardId, BTreeSet<ShardId>> {
        let mut inverse: BTreeMap<ShardId, BTreeSet<ShardId>> = BTreeMap::new();
        for (virtual_id, physical_id) in self.iter() {
            inverse.entry(physical_id).or_default().insert(virtual_id);
        }
        inverse
    }
}

impl FromIterator<(ShardId, ShardId)> for VirtualShardMap {
    fn from_iter<I: IntoIterator<Item = (ShardId, ShardId)>>(iter: I) -> Self {
        Self {
            map: iter.into_iter().collect(),
        }
    }
}

/// Parses `virtual=physical` pairs separated by commas, e.g. `0=0,1=0,2=1`.
impl FromStr for VirtualShardMap {
    type Err = ShardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = BTreeMap::new();
        for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (virtual_id, physical_id) =
                pair.split_once('=').ok_or_else(|| {
                    ShardError::configuration(format!(
                        "virtual shard entry `{}` is not `virtual=physical`",
                        pair
                    ))
                })?;
            let parse = |id: &str| {
                id.parse::<ShardId>().map_err(|e| {
                    ShardError::configuration(format!(
                        "invalid shard id `{}`: {}",
                        id.trim(),
                        e
                    ))
                })
            };
            let virtual_id = parse(virtual_id)?;
            if map.insert(virtual_id, parse(physical_id)?).is_some() {
                return Err(ShardError::configuration(format!(
                    "virtual shard {} is mapped twice",
                    virtual_id
                )));
            }
        }
        Ok(Self { map })
    }
}

impl fmt::Display for VirtualShardMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .iter()
            .map(|(v, p)| format!("{}={}", v, p))
            .collect();
        write!(f, "{}", pairs.join(","))
    }
}
