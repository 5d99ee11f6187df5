//! Cluster data model
//!
//! Instances (registered daemons), spaces, subspaces, regions and transfers.
//! Everything here is owned by [`Coordinator`](crate::coordinator::Coordinator);
//! nothing else mutates it.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

pub type InstanceId = u64;
pub type SpaceId = u32;
pub type TransferId = u16;

/// Size of the key-hash domain, `2^64`.
pub const HASH_SPACE: u128 = 1 << 64;

/// A typed attribute of a space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub datatype: String,
}

impl Dimension {
    pub fn new(name: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            datatype: datatype.into(),
        }
    }
}

/// A named table. Subspace 0 is the key subspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    pub name: String,
    pub dimensions: Vec<Dimension>,
    pub subspaces: Vec<Subspace>,
}

impl Space {
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        self.subspaces.iter().flat_map(|s| s.regions.iter())
    }

    pub fn regions_mut(&mut self) -> impl Iterator<Item = &mut Region> {
        self.subspaces.iter_mut().flat_map(|s| s.regions.iter_mut())
    }

    /// `(subspace, region)` index pairs, in configuration order.
    pub fn region_coords(&self) -> Vec<(usize, usize)> {
        self.subspaces
            .iter()
            .enumerate()
            .flat_map(|(ssi, s)| (0..s.regions.len()).map(move |ri| (ssi, ri)))
            .collect()
    }

    pub fn region(&self, subspace: usize, region: usize) -> Option<&Region> {
        self.subspaces.get(subspace)?.regions.get(region)
    }

    pub fn region_mut(&mut self, subspace: usize, region: usize) -> Option<&mut Region> {
        self.subspaces.get_mut(subspace)?.regions.get_mut(region)
    }
}

/// A partitioning of the hash domain along some of a space's dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subspace {
    pub dimensions: Vec<String>,
    pub nosearch: Vec<String>,
    pub regions: Vec<Region>,
}

/// A migration of a new replica into a region, queued behind any earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub xferid: TransferId,
    pub target: InstanceId,
}

/// Where a transfer lives; the cluster-wide transfer index maps ids to this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    pub xferid: TransferId,
    pub space: SpaceId,
    pub subspace: usize,
    pub region: usize,
    pub target: InstanceId,
}

/// One slice `[mask, mask + 2^(64 - prefix))` of the hash domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub prefix: u8,
    pub mask: u64,
    pub desired_f: u32,
    #[serde(default)]
    pub replicas: Vec<InstanceId>,
    #[serde(default)]
    pub transfers: VecDeque<PendingTransfer>,
}

impl Region {
    pub fn new(prefix: u8, mask: u64, desired_f: u32) -> Self {
        Self {
            prefix,
            mask,
            desired_f,
            replicas: Vec::new(),
            transfers: VecDeque::new(),
        }
    }

    /// Number of points covered, `2^(64 - prefix)`.
    pub fn span(&self) -> u128 {
        1u128 << (64 - u32::from(self.prefix))
    }

    /// Exclusive upper bound; `2^64` for the last region of a subspace.
    pub fn upper_bound(&self) -> u128 {
        u128::from(self.mask) + self.span()
    }

    /// Replica count minus one; `-1` when the region has no replicas.
    pub fn current_f(&self) -> i64 {
        self.replicas.len() as i64 - 1
    }

    pub fn is_under_replicated(&self) -> bool {
        self.current_f() < i64::from(self.desired_f)
    }

    /// The transfer currently in flight (head of the queue).
    pub fn transfer_in_progress(&self) -> Option<&PendingTransfer> {
        self.transfers.front()
    }

    /// Instances that hold or are about to hold this region.
    pub fn assigned(&self) -> Vec<InstanceId> {
        self.replicas
            .iter()
            .copied()
            .chain(self.transfers.iter().map(|t| t.target))
            .collect()
    }

    pub fn add_replica(&mut self, replica: InstanceId) {
        self.replicas.push(replica);
    }

    /// Drop `bad` instances from the replica list and from queued transfers.
    /// Returns the ids of the transfers that were dropped.
    pub fn remove_instances(&mut self, bad: &BTreeSet<InstanceId>) -> Vec<TransferId> {
        self.replicas.retain(|r| !bad.contains(r));
        let mut dropped = Vec::new();
        self.transfers.retain(|t| {
            if bad.contains(&t.target) {
                dropped.push(t.xferid);
                false
            } else {
                true
            }
        });
        dropped
    }

    pub fn transfer_initiate(&mut self, xferid: TransferId, target: InstanceId) {
        self.transfers.push_back(PendingTransfer { xferid, target });
    }

    fn head_matches(&self, xferid: TransferId, what: &str) -> Result<PendingTransfer> {
        match self.transfers.front() {
            None => Err(Error::Protocol(format!(
                "transfer \"{}\" message for unknown xferid {}",
                what, xferid
            ))),
            Some(head) if head.xferid != xferid => Err(Error::Protocol(format!(
                "transfer \"{}\" message for xferid {} while {} is in flight",
                what, xferid, head.xferid
            ))),
            Some(head) => Ok(*head),
        }
    }

    /// Promote the in-flight transfer's target to a replica.
    /// Returns whether the replica list changed.
    pub fn transfer_golive(&mut self, xferid: TransferId) -> Result<bool> {
        let head = self.head_matches(xferid, "golive")?;
        if self.replicas.last() != Some(&head.target) {
            self.replicas.push(head.target);
            return Ok(true);
        }
        Ok(false)
    }

    /// Retire the in-flight transfer; only legal after it went live.
    pub fn transfer_complete(&mut self, xferid: TransferId) -> Result<()> {
        let head = self.head_matches(xferid, "complete")?;
        if self.replicas.last() != Some(&head.target) {
            return Err(Error::Protocol(format!(
                "transfer \"complete\" for xferid {} must come after \"golive\"",
                xferid
            )));
        }
        self.transfers.pop_front();
        Ok(())
    }

    /// Abandon a transfer, rolling back its replica if it already went live.
    pub fn transfer_fail(&mut self, xferid: TransferId) {
        if let Some(head) = self.transfers.front() {
            if head.xferid == xferid && self.replicas.last() == Some(&head.target) {
                self.replicas.pop();
            }
        }
        self.transfers.retain(|t| t.xferid != xferid);
    }
}

/// The network identity a connection uses to address its instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceBindings {
    pub addr: String,
    pub inport: u16,
    pub inver: u16,
    pub outport: u16,
    pub outver: u16,
}

impl fmt::Display for InstanceBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Instance({}, {}, {}, {}, {})",
            self.addr, self.inport, self.inver, self.outport, self.outver
        )
    }
}

/// A configuration waiting to be acknowledged by an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfig {
    pub version: u64,
    pub blob: String,
}

/// A registered daemon process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub bindings: InstanceBindings,
    pub pid: u32,
    pub token: String,
    #[serde(skip)]
    configs: VecDeque<PendingConfig>,
    pub last_acked: u64,
    pub last_rejected: u64,
}

impl Instance {
    pub fn new(bindings: InstanceBindings, pid: u32, token: String) -> Self {
        Self {
            bindings,
            pid,
            token,
            configs: VecDeque::new(),
            last_acked: 0,
            last_rejected: 0,
        }
    }

    /// Queue a configuration. Versions older than the newest queued one are ignored.
    pub fn add_config(&mut self, version: u64, blob: &str) {
        if self.configs.back().is_some_and(|c| c.version >= version) {
            return;
        }
        self.configs.push_back(PendingConfig {
            version,
            blob: blob.to_string(),
        });
    }

    fn pop_oldest(&mut self, version: u64, verb: &str) -> Result<()> {
        match self.configs.front() {
            None => Err(Error::Protocol(format!(
                "{} config {} when none are pending",
                verb, version
            ))),
            Some(oldest) if oldest.version != version => Err(Error::Protocol(format!(
                "{} config {} but the oldest pending is {}",
                verb, version, oldest.version
            ))),
            Some(_) => {
                self.configs.pop_front();
                Ok(())
            }
        }
    }

    pub fn ack_config(&mut self, version: u64) -> Result<()> {
        self.pop_oldest(version, "acking")?;
        self.last_acked = version;
        Ok(())
    }

    pub fn reject_config(&mut self, version: u64) -> Result<()> {
        self.pop_oldest(version, "rejecting")?;
        self.last_rejected = version;
        Ok(())
    }

    pub fn next_config(&self) -> Option<&PendingConfig> {
        self.configs.front()
    }

    pub fn pending_versions(&self) -> Vec<u64> {
        self.configs.iter().map(|c| c.version).collect()
    }
}
