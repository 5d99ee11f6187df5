//! Coordinator state machine
//!
//! [`Coordinator`] owns every instance, space, region and transfer in the
//! cluster. Each successful mutation that changes what daemons must know
//! regenerates the configuration and queues it on every instance.
//!
//! Preconditions are checked before anything is touched, so an operation
//! that returns an error leaves the coordinator exactly as it found it.

use crate::common::{random_state_id, Error, Result};
use crate::coordinator::distribution::{self, ConfigView, Directive};
use crate::coordinator::metadata::{
    Instance, InstanceBindings, InstanceId, PendingConfig, Region, Space, SpaceId, Transfer,
    TransferId,
};
use crate::coordinator::partition::tiles_hash_space;
use crate::coordinator::placement::LoadTable;
use crate::coordinator::snapshot::{
    self, InstanceRecord, PortEpoch, SpaceRecord, StateSnapshot,
};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

/// Space ids that are never handed out.
pub const RESERVED_SPACE_IDS: [SpaceId; 5] =
    [0, u32::MAX, u32::MAX - 1, u32::MAX - 2, u32::MAX - 3];

/// Epochs per `(addr, port)` pair must stay below this.
pub const MAX_EPOCH: u32 = 1 << 16;

/// `(space, subspace index, region index)`
type RegionCoord = (SpaceId, usize, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Startup,
    Normal,
    Quiesce,
    Shutdown,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Startup => "STARTUP",
            LifecycleState::Normal => "NORMAL",
            LifecycleState::Quiesce => "QUIESCE",
            LifecycleState::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

/// Cluster-wide replication health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceLevel {
    /// Every region meets its `desired_f`.
    Desired,
    /// Some region is under-replicated but still has a replica.
    Degraded,
    /// Some region has no replica at all.
    Dataloss,
}

impl fmt::Display for ServiceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceLevel::Desired => "DESIRED",
            ServiceLevel::Degraded => "DEGRADED",
            ServiceLevel::Dataloss => "DATALOSS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub bindings: InstanceBindings,
    pub pid: u32,
    pub last_acked: u64,
    pub last_rejected: u64,
    pub pending: Vec<u64>,
    pub failed: bool,
}

/// Read-only view returned by `get-status`.
#[derive(Debug, Clone, Serialize)]
pub struct Status {
    pub state: LifecycleState,
    pub service_level: ServiceLevel,
    pub service_level_met: bool,
    pub instance_counter: InstanceId,
    pub instances: BTreeMap<InstanceId, InstanceStatus>,
    pub failed_instances: Vec<InstanceId>,
    pub space_counter: SpaceId,
    pub spaces: BTreeMap<SpaceId, Space>,
    pub config_counter: u64,
    pub config_data: String,
    pub xfer_counter: TransferId,
    pub xfers: BTreeMap<TransferId, Transfer>,
    pub quiesce_state_id: Option<String>,
    pub restored_state_id: Option<String>,
}

#[derive(Debug)]
pub struct Coordinator {
    port_epochs: HashMap<(String, u16), u32>,
    instance_counter: InstanceId,
    instances_by_token: HashMap<String, InstanceId>,
    instances_by_bindings: HashMap<InstanceBindings, InstanceId>,
    instances: BTreeMap<InstanceId, Instance>,
    failed: BTreeSet<InstanceId>,
    space_counter: SpaceId,
    spaces_by_name: BTreeMap<String, SpaceId>,
    spaces: BTreeMap<SpaceId, Space>,
    config_counter: u64,
    config_data: String,
    xfer_counter: TransferId,
    transfers: BTreeMap<TransferId, Transfer>,
    quiesce_state_id: Option<String>,
    quiesce_version: Option<u64>,
    restored_state_id: Option<String>,
    state: LifecycleState,
    rng: StdRng,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    /// Fresh cluster in NORMAL, seeded from OS entropy.
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Fresh cluster with deterministic placement and state ids.
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            port_epochs: HashMap::new(),
            instance_counter: 1,
            instances_by_token: HashMap::new(),
            instances_by_bindings: HashMap::new(),
            instances: BTreeMap::new(),
            failed: BTreeSet::new(),
            space_counter: 1,
            spaces_by_name: BTreeMap::new(),
            spaces: BTreeMap::new(),
            config_counter: 0,
            config_data: String::new(),
            xfer_counter: 0,
            transfers: BTreeMap::new(),
            quiesce_state_id: None,
            quiesce_version: None,
            restored_state_id: None,
            state: LifecycleState::Normal,
            rng,
        }
    }

    /// Rebuild a coordinator from a snapshot. It starts in STARTUP and
    /// withholds configurations until [`go_live`](Self::go_live).
    pub fn restore(text: &str, rng: StdRng) -> Result<Self> {
        let snap = snapshot::decode(text)?;
        Self::from_snapshot(snap, rng)
    }

    fn from_snapshot(snap: StateSnapshot, rng: StdRng) -> Result<Self> {
        let mut coord = Self::with_rng(rng);
        coord.state = LifecycleState::Startup;
        coord.instance_counter = snap.instance_counter;
        coord.space_counter = snap.space_counter;
        coord.config_counter = snap.config_counter;
        coord.config_data = snap.config_data;
        coord.xfer_counter = snap.xfer_counter;
        coord.restored_state_id = snap.quiesce_state_id;

        for epoch in snap.port_epochs {
            coord.port_epochs.insert((epoch.addr, epoch.port), epoch.next);
        }

        for rec in snap.instances {
            if coord.instances.contains_key(&rec.id)
                || coord.instances_by_token.contains_key(&rec.token)
            {
                return Err(Error::InvalidStateData(format!(
                    "instance {} appears twice",
                    rec.id
                )));
            }
            if rec.failed {
                coord.failed.insert(rec.id);
            }
            coord.instances_by_token.insert(rec.token.clone(), rec.id);
            coord
                .instances_by_bindings
                .insert(rec.bindings.clone(), rec.id);
            let mut inst = Instance::new(rec.bindings, rec.pid, rec.token);
            inst.last_acked = rec.last_acked;
            inst.last_rejected = rec.last_rejected;
            coord.instances.insert(rec.id, inst);
        }

        for rec in snap.spaces {
            if coord.spaces.contains_key(&rec.id)
                || coord.spaces_by_name.contains_key(&rec.space.name)
            {
                return Err(Error::InvalidStateData(format!(
                    "space {} appears twice",
                    rec.space.name
                )));
            }
            coord.spaces_by_name.insert(rec.space.name.clone(), rec.id);
            coord.spaces.insert(rec.id, rec.space);
        }

        for xfer in snap.transfers {
            coord.transfers.insert(xfer.xferid, xfer);
        }

        tracing::info!(
            "State from shutdown {} restored (config version {})",
            coord.restored_state_id.as_deref().unwrap_or("<none>"),
            coord.config_counter
        );
        Ok(coord)
    }

    fn to_snapshot(&self) -> StateSnapshot {
        let mut port_epochs: Vec<PortEpoch> = self
            .port_epochs
            .iter()
            .map(|((addr, port), next)| PortEpoch {
                addr: addr.clone(),
                port: *port,
                next: *next,
            })
            .collect();
        port_epochs.sort_by(|a, b| (&a.addr, a.port).cmp(&(&b.addr, b.port)));

        StateSnapshot {
            saved_at: Utc::now(),
            lifecycle: self.state,
            port_epochs,
            instance_counter: self.instance_counter,
            instances: self
                .instances
                .iter()
                .map(|(id, inst)| InstanceRecord {
                    id: *id,
                    bindings: inst.bindings.clone(),
                    pid: inst.pid,
                    token: inst.token.clone(),
                    last_acked: inst.last_acked,
                    last_rejected: inst.last_rejected,
                    failed: self.failed.contains(id),
                })
                .collect(),
            space_counter: self.space_counter,
            spaces: self
                .spaces
                .iter()
                .map(|(id, space)| SpaceRecord {
                    id: *id,
                    space: space.clone(),
                })
                .collect(),
            config_counter: self.config_counter,
            config_data: self.config_data.clone(),
            xfer_counter: self.xfer_counter,
            transfers: self.transfers.values().copied().collect(),
            quiesce_state_id: self.quiesce_state_id.clone(),
        }
    }

    // === Accessors ===

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Version of the newest configuration.
    pub fn config_version(&self) -> u64 {
        self.config_counter
    }

    pub fn config_data(&self) -> &str {
        &self.config_data
    }

    pub fn instance_id(&self, bindings: &InstanceBindings) -> Option<InstanceId> {
        self.instances_by_bindings.get(bindings).copied()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn is_failed(&self, id: InstanceId) -> bool {
        self.failed.contains(&id)
    }

    pub fn space_id(&self, name: &str) -> Option<SpaceId> {
        self.spaces_by_name.get(name).copied()
    }

    pub fn transfers(&self) -> &BTreeMap<TransferId, Transfer> {
        &self.transfers
    }

    // === Instances ===

    fn peek_epoch(&self, addr: &str, port: u16) -> Result<u16> {
        let next = self
            .port_epochs
            .get(&(addr.to_string(), port))
            .copied()
            .unwrap_or(1);
        u16::try_from(next).map_err(|_| Error::ExhaustedPorts {
            addr: addr.to_string(),
            port,
        })
    }

    /// Register (or re-register) a daemon. A known token keeps its instance
    /// id, pending queue and ack history; only the bindings change.
    pub fn register_instance(
        &mut self,
        addr: &str,
        inport: u16,
        outport: u16,
        pid: u32,
        token: &str,
    ) -> Result<InstanceBindings> {
        let inver = self.peek_epoch(addr, inport)?;
        let outver = if outport == inport {
            inver.checked_add(1).ok_or_else(|| Error::ExhaustedPorts {
                addr: addr.to_string(),
                port: outport,
            })?
        } else {
            self.peek_epoch(addr, outport)?
        };
        self.port_epochs
            .insert((addr.to_string(), inport), u32::from(inver) + 1);
        self.port_epochs
            .insert((addr.to_string(), outport), u32::from(outver) + 1);

        let bindings = InstanceBindings {
            addr: addr.to_string(),
            inport,
            inver,
            outport,
            outver,
        };

        let (id, reregistered) = match self.instances_by_token.get(token).copied() {
            Some(id) => {
                if let Some(inst) = self.instances.get_mut(&id) {
                    self.instances_by_bindings.remove(&inst.bindings);
                    inst.bindings = bindings.clone();
                    inst.pid = pid;
                }
                (id, true)
            }
            None => {
                let id = self.instance_counter;
                self.instance_counter += 1;
                self.instances
                    .insert(id, Instance::new(bindings.clone(), pid, token.to_string()));
                self.instances_by_token.insert(token.to_string(), id);
                (id, false)
            }
        };
        self.instances_by_bindings.insert(bindings.clone(), id);

        if self.state != LifecycleState::Startup && self.config_counter > 0 {
            if let Some(inst) = self.instances.get_mut(&id) {
                inst.add_config(self.config_counter, &self.config_data);
            }
        }

        if reregistered {
            tracing::info!("Instance {} re-registered as {}", id, bindings);
            if self.failed.contains(&id) {
                tracing::warn!("Instance {} is marked failed and stays out of placement", id);
            }
        } else {
            tracing::info!("Instance {} registered as {}", id, bindings);
        }

        let placed = self.state == LifecycleState::Normal && self.repair_placement();
        let referenced =
            reregistered && distribution::referenced_instances(&self.spaces).contains(&id);
        if placed || referenced {
            self.regenerate();
        }
        Ok(bindings)
    }

    /// Mark every instance bound to `ip` on `port` as failed and queue
    /// transfers for the regions that are now under-replicated.
    pub fn fail_host(&mut self, ip: &str, port: u16) -> BTreeSet<InstanceId> {
        let bad: BTreeSet<InstanceId> = self
            .instances
            .iter()
            .filter(|(_, inst)| {
                inst.bindings.addr == ip
                    && (inst.bindings.inport == port || inst.bindings.outport == port)
            })
            .map(|(id, _)| *id)
            .collect();
        self.failed.extend(bad.iter().copied());
        if !bad.is_empty() {
            tracing::warn!("Marking instances {:?} ({}:{}) as failed", bad, ip, port);
        }

        for coord in self.region_coords() {
            let Some(region) = self.region_at_mut(coord) else {
                continue;
            };
            let dropped = region.remove_instances(&bad);
            let need = missing_replicas(region);
            for xferid in dropped {
                tracing::debug!("Dropping transfer {} to a failed instance", xferid);
                self.transfers.remove(&xferid);
            }
            if need > 0 {
                self.queue_transfers(coord, need);
            }
        }

        self.regenerate();
        bad
    }

    /// Acknowledge the oldest pending configuration of an instance.
    pub fn ack_config(&mut self, bindings: &InstanceBindings, version: u64) -> Result<()> {
        self.instance_by_bindings_mut(bindings)?.ack_config(version)
    }

    /// Reject the oldest pending configuration of an instance.
    pub fn reject_config(&mut self, bindings: &InstanceBindings, version: u64) -> Result<()> {
        self.instance_by_bindings_mut(bindings)?.reject_config(version)
    }

    fn instance_by_bindings_mut(&mut self, bindings: &InstanceBindings) -> Result<&mut Instance> {
        self.instances_by_bindings
            .get(bindings)
            .and_then(|id| self.instances.get_mut(id))
            .ok_or_else(|| Error::Protocol(format!("unknown instance {}", bindings)))
    }

    /// Next configuration for one target. `None` is the client pseudo-target,
    /// which only ever sees the newest configuration; instances get their
    /// oldest unacknowledged one.
    pub fn fetch_config(&self, target: Option<&InstanceBindings>) -> Option<PendingConfig> {
        match target {
            None if self.config_counter == 0 => None,
            None => Some(PendingConfig {
                version: self.config_counter,
                blob: self.config_data.clone(),
            }),
            Some(bindings) => self
                .instances_by_bindings
                .get(bindings)
                .and_then(|id| self.instances.get(id))
                .and_then(|inst| inst.next_config())
                .cloned(),
        }
    }

    pub fn fetch_configs<'a>(
        &self,
        targets: impl IntoIterator<Item = Option<&'a InstanceBindings>>,
    ) -> BTreeMap<Option<InstanceBindings>, PendingConfig> {
        targets
            .into_iter()
            .filter_map(|t| self.fetch_config(t).map(|c| (t.cloned(), c)))
            .collect()
    }

    // === Spaces ===

    fn require_state(&self, wanted: LifecycleState, what: &str) -> Result<()> {
        if self.state != wanted {
            return Err(Error::invalid_state(format!(
                "{} requires {}, coordinator is {}",
                what, wanted, self.state
            )));
        }
        Ok(())
    }

    fn require_service_level(&self) -> Result<()> {
        if self.service_level() == ServiceLevel::Dataloss {
            return Err(Error::ServiceLevelNotMet);
        }
        Ok(())
    }

    /// Candidate id and the counter value after it, without committing.
    fn next_space_id(&self) -> Option<(SpaceId, SpaceId)> {
        let mut counter = self.space_counter;
        for _ in 0..=u64::from(u32::MAX) {
            let candidate = counter;
            counter = counter.wrapping_add(1);
            if !RESERVED_SPACE_IDS.contains(&candidate) && !self.spaces.contains_key(&candidate) {
                return Some((candidate, counter));
            }
        }
        None
    }

    /// Create a space and place its initial replicas.
    pub fn add_space(&mut self, mut space: Space) -> Result<SpaceId> {
        self.require_state(LifecycleState::Normal, "add-space")?;
        self.require_service_level()?;
        if self.spaces_by_name.contains_key(&space.name) {
            return Err(Error::DuplicateSpace);
        }
        if space.subspaces.is_empty() {
            return Err(Error::InvalidSpaceDescription(
                "space needs a key subspace".into(),
            ));
        }
        if let Some(i) = space
            .subspaces
            .iter()
            .position(|s| !tiles_hash_space(&s.regions))
        {
            return Err(Error::InvalidSpaceDescription(format!(
                "regions of subspace {} do not tile the hash space",
                i
            )));
        }
        let (id, next_counter) = self.next_space_id().ok_or(Error::ExhaustedSpaces)?;

        for region in space.regions_mut() {
            region.replicas.clear();
            region.transfers.clear();
        }
        self.space_counter = next_counter;
        self.spaces_by_name.insert(space.name.clone(), id);
        tracing::info!("Created space \"{}\" with id {}", space.name, id);
        self.spaces.insert(id, space);

        let coords = self.space_region_coords(id);
        self.assign_direct(&coords);
        self.regenerate();
        Ok(id)
    }

    pub fn del_space(&mut self, name: &str) -> Result<()> {
        self.require_state(LifecycleState::Normal, "del-space")?;
        self.require_service_level()?;
        let id = self.spaces_by_name.remove(name).ok_or(Error::UnknownSpace)?;
        self.spaces.remove(&id);
        self.transfers.retain(|_, xfer| xfer.space != id);
        tracing::info!("Removed space \"{}\" ({})", name, id);
        self.regenerate();
        Ok(())
    }

    /// Space names, sorted.
    pub fn lst_spaces(&self) -> Vec<String> {
        self.spaces_by_name.keys().cloned().collect()
    }

    pub fn get_space(&self, name: &str) -> Result<&Space> {
        self.spaces_by_name
            .get(name)
            .and_then(|id| self.spaces.get(id))
            .ok_or(Error::UnknownSpace)
    }

    // === Transfers ===

    /// The region a live transfer targets, if both still exist.
    fn locate_transfer(&self, xferid: TransferId) -> Option<RegionCoord> {
        let xfer = self.transfers.get(&xferid)?;
        self.spaces
            .get(&xfer.space)?
            .region(xfer.subspace, xfer.region)?;
        Some((xfer.space, xfer.subspace, xfer.region))
    }

    pub fn transfer_fail(&mut self, xferid: TransferId) -> Result<()> {
        let Some(coord) = self.locate_transfer(xferid) else {
            return Ok(());
        };
        if let Some(region) = self.region_at_mut(coord) {
            region.transfer_fail(xferid);
        }
        self.transfers.remove(&xferid);
        tracing::warn!("Transfer {} failed", xferid);
        self.regenerate();
        Ok(())
    }

    pub fn transfer_golive(&mut self, xferid: TransferId) -> Result<()> {
        let Some(coord) = self.locate_transfer(xferid) else {
            return Ok(());
        };
        let changed = match self.region_at_mut(coord) {
            Some(region) => region.transfer_golive(xferid)?,
            None => false,
        };
        tracing::debug!("Transfer {} is live", xferid);
        if changed {
            self.regenerate();
        }
        Ok(())
    }

    pub fn transfer_complete(&mut self, xferid: TransferId) -> Result<()> {
        let Some(coord) = self.locate_transfer(xferid) else {
            return Ok(());
        };
        if let Some(region) = self.region_at_mut(coord) {
            region.transfer_complete(xferid)?;
        }
        self.transfers.remove(&xferid);
        tracing::debug!("Transfer {} complete", xferid);
        self.regenerate();
        Ok(())
    }

    // === Lifecycle ===

    /// Ask every instance to persist under a fresh state id.
    pub fn quiesce(&mut self) -> Result<String> {
        self.require_state(LifecycleState::Normal, "quiesce")?;
        let state_id = random_state_id(&mut self.rng);
        self.state = LifecycleState::Quiesce;
        self.quiesce_state_id = Some(state_id.clone());
        tracing::info!("Cluster is quiescing under state id {}", state_id);
        self.regenerate();
        self.quiesce_version = Some(self.config_counter);
        Ok(state_id)
    }

    /// Tell every instance to exit and return the restart snapshot. Every
    /// live instance must have acknowledged the quiesce configuration.
    pub fn shutdown(&mut self) -> Result<String> {
        self.require_state(LifecycleState::Quiesce, "shutdown")?;
        let quiesce_version = self.quiesce_version.unwrap_or(self.config_counter);
        let waiting = self
            .instances
            .iter()
            .filter(|(id, inst)| !self.failed.contains(*id) && inst.last_acked < quiesce_version)
            .count();
        if waiting > 0 {
            return Err(Error::invalid_state(format!(
                "cannot shut down yet, waiting for {} hosts to quiesce",
                waiting
            )));
        }
        self.state = LifecycleState::Shutdown;
        tracing::info!("Requesting all nodes to shut down");
        self.regenerate();
        self.backup_state()
    }

    /// Leave STARTUP and start pushing configurations.
    pub fn go_live(&mut self) -> Result<()> {
        self.require_state(LifecycleState::Startup, "go-live")?;
        self.state = LifecycleState::Normal;
        tracing::info!("Pushing config to all hosts");
        self.regenerate();
        tracing::info!("Cluster is now fully operational");
        Ok(())
    }

    pub fn backup_state(&self) -> Result<String> {
        snapshot::encode(&self.to_snapshot())
    }

    pub fn service_level(&self) -> ServiceLevel {
        let mut level = ServiceLevel::Desired;
        for region in self.spaces.values().flat_map(|s| s.regions()) {
            if region.current_f() < 0 {
                return ServiceLevel::Dataloss;
            }
            if region.is_under_replicated() {
                level = ServiceLevel::Degraded;
            }
        }
        level
    }

    pub fn get_status(&self) -> Status {
        let service_level = self.service_level();
        Status {
            state: self.state,
            service_level,
            service_level_met: service_level != ServiceLevel::Dataloss,
            instance_counter: self.instance_counter,
            instances: self
                .instances
                .iter()
                .map(|(id, inst)| {
                    let status = InstanceStatus {
                        bindings: inst.bindings.clone(),
                        pid: inst.pid,
                        last_acked: inst.last_acked,
                        last_rejected: inst.last_rejected,
                        pending: inst.pending_versions(),
                        failed: self.failed.contains(id),
                    };
                    (*id, status)
                })
                .collect(),
            failed_instances: self.failed.iter().copied().collect(),
            space_counter: self.space_counter,
            spaces: self.spaces.clone(),
            config_counter: self.config_counter,
            config_data: self.config_data.clone(),
            xfer_counter: self.xfer_counter,
            xfers: self.transfers.clone(),
            quiesce_state_id: self.quiesce_state_id.clone(),
            restored_state_id: self.restored_state_id.clone(),
        }
    }

    // === Placement ===

    fn region_coords(&self) -> Vec<RegionCoord> {
        self.spaces
            .keys()
            .flat_map(|id| self.space_region_coords(*id))
            .collect()
    }

    fn space_region_coords(&self, id: SpaceId) -> Vec<RegionCoord> {
        self.spaces
            .get(&id)
            .map(|space| {
                space
                    .region_coords()
                    .into_iter()
                    .map(|(ssi, ri)| (id, ssi, ri))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn region_at(&self, (space, subspace, region): RegionCoord) -> Option<&Region> {
        self.spaces.get(&space)?.region(subspace, region)
    }

    fn region_at_mut(&mut self, (space, subspace, region): RegionCoord) -> Option<&mut Region> {
        self.spaces.get_mut(&space)?.region_mut(subspace, region)
    }

    fn select_replica(&mut self, exclude: &[InstanceId]) -> Option<InstanceId> {
        let table = LoadTable::from_cluster(self.instances.keys().copied(), &self.spaces);
        table.select(exclude, &self.failed, &mut self.rng)
    }

    /// Allocate a transfer id, wrapping and skipping ids still in use.
    fn next_transfer_id(&mut self) -> Option<TransferId> {
        for _ in 0..=u32::from(u16::MAX) {
            let candidate = self.xfer_counter;
            self.xfer_counter = self.xfer_counter.wrapping_add(1);
            if !self.transfers.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    /// Add replicas directly, one region at a time round-robin so load
    /// spreads evenly, until every region is satisfied or nobody is left.
    fn assign_direct(&mut self, coords: &[RegionCoord]) -> bool {
        let mut changed = false;
        let mut progress = true;
        while progress {
            progress = false;
            for coord in coords {
                let exclude = match self.region_at(*coord) {
                    Some(region) if region.is_under_replicated() => region.replicas.clone(),
                    _ => continue,
                };
                let Some(replica) = self.select_replica(&exclude) else {
                    continue;
                };
                if let Some(region) = self.region_at_mut(*coord) {
                    region.add_replica(replica);
                    progress = true;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Queue up to `count` transfers into a region. Returns how many were queued.
    fn queue_transfers(&mut self, coord: RegionCoord, count: usize) -> usize {
        let mut queued = 0;
        for _ in 0..count {
            let Some(exclude) = self.region_at(coord).map(Region::assigned) else {
                break;
            };
            let Some(target) = self.select_replica(&exclude) else {
                break;
            };
            let Some(xferid) = self.next_transfer_id() else {
                tracing::warn!("No free transfer ids; region {:?} stays degraded", coord);
                break;
            };
            let Some(region) = self.region_at_mut(coord) else {
                break;
            };
            region.transfer_initiate(xferid, target);
            let (space, subspace, region) = coord;
            self.transfers.insert(
                xferid,
                Transfer {
                    xferid,
                    space,
                    subspace,
                    region,
                    target,
                },
            );
            tracing::info!("Transfer {} moves region {:?} onto instance {}", xferid, coord, target);
            queued += 1;
        }
        queued
    }

    /// Give empty regions replicas directly and queue transfers for regions
    /// that are under-replicated but still hold data.
    fn repair_placement(&mut self) -> bool {
        let coords = self.region_coords();
        let mut empty = Vec::new();
        let mut changed = false;
        for coord in coords {
            let Some(region) = self.region_at(coord) else {
                continue;
            };
            if region.replicas.is_empty() && region.transfers.is_empty() {
                empty.push(coord);
                continue;
            }
            let need = missing_replicas(region);
            if need > 0 && self.queue_transfers(coord, need) > 0 {
                changed = true;
            }
        }
        self.assign_direct(&empty) || changed
    }

    // === Distribution ===

    /// Bump the version, render the configuration and queue it on every
    /// instance unless the cluster is still in STARTUP.
    fn regenerate(&mut self) {
        self.config_counter += 1;
        let directive = match self.state {
            LifecycleState::Quiesce => {
                Directive::Quiesce(self.quiesce_state_id.as_deref().unwrap_or_default())
            }
            LifecycleState::Shutdown => Directive::Shutdown,
            LifecycleState::Startup | LifecycleState::Normal => Directive::None,
        };
        self.config_data = distribution::render(&ConfigView {
            version: self.config_counter,
            instances: &self.instances,
            spaces: &self.spaces,
            directive,
        });
        tracing::debug!("Generated configuration version {}", self.config_counter);

        if self.state != LifecycleState::Startup {
            for inst in self.instances.values_mut() {
                inst.add_config(self.config_counter, &self.config_data);
            }
        }
    }
}

/// Replicas still to be found for a region after counting queued transfers.
/// A transfer that already went live is counted once, as a replica.
fn missing_replicas(region: &Region) -> usize {
    let incoming = region
        .transfers
        .iter()
        .filter(|t| !region.replicas.contains(&t.target))
        .count() as i64;
    let need = i64::from(region.desired_f) - region.current_f() - incoming;
    need.max(0) as usize
}
