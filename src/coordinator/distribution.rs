//! Configuration distribution
//!
//! Renders the cluster state into the versioned text blob every daemon and
//! client consumes, and frames blobs for the host wire protocol.
//!
//! ```text
//! host {id} {ip} {inport} {inver} {outport} {outver}
//! version {n}
//! space {name} {id} {dim name} {dim type} ...
//! subspace {space} {subspace} {hash flags...}
//! region {space} {subspace} {prefix} {hex mask} {replica ids...}
//! transfer {xferid} {space} {subspace} {prefix} {hex mask} {target instid}
//! quiesce {state_id}
//! shutdown
//! ```

use crate::coordinator::metadata::{Instance, InstanceId, Space, SpaceId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

/// Line that terminates a configuration on the host wire protocol.
pub const END_OF_CONFIG: &str = "end of line";

/// Lifecycle instruction appended after the space blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive<'a> {
    None,
    Quiesce(&'a str),
    Shutdown,
}

/// Everything a configuration is rendered from.
pub struct ConfigView<'a> {
    pub version: u64,
    pub instances: &'a BTreeMap<InstanceId, Instance>,
    pub spaces: &'a BTreeMap<SpaceId, Space>,
    pub directive: Directive<'a>,
}

fn hash_flags(space: &Space, hashed: &[String], nosearch: &[String]) -> String {
    let mut flags = Vec::with_capacity(space.dimensions.len() * 2);
    for dim in &space.dimensions {
        flags.push(hashed.contains(&dim.name).to_string());
        flags.push((!nosearch.contains(&dim.name)).to_string());
    }
    flags.join(" ")
}

/// Render the configuration blob. Host lines cover every instance referenced
/// by a replica list or an in-flight transfer, sorted by id.
pub fn render(view: &ConfigView<'_>) -> String {
    let mut used_hosts = BTreeSet::new();
    let mut body = String::new();
    let _ = writeln!(body, "version {}", view.version);

    for (space_id, space) in view.spaces {
        let dims = space
            .dimensions
            .iter()
            .map(|d| format!("{} {}", d.name, d.datatype))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(body, "space {} {} {}", space.name, space_id, dims);

        for (subspace_id, subspace) in space.subspaces.iter().enumerate() {
            let _ = writeln!(
                body,
                "subspace {} {} {}",
                space_id,
                subspace_id,
                hash_flags(space, &subspace.dimensions, &subspace.nosearch)
            );
            for region in &subspace.regions {
                used_hosts.extend(region.replicas.iter().copied());
                let hosts = region
                    .replicas
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(" ");
                let _ = writeln!(
                    body,
                    "region {} {} {} {:#x} {}",
                    space_id, subspace_id, region.prefix, region.mask, hosts
                );
                if let Some(xfer) = region.transfer_in_progress() {
                    used_hosts.insert(xfer.target);
                    let _ = writeln!(
                        body,
                        "transfer {} {} {} {} {:#x} {}",
                        xfer.xferid,
                        space_id,
                        subspace_id,
                        region.prefix,
                        region.mask,
                        xfer.target
                    );
                }
            }
        }
    }

    match view.directive {
        Directive::None => {}
        Directive::Quiesce(state_id) => {
            let _ = writeln!(body, "quiesce {}", state_id);
        }
        Directive::Shutdown => body.push_str("shutdown\n"),
    }

    let host_lines = used_hosts
        .iter()
        .filter_map(|id| view.instances.get(id).map(|inst| (id, inst)))
        .map(|(id, inst)| {
            let b = &inst.bindings;
            format!(
                "host {} {} {} {} {} {}",
                id, b.addr, b.inport, b.inver, b.outport, b.outver
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!("{}\n{}", host_lines, body).trim().to_string()
}

/// Instances whose host line appears in a rendered configuration.
pub fn referenced_instances(spaces: &BTreeMap<SpaceId, Space>) -> BTreeSet<InstanceId> {
    let mut used = BTreeSet::new();
    for space in spaces.values() {
        for region in space.regions() {
            used.extend(region.replicas.iter().copied());
            if let Some(xfer) = region.transfer_in_progress() {
                used.insert(xfer.target);
            }
        }
    }
    used
}

/// Frame a blob for the host wire protocol.
pub fn frame(blob: &str) -> String {
    format!("{}\n{}", blob, END_OF_CONFIG).trim().to_string() + "\n"
}
