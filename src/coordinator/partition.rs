//! Partition planner
//!
//! Turns static region declarations plus an optional "auto" fill into a
//! region list that tiles the 64-bit hash domain exactly. Gaps are filled
//! CIDR-style: each filler block is the largest power-of-two block that is
//! aligned at the current lower bound, no larger than the auto granularity,
//! and does not cross the next boundary.

use crate::common::{Error, Result};
use crate::coordinator::metadata::{Region, HASH_SPACE};

/// Upper bound on regions one subspace may be planned into.
pub const MAX_REGIONS: usize = 1 << 16;

/// `region PREFIX MASK F`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticRegion {
    pub prefix: u8,
    pub mask: u64,
    pub desired_f: u32,
}

/// `auto PREFIX F`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoRegion {
    pub prefix: u8,
    pub desired_f: u32,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidSpaceDescription(msg.into())
}

/// Largest block (as a prefix) usable at `lower` without exceeding `max_span`
/// or crossing `target`.
fn filler_prefix(lower: u128, target: u128, max_span: u128) -> u8 {
    let align = if lower == 0 {
        HASH_SPACE
    } else {
        1u128 << lower.trailing_zeros()
    };
    let mut span = align.min(max_span);
    while lower + span > target {
        span >>= 1;
    }
    (64 - span.trailing_zeros()) as u8
}

/// Regions covering `[lower, target)` at `auto` granularity.
fn fill_to(lower: u128, target: u128, auto: AutoRegion, out: &mut Vec<Region>) -> Result<()> {
    let max_span = 1u128 << (64 - u32::from(auto.prefix));
    let mut lower = lower;
    while lower < target {
        if out.len() >= MAX_REGIONS {
            return Err(invalid(format!(
                "subspace would need more than {} regions",
                MAX_REGIONS
            )));
        }
        let prefix = filler_prefix(lower, target, max_span);
        let region = Region::new(prefix, lower as u64, auto.desired_f);
        lower = region.upper_bound();
        out.push(region);
    }
    Ok(())
}

fn validate_static(region: &StaticRegion) -> Result<()> {
    if region.prefix > 64 {
        return Err(invalid("regions must use 0 <= prefix <= 64"));
    }
    let low_bits = if region.prefix == 0 {
        u64::MAX
    } else {
        (1u128 << (64 - u32::from(region.prefix))) as u64 - 1
    };
    if region.prefix < 64 && region.mask & low_bits != 0 {
        return Err(invalid(format!(
            "region mask {:#x} has bits set below its /{} prefix",
            region.mask, region.prefix
        )));
    }
    Ok(())
}

/// Plan a subspace's regions.
pub fn plan_regions(statics: &[StaticRegion], auto: Option<AutoRegion>) -> Result<Vec<Region>> {
    if let Some(auto) = auto {
        if auto.prefix > 64 {
            return Err(invalid("regions must use 0 <= prefix <= 64"));
        }
    }
    for region in statics {
        validate_static(region)?;
    }

    let mut sorted = statics.to_vec();
    sorted.sort_by_key(|r| (r.mask, r.prefix));

    let mut regions = Vec::new();
    let mut upper_bound: u128 = 0;
    for declared in sorted {
        let mask = u128::from(declared.mask);
        if mask < upper_bound {
            return Err(invalid(format!(
                "static region {:#x}/{} overlaps the region before it",
                declared.mask, declared.prefix
            )));
        }
        if mask > upper_bound {
            match auto {
                Some(auto) => fill_to(upper_bound, mask, auto, &mut regions)?,
                None => {
                    return Err(invalid(
                        "static regions without an \"auto\" statement must be contiguous",
                    ))
                }
            }
        }
        let region = Region::new(declared.prefix, declared.mask, declared.desired_f);
        upper_bound = region.upper_bound();
        regions.push(region);
    }

    if upper_bound < HASH_SPACE {
        match auto {
            Some(auto) => fill_to(upper_bound, HASH_SPACE, auto, &mut regions)?,
            None => {
                return Err(invalid(
                    "regions must cover the whole hash space (add an \"auto\" statement)",
                ))
            }
        }
    }

    debug_assert!(tiles_hash_space(&regions));
    Ok(regions)
}

/// Sorted, pairwise non-overlapping, and covering exactly `[0, 2^64)`.
pub fn tiles_hash_space(regions: &[Region]) -> bool {
    let mut expected: u128 = 0;
    for region in regions {
        if region.prefix > 64 || u128::from(region.mask) != expected {
            return false;
        }
        expected = region.upper_bound();
    }
    expected == HASH_SPACE
}
