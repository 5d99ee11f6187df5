//! Replica placement
//!
//! New replicas go to the least-loaded live instance, where load is the
//! number of region replica slots an instance currently fills across every
//! space. Ties are broken uniformly at random. Nothing is remembered between
//! calls: load is recomputed from the cluster snapshot each time.

use crate::coordinator::metadata::{InstanceId, Space, SpaceId};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};

/// Replica slots held per known instance.
#[derive(Debug, Clone, Default)]
pub struct LoadTable {
    load: BTreeMap<InstanceId, usize>,
}

impl LoadTable {
    pub fn from_cluster<'a>(
        instances: impl IntoIterator<Item = InstanceId>,
        spaces: impl IntoIterator<Item = (&'a SpaceId, &'a Space)>,
    ) -> Self {
        let mut load: BTreeMap<InstanceId, usize> =
            instances.into_iter().map(|id| (id, 0)).collect();
        for (_, space) in spaces {
            for region in space.regions() {
                for replica in &region.replicas {
                    if let Some(count) = load.get_mut(replica) {
                        *count += 1;
                    }
                }
            }
        }
        Self { load }
    }

    pub fn load_of(&self, instance: InstanceId) -> Option<usize> {
        self.load.get(&instance).copied()
    }

    /// Least-loaded instances that are neither excluded nor failed.
    pub fn least_loaded(
        &self,
        exclude: &[InstanceId],
        failed: &BTreeSet<InstanceId>,
    ) -> Vec<InstanceId> {
        let eligible = self
            .load
            .iter()
            .filter(|(id, _)| !exclude.contains(*id) && !failed.contains(*id));
        let Some(min) = eligible.clone().map(|(_, load)| *load).min() else {
            return Vec::new();
        };
        eligible
            .filter(|(_, load)| **load == min)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Pick the instance that should host a new replica, if any is eligible.
    pub fn select<R: Rng + ?Sized>(
        &self,
        exclude: &[InstanceId],
        failed: &BTreeSet<InstanceId>,
        rng: &mut R,
    ) -> Option<InstanceId> {
        self.least_loaded(exclude, failed).choose(rng).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::{Dimension, Region, Subspace};
    use rand::{rngs::StdRng, SeedableRng};

    fn space_with_replicas(replicas: &[&[InstanceId]]) -> Space {
        let regions = replicas
            .iter()
            .enumerate()
            .map(|(i, ids)| {
                let mut r = Region::new(8, (i as u64) << 56, 1);
                r.replicas = ids.to_vec();
                r
            })
            .collect();
        Space {
            name: "kv".into(),
            dimensions: vec![Dimension::new("k", "string")],
            subspaces: vec![Subspace {
                dimensions: vec!["k".into()],
                nosearch: vec![],
                regions,
            }],
        }
    }

    #[test]
    fn test_load_counts_every_replica_slot() {
        let mut spaces = BTreeMap::new();
        spaces.insert(1, space_with_replicas(&[&[1, 2], &[1], &[3]]));
        spaces.insert(2, space_with_replicas(&[&[1, 3]]));
        let table = LoadTable::from_cluster([1, 2, 3, 4], &spaces);
        assert_eq!(table.load_of(1), Some(3));
        assert_eq!(table.load_of(2), Some(1));
        assert_eq!(table.load_of(3), Some(2));
        assert_eq!(table.load_of(4), Some(0));
    }

    #[test]
    fn test_select_prefers_least_loaded() {
        let mut spaces = BTreeMap::new();
        spaces.insert(1, space_with_replicas(&[&[1, 2], &[1, 3]]));
        let table = LoadTable::from_cluster([1, 2, 3], &spaces);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let choice = table.select(&[], &BTreeSet::new(), &mut rng).unwrap();
            assert!(choice == 2 || choice == 3);
        }
    }

    #[test]
    fn test_select_skips_excluded_and_failed() {
        let spaces: BTreeMap<SpaceId, Space> = BTreeMap::new();
        let table = LoadTable::from_cluster([1, 2, 3], &spaces);
        let failed: BTreeSet<InstanceId> = [2].into_iter().collect();
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(table.select(&[1], &failed, &mut rng), Some(3));
        assert_eq!(table.select(&[1, 3], &failed, &mut rng), None);
    }

    #[test]
    fn test_select_on_empty_cluster() {
        let spaces: BTreeMap<SpaceId, Space> = BTreeMap::new();
        let table = LoadTable::from_cluster(Vec::new(), &spaces);
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(table.select(&[], &BTreeSet::new(), &mut rng), None);
    }
}
