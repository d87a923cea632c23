use crate::filtering::selection::FellowSelection;
use crate::models::{Vehicle, VehicleSet};
use std::collections::BTreeSet;

/// How a tracked vehicle set evolved between two ticks.
///
/// Every list is sorted by id and an id appears in at most one of them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FellowChangeSet {
    pub added: Vec<Vehicle>,
    pub removed: Vec<Vehicle>,
    pub modified: Vec<Vehicle>,
}

impl FellowChangeSet {
    /// Partition by id set difference between `newer` and `older`.
    pub fn split(newer: &VehicleSet, older: &VehicleSet) -> Self {
        let mut changes = FellowChangeSet::default();
        for (id, vehicle) in newer {
            if older.contains_key(id) {
                changes.modified.push(vehicle.clone());
            } else {
                changes.added.push(vehicle.clone());
            }
        }
        for (id, vehicle) in older {
            if !newer.contains_key(id) {
                changes.removed.push(vehicle.clone());
            }
        }
        changes
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stateful fellow filter, remembers what was reported last.
#[derive(Debug, Clone)]
pub struct TrafficFilter {
    selection: FellowSelection,
    prune_egos: bool,
    max_vehicles: Option<usize>,
    last_fellows: VehicleSet,
}

impl TrafficFilter {
    /// With `prune_egos` the egos are never reported; otherwise they are
    /// always reported on top of the selected fellows.
    pub fn new(selection: FellowSelection, prune_egos: bool, max_vehicles: Option<usize>) -> Self {
        TrafficFilter {
            selection,
            prune_egos,
            max_vehicles,
            last_fellows: VehicleSet::new(),
        }
    }

    pub fn with_initial_traffic(mut self, traffic: VehicleSet) -> Self {
        self.last_fellows = traffic;
        self
    }

    pub fn selection(&self) -> FellowSelection {
        self.selection
    }

    pub fn max_vehicles(&self) -> Option<usize> {
        self.max_vehicles
    }

    pub fn set_max_vehicles(&mut self, max_vehicles: Option<usize>) {
        self.max_vehicles = max_vehicles;
    }

    pub fn last_fellows(&self) -> &VehicleSet {
        &self.last_fellows
    }

    /// Select fellows from `traffic` and diff them against the previous call.
    pub fn derive_changes(&mut self, traffic: &VehicleSet, egos: &VehicleSet) -> FellowChangeSet {
        let mut fellows = self.selection.select(traffic, egos, self.max_vehicles);
        if self.prune_egos {
            debug_assert!(
                egos.keys().all(|id| !traffic.contains_key(id)),
                "ego vehicles must not be part of the traffic to filter"
            );
        } else {
            fellows.extend(egos.iter().map(|(id, ego)| (id.clone(), ego.clone())));
        }

        let changes = FellowChangeSet::split(&fellows, &self.last_fellows);
        debug_assert!(self.is_consistent(&changes, egos));
        self.last_fellows = fellows;
        changes
    }

    /// Changes must fit the previous fellow set and the budget.
    ///
    /// Egos added on top of the selection are not charged to the budget.
    pub fn is_consistent(&self, changes: &FellowChangeSet, egos: &VehicleSet) -> bool {
        if let Some(max_vehicles) = self.max_vehicles {
            let is_fellow = |vehicle: &&Vehicle| !egos.contains_key(&vehicle.id);
            let reported = changes.added.iter().filter(is_fellow).count()
                + changes.modified.iter().filter(is_fellow).count();
            if reported > max_vehicles && self.selection != FellowSelection::PassAll {
                return false;
            }
        }
        let last_ids: BTreeSet<&String> = self.last_fellows.keys().collect();
        changes.added.iter().all(|v| !last_ids.contains(&v.id))
            && changes.removed.iter().all(|v| last_ids.contains(&v.id))
            && changes.modified.iter().all(|v| last_ids.contains(&v.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vehicle_set;
    use proptest::prelude::*;

    fn traffic(ids: &[u16]) -> VehicleSet {
        vehicle_set(ids.iter().map(|i| Vehicle::new(format!("v{}", i), *i as f64, 1.0)))
    }

    fn ids(vehicles: &[Vehicle]) -> Vec<&str> {
        vehicles.iter().map(|v| v.id.as_str()).collect()
    }

    #[test]
    fn changes_against_previous_fellows() {
        let egos = vehicle_set([Vehicle::new("ego", 0.0, 0.0)]);
        let mut filter = TrafficFilter::new(FellowSelection::EquallyDistributed, true, None);

        let first = filter.derive_changes(&traffic(&[1, 2]), &egos);
        assert_eq!(ids(&first.added), vec!["v1", "v2"]);
        assert!(first.removed.is_empty() && first.modified.is_empty());

        let second = filter.derive_changes(&traffic(&[2, 3]), &egos);
        assert_eq!(ids(&second.added), vec!["v3"]);
        assert_eq!(ids(&second.removed), vec!["v1"]);
        assert_eq!(ids(&second.modified), vec!["v2"]);
    }

    #[test]
    fn reselecting_same_traffic_only_modifies() {
        let egos = vehicle_set([Vehicle::new("ego", 0.0, 0.0)]);
        let vehicles = traffic(&[1, 2, 3, 4, 5, 6]);
        let mut filter = TrafficFilter::new(FellowSelection::RoundRobin, true, Some(3));

        let first = filter.derive_changes(&vehicles, &egos);
        let second = filter.derive_changes(&vehicles, &egos);
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(ids(&second.modified), ids(&first.added));
    }

    #[test]
    fn egos_are_reported_when_not_pruned() {
        let egos = vehicle_set([Vehicle::new("ego", 0.0, 0.0)]);
        let mut filter = TrafficFilter::new(FellowSelection::EquallyDistributed, false, Some(1));
        let changes = filter.derive_changes(&traffic(&[1, 2, 3]), &egos);
        assert_eq!(ids(&changes.added), vec!["ego", "v1"]);
        assert!(filter.is_consistent(&FellowChangeSet::default(), &egos));
    }

    #[test]
    fn initial_traffic_counts_as_reported() {
        let egos = vehicle_set([Vehicle::new("ego", 0.0, 0.0)]);
        let mut filter = TrafficFilter::new(FellowSelection::PassAll, true, None)
            .with_initial_traffic(traffic(&[1]));
        let changes = filter.derive_changes(&traffic(&[1, 2]), &egos);
        assert_eq!(ids(&changes.added), vec!["v2"]);
        assert_eq!(ids(&changes.modified), vec!["v1"]);
    }

    fn selection_strategy() -> impl Strategy<Value = FellowSelection> {
        prop_oneof![
            Just(FellowSelection::EquallyDistributed),
            Just(FellowSelection::RoundRobin),
        ]
    }

    proptest! {
        #[test]
        fn change_sets_partition_ids(
            selection in selection_strategy(),
            max_vehicles in proptest::option::of(1usize..12),
            egos_xy in proptest::collection::vec((-50.0f64..50.0, -50.0f64..50.0), 1..4),
            ticks in proptest::collection::vec(
                proptest::collection::btree_set(0u16..40, 0..30), 1..5
            ),
        ) {
            let egos = vehicle_set(
                egos_xy.iter().enumerate().map(|(i, (x, y))| Vehicle::new(format!("ego-{}", i), *x, *y)),
            );
            let mut filter = TrafficFilter::new(selection, true, max_vehicles);
            for tick in ticks {
                let ids: Vec<u16> = tick.into_iter().collect();
                let changes = filter.derive_changes(&traffic(&ids), &egos);

                let added: BTreeSet<&str> = changes.added.iter().map(|v| v.id.as_str()).collect();
                let removed: BTreeSet<&str> = changes.removed.iter().map(|v| v.id.as_str()).collect();
                let modified: BTreeSet<&str> = changes.modified.iter().map(|v| v.id.as_str()).collect();
                prop_assert!(added.is_disjoint(&removed));
                prop_assert!(added.is_disjoint(&modified));
                prop_assert!(removed.is_disjoint(&modified));
                if let Some(max) = max_vehicles {
                    prop_assert!(added.len() + modified.len() <= max);
                }
            }
        }
    }
}
