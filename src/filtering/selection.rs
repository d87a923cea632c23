use crate::models::{Vehicle, VehicleSet};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};

/// How fellow vehicles are picked from the full traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum FellowSelection {
    /// Every ego gets an equal share of the budget, filled with its nearest vehicles.
    #[value(name = "statically_distributed")]
    EquallyDistributed,
    /// Egos take turns picking their nearest not yet picked vehicle.
    #[value(name = "round_robin")]
    RoundRobin,
    /// No selection, the budget is ignored.
    #[value(name = "pass_all")]
    PassAll,
}

impl FellowSelection {
    /// Select up to `max_vehicles` of `vehicles` around `egos`.
    ///
    /// `vehicles` must not contain the egos themselves.
    pub fn select(
        self,
        vehicles: &VehicleSet,
        egos: &VehicleSet,
        max_vehicles: Option<usize>,
    ) -> VehicleSet {
        match self {
            FellowSelection::EquallyDistributed => {
                select_equally_distributed(vehicles, egos, max_vehicles)
            }
            FellowSelection::RoundRobin => select_round_robin(vehicles, egos, max_vehicles),
            FellowSelection::PassAll => vehicles.clone(),
        }
    }
}

impl std::fmt::Display for FellowSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            FellowSelection::EquallyDistributed => write!(f, "statically_distributed"),
            FellowSelection::RoundRobin => write!(f, "round_robin"),
            FellowSelection::PassAll => write!(f, "pass_all"),
        }
    }
}

/// Vehicles sorted by ascending distance to `ego`, ties broken by id.
fn distance_queue<'a>(vehicles: &'a VehicleSet, ego: &Vehicle) -> Vec<(f64, &'a str)> {
    let mut distances: Vec<(f64, &str)> = vehicles
        .values()
        .map(|vehicle| (vehicle.distance_to(ego), vehicle.id.as_str()))
        .collect();
    distances.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.cmp(b.1)));
    distances
}

fn subset(vehicles: &VehicleSet, ids: &BTreeSet<&str>) -> VehicleSet {
    vehicles
        .iter()
        .filter(|(id, _)| ids.contains(id.as_str()))
        .map(|(id, vehicle)| (id.clone(), vehicle.clone()))
        .collect()
}

/// Without any ego there is no distance to sort by; keep the first ids.
fn first_by_id(vehicles: &VehicleSet, max_vehicles: usize) -> VehicleSet {
    vehicles
        .iter()
        .take(max_vehicles)
        .map(|(id, vehicle)| (id.clone(), vehicle.clone()))
        .collect()
}

/// The `max_vehicles` vehicles closest to `ego`.
pub fn select_by_distance(
    vehicles: &VehicleSet,
    ego: &Vehicle,
    max_vehicles: Option<usize>,
) -> VehicleSet {
    let max_vehicles = match max_vehicles {
        Some(max) if vehicles.len() >= max => max,
        _ => return vehicles.clone(),
    };
    let nearest: BTreeSet<&str> = distance_queue(vehicles, ego)
        .into_iter()
        .take(max_vehicles)
        .map(|(_, id)| id)
        .collect();
    subset(vehicles, &nearest)
}

pub fn select_equally_distributed(
    vehicles: &VehicleSet,
    egos: &VehicleSet,
    max_vehicles: Option<usize>,
) -> VehicleSet {
    if egos.is_empty() {
        return match max_vehicles {
            Some(max) => first_by_id(vehicles, max),
            None => vehicles.clone(),
        };
    }
    let per_ego = max_vehicles.map(|max| max / egos.len());
    let mut fellows = VehicleSet::new();
    for ego in egos.values() {
        fellows.extend(select_by_distance(vehicles, ego, per_ego));
    }
    fellows
}

/// Ids in the order the round robin picks them, with the picking ego's index.
pub fn round_robin_picks(
    vehicles: &VehicleSet,
    egos: &VehicleSet,
    max_vehicles: usize,
) -> Vec<(usize, String)> {
    let mut queues: Vec<VecDeque<(f64, &str)>> = egos
        .values()
        .map(|ego| distance_queue(vehicles, ego).into())
        .collect();
    let target = max_vehicles.min(vehicles.len());
    let mut picked: BTreeSet<&str> = BTreeSet::new();
    let mut picks = Vec::with_capacity(target);
    let mut ego_index = 0;

    while picked.len() < target && queues.iter().any(|queue| !queue.is_empty()) {
        let current = ego_index;
        ego_index = (ego_index + 1) % queues.len();
        while let Some((_, candidate)) = queues[current].pop_front() {
            if picked.insert(candidate) {
                picks.push((current, candidate.to_string()));
                break;
            }
        }
    }
    picks
}

pub fn select_round_robin(
    vehicles: &VehicleSet,
    egos: &VehicleSet,
    max_vehicles: Option<usize>,
) -> VehicleSet {
    let max_vehicles = match max_vehicles {
        Some(max) if vehicles.len() >= max => max,
        _ => return vehicles.clone(),
    };
    if egos.is_empty() {
        return first_by_id(vehicles, max_vehicles);
    }
    let picks = round_robin_picks(vehicles, egos, max_vehicles);
    let ids: BTreeSet<&str> = picks.iter().map(|(_, id)| id.as_str()).collect();
    subset(vehicles, &ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::vehicle_set;

    fn line_of_vehicles(count: usize) -> VehicleSet {
        vehicle_set((0..count).map(|i| Vehicle::new(format!("v{:03}", i), i as f64 + 1.0, 0.0)))
    }

    #[test]
    fn whole_pool_when_unbounded_or_small() {
        let vehicles = line_of_vehicles(5);
        let egos = vehicle_set([Vehicle::new("ego", 0.0, 0.0)]);
        assert_eq!(select_equally_distributed(&vehicles, &egos, None), vehicles);
        assert_eq!(select_round_robin(&vehicles, &egos, Some(10)), vehicles);
    }

    #[test]
    fn nearest_vehicles_per_ego() {
        let vehicles = line_of_vehicles(10);
        let egos = vehicle_set([
            Vehicle::new("ego-a", 0.0, 0.0),
            Vehicle::new("ego-b", 11.0, 0.0),
        ]);
        let fellows = select_equally_distributed(&vehicles, &egos, Some(4));
        let ids: Vec<&str> = fellows.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["v000", "v001", "v008", "v009"]);
    }

    #[test]
    fn empty_egos_keep_first_ids() {
        let vehicles = line_of_vehicles(6);
        let fellows = select_equally_distributed(&vehicles, &VehicleSet::new(), Some(2));
        let ids: Vec<&str> = fellows.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["v000", "v001"]);
    }

    #[test]
    fn round_robin_shares_budget_fairly() {
        // Both egos sit at the same end, so they compete for the same vehicles.
        let vehicles = line_of_vehicles(20);
        let egos = vehicle_set([
            Vehicle::new("ego-a", 0.0, 0.0),
            Vehicle::new("ego-b", 0.0, 0.5),
            Vehicle::new("ego-c", 21.0, 0.0),
        ]);
        let budget = 8;
        let picks = round_robin_picks(&vehicles, &egos, budget);
        assert_eq!(picks.len(), budget);

        let fair_share = budget / egos.len();
        let mut counts = vec![0usize; egos.len()];
        for (ego_index, _) in &picks {
            // no ego may exceed its fair share while another is still below it
            if counts[*ego_index] >= fair_share {
                assert!(counts.iter().all(|count| *count >= fair_share));
            }
            counts[*ego_index] += 1;
        }
        assert!(counts.iter().all(|count| *count >= fair_share));
    }

    #[test]
    fn round_robin_picks_are_distinct() {
        let vehicles = line_of_vehicles(12);
        let egos = vehicle_set([
            Vehicle::new("ego-a", 0.0, 0.0),
            Vehicle::new("ego-b", 0.0, 0.1),
        ]);
        let fellows = select_round_robin(&vehicles, &egos, Some(6));
        let ids: Vec<&str> = fellows.keys().map(String::as_str).collect();
        assert_eq!(ids, vec!["v000", "v001", "v002", "v003", "v004", "v005"]);
    }

    #[test]
    fn names_match_command_line_values() {
        assert_eq!(
            FellowSelection::from_str("statically_distributed", false).unwrap(),
            FellowSelection::EquallyDistributed
        );
        assert_eq!(FellowSelection::RoundRobin.to_string(), "round_robin");
    }
}
