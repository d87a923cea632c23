//! Fires spatial triggers when ego vehicles come close to them.

use crate::global_variables::TRIGGER_QUERY_SIZE;
use crate::models::Vehicle;
use crate::simulation_engine::control::{ControlConnection, Domain, TraciError};
use crate::simulation_engine::triggers::{EventContext, Trigger, TriggerCollection};
use rstar::primitives::GeomWithData;
use rstar::RTree;

type TriggerPoint = GeomWithData<[f64; 2], usize>;

pub struct SpawnManager {
    collection: TriggerCollection,
    index: RTree<TriggerPoint>,
    fired: Vec<bool>,
    firings: u64,
}

/// Point `offset` metres along a polyline, clamped to its ends.
pub fn point_along(shape: &[(f64, f64)], offset: f64) -> Option<(f64, f64)> {
    let mut remaining = offset.max(0.0);
    let mut last = *shape.first()?;
    for &next in &shape[1..] {
        let length = ((next.0 - last.0).powi(2) + (next.1 - last.1).powi(2)).sqrt();
        if remaining <= length && length > 0.0 {
            let t = remaining / length;
            return Some((last.0 + t * (next.0 - last.0), last.1 + t * (next.1 - last.1)));
        }
        remaining -= length;
        last = next;
    }
    Some(last)
}

fn resolve_position<C: ControlConnection + ?Sized>(
    trigger: &Trigger,
    connection: &mut C,
) -> Result<Option<(f64, f64)>, TraciError> {
    if let Some(xy) = trigger.ego_xy {
        return Ok(Some(xy));
    }
    let (Some(edge), Some(pos)) = (&trigger.ego_edge, trigger.ego_edge_pos) else {
        return Ok(None);
    };
    match connection.shape(Domain::Lane, &format!("{}_0", edge)) {
        Ok(shape) => Ok(point_along(&shape, pos)),
        Err(err) if err.is_rejection() => {
            log::warn!("Edge '{}' of trigger '{}' is unknown: {}", edge, trigger.label(), err);
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

impl SpawnManager {
    /// Resolve every trigger's position and index it.
    ///
    /// Triggers without a resolvable position are logged and never fire.
    pub fn new<C: ControlConnection + ?Sized>(
        collection: TriggerCollection,
        connection: &mut C,
    ) -> Result<Self, TraciError> {
        let mut points = Vec::with_capacity(collection.triggers.len());
        for (i, trigger) in collection.triggers.iter().enumerate() {
            match resolve_position(trigger, connection)? {
                Some((x, y)) => points.push(TriggerPoint::new([x, y], i)),
                None => log::error!(
                    "Could not determine position of trigger {} ('{}'), ignoring it",
                    i,
                    trigger.label()
                ),
            }
        }
        log::debug!("Indexed {} of {} triggers", points.len(), collection.triggers.len());
        let fired = vec![false; collection.triggers.len()];
        Ok(SpawnManager {
            collection,
            index: RTree::bulk_load(points),
            fired,
            firings: 0,
        })
    }

    pub fn is_fired(&self, trigger: usize) -> bool {
        self.fired.get(trigger).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }

    pub fn is_empty(&self) -> bool {
        self.index.size() == 0
    }

    /// Fire every trigger not yet fired within its radius of an ego vehicle.
    ///
    /// Returns the indices of the triggers fired during this step.
    pub fn step<'a, C, I>(&mut self, connection: &mut C, egos: I, now_s: f64) -> Result<Vec<usize>, TraciError>
    where
        C: ControlConnection + ?Sized,
        I: IntoIterator<Item = &'a Vehicle>,
    {
        let max_radius = self.collection.config.triggers_max_radius;
        let mut fired_now = Vec::new();
        for ego in egos {
            let origin = [ego.position.x, ego.position.y];
            let candidates: Vec<(usize, f64)> = self
                .index
                .nearest_neighbor_iter_with_distance_2(&origin)
                .take(TRIGGER_QUERY_SIZE)
                .map(|(point, distance_2)| (point.data, distance_2.sqrt()))
                .take_while(|(_, distance)| *distance <= max_radius)
                .collect();

            for (i, distance) in candidates {
                let trigger = &self.collection.triggers[i];
                if distance > trigger.radius(max_radius) || self.fired[i] {
                    continue;
                }
                self.fired[i] = true;
                self.firings += 1;
                log::info!(
                    "Trigger '{}' fired by {} at distance {:.2}",
                    trigger.label(),
                    ego.id,
                    distance
                );
                let context = EventContext {
                    now_s,
                    default_vehicle_type: &self.collection.config.default_vehicle_type,
                    dyn_id: format!("{}_{}", (now_s * 1000.0).round() as i64, self.firings),
                };
                trigger.apply(connection, &context)?;
                fired_now.push(i);
            }
        }
        Ok(fired_now)
    }
}
