//! reroute.rs
//!
//! Decide cuando y como re-enrutar ante incidencias.
//!
//! - Arranque: si hay tramos afectados, pesos + duarouter completo y se
//!   sustituye el `RouteSet` entero. Si el router falla se mantienen las rutas.
//! - En vivo: se compara el conjunto de ids con el anterior; sin cambios no se
//!   hace nada. Con cambios se recorrelaciona y se pide reroute por tiempo de
//!   viaje solo a los vehiculos activos cuya ruta toca un tramo afectado.
//!
//! Tras cualquier cambio de rutas el indice de tramos se invalida y reconstruye.

use std::collections::BTreeSet;
use tracing::{info, warn};

use crate::correlate::correlate;
use crate::geoindex::{GeoCache, GeoIndex};
use crate::sumo::{Router, SimControl};
use crate::types::{AffectedEdgeMap, Incident, PrevIncidentSet, RouteSet};
use crate::utm::CoordinateTransformer;
use crate::weights::PenaltyWriter;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IncidentDelta {
    pub new: usize,
    pub resolved: usize,
}

impl IncidentDelta {
    pub fn is_empty(&self) -> bool { self.new == 0 && self.resolved == 0 }
}

/// |B \ A| nuevas y |A \ B| resueltas.
pub fn incident_delta(prev: &PrevIncidentSet, current: &PrevIncidentSet) -> IncidentDelta {
    IncidentDelta {
        new: current.difference(prev).count(),
        resolved: prev.difference(current).count(),
    }
}

pub fn id_set(incidents: &[Incident]) -> PrevIncidentSet {
    incidents.iter().map(|i| i.id.clone()).collect()
}

#[derive(Clone, Debug, PartialEq)]
pub enum LiveOutcome {
    Unchanged,
    Applied { delta: IncidentDelta, affected_edges: usize, rerouted: usize },
}

pub struct RerouteOrchestrator<R: Router> {
    router: R,
    writer: PenaltyWriter,
    prev: PrevIncidentSet,
    seen: BTreeSet<String>,
    rerouted: usize,
}

impl<R: Router> RerouteOrchestrator<R> {
    pub fn new(router: R, writer: PenaltyWriter) -> Self {
        Self { router, writer, prev: PrevIncidentSet::new(), seen: BTreeSet::new(), rerouted: 0 }
    }

    #[cfg(test)]
    pub fn prev(&self) -> &PrevIncidentSet { &self.prev }
    /// Incidencias distintas vistas en toda la corrida
    pub fn incidents_processed(&self) -> usize { self.seen.len() }
    pub fn vehicles_rerouted(&self) -> usize { self.rerouted }

    fn remember(&mut self, current: PrevIncidentSet) {
        self.seen.extend(current.iter().cloned());
        self.prev = current;
    }

    /// Re-enrutado completo previo a la simulacion. Devuelve `true` si el
    /// `RouteSet` se sustituyo.
    pub fn startup(
        &mut self,
        incidents: &[Incident],
        geo: &GeoIndex,
        tf: &CoordinateTransformer,
        routes: &mut RouteSet,
    ) -> bool {
        self.remember(id_set(incidents));
        if incidents.is_empty() {
            info!("sin incidencias al arrancar");
            return false;
        }
        let affected = correlate(incidents, geo, tf);
        if affected.is_empty() {
            info!("ningun tramo de ruta afectado por incidencias");
            return false;
        }
        self.full_reroute(&affected, routes)
    }

    fn full_reroute(&mut self, affected: &AffectedEdgeMap, routes: &mut RouteSet) -> bool {
        let weights = match self.writer.write(affected) {
            Ok(p) => p.to_path_buf(),
            Err(e) => {
                warn!("no se pudieron escribir los pesos: {e:#}; se mantienen las rutas");
                return false;
            }
        };
        match self.router.route(Some(&weights)) {
            Ok(new) if !new.is_empty() => {
                info!("re-enrutado completo: {} rutas (antes {})", new.len(), routes.len());
                *routes = new;
                true
            }
            Ok(_) => {
                warn!("el router no devolvio rutas; se mantienen las anteriores");
                false
            }
            Err(e) => {
                warn!("re-enrutado fallido: {e}; se mantienen las rutas");
                false
            }
        }
    }

    /// Paso incremental durante la simulacion.
    pub fn live<S: SimControl>(
        &mut self,
        sim: &mut S,
        incidents: &[Incident],
        cache: &mut GeoCache,
        routes: &mut RouteSet,
        tf: &CoordinateTransformer,
    ) -> LiveOutcome {
        let current = id_set(incidents);
        let delta = incident_delta(&self.prev, &current);
        if delta.is_empty() {
            return LiveOutcome::Unchanged;
        }
        info!("incidencias: {} nuevas, {} resueltas", delta.new, delta.resolved);

        let affected = correlate(incidents, cache.ensure(sim, routes), tf);
        let rerouted = if affected.is_empty() { 0 } else { self.reroute_active(sim, &affected, routes) };

        if rerouted > 0 {
            cache.invalidate();
            cache.rebuild(sim, routes);
        }
        self.remember(current);
        LiveOutcome::Applied { delta, affected_edges: affected.len(), rerouted }
    }

    fn reroute_active<S: SimControl>(&mut self, sim: &mut S, affected: &AffectedEdgeMap, routes: &mut RouteSet) -> usize {
        let active = match sim.vehicle_ids() {
            Ok(v) => v,
            Err(e) => {
                warn!("no se pudo listar vehiculos activos: {e}");
                return 0;
            }
        };

        let mut n = 0;
        for veh in active {
            let touches = match sim.vehicle_route(&veh) {
                Ok(r) => r.iter().any(|e| affected.contains_key(e)),
                Err(e) => {
                    warn!("ruta de {veh}: {e}");
                    continue;
                }
            };
            if !touches { continue; }
            if let Err(e) = sim.reroute_by_travel_time(&veh) {
                warn!("reroute de {veh}: {e}");
                continue;
            }
            n += 1;
            match sim.vehicle_route(&veh) {
                Ok(r) => { routes.insert(veh, r); }
                Err(e) => warn!("ruta nueva de {veh}: {e}"),
            }
        }
        if n > 0 {
            info!("{n} vehiculos re-enrutados por tiempo de viaje");
        }
        self.rerouted += n;
        n
    }
}
