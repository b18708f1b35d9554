//! sim_loop.rs
//!
//! Bucle principal sobre el tiempo simulado (1 paso = 1 s).
//!
//! Orden fijo dentro de cada tick:
//! 1. `step()` del simulador y lectura del reloj
//! 2. telemetria de los vehiculos seguidos (km/h, 0 si no estan en la red)
//! 3. clima: muestra vigente para `ancla + t`; si cambia el codigo se aplica
//!    la friccion nueva a todos los edges del `RouteSet` antes del siguiente paso
//! 4. incidencias cada `incident_check_s`: sondeo y paso incremental del orquestador;
//!    los edges que entran en el `RouteSet` por un reroute reciben la friccion vigente
//! 5. bandera de cancelacion
//!
//! Termina cuando el simulador no tiene vehiculos pendientes.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

use crate::data::incid::IncidentFeed;
use crate::data::weather::{reading_for, resolve};
use crate::fetch::FeedSource;
use crate::geoindex::GeoCache;
use crate::reroute::{LiveOutcome, RerouteOrchestrator};
use crate::sumo::{Router, SimControl};
use crate::types::{
    Category, RouteSet, RunReport, Telemetry, VehicleSummary, WeatherEvent, WeatherReading, WeatherSample,
};
use crate::utm::CoordinateTransformer;

const MS_TO_KMH: f64 = 3.6;

#[derive(Clone, Debug)]
pub struct LoopCfg {
    pub incident_check_s: u32,
    pub weather_log_s: u32,
    pub tracked: Vec<String>,
    pub areas: Vec<String>,
    pub categories: Vec<Category>,
}

/// Fuente de friccion durante la corrida.
#[derive(Clone, Debug)]
pub enum WeatherPlan {
    /// Pronostico ordenado; se muestrea cada segundo simulado
    Forecast(Vec<WeatherSample>),
    /// Friccion constante (escenario de prueba)
    Fixed,
}

pub struct SimulationLoop {
    pub cfg: LoopCfg,
    pub routes: RouteSet,
    pub cache: GeoCache,
    pub tf: CoordinateTransformer,
    pub plan: WeatherPlan,
    /// Instante real que corresponde a t = 0
    pub anchor: DateTime<Utc>,
    /// Lectura aplicada antes del primer paso
    pub initial: WeatherReading,
}

fn every(t: f64, period_s: u32) -> bool {
    let t = t as i64;
    period_s > 0 && t > 0 && t % period_s as i64 == 0
}

fn route_edges(routes: &RouteSet) -> BTreeSet<&str> {
    routes.values().flatten().map(String::as_str).collect()
}

fn apply_friction<'a, S: SimControl>(sim: &mut S, edges: impl IntoIterator<Item = &'a str>, friction: f64) -> usize {
    let mut ok = 0;
    let mut failed = 0;
    for e in edges {
        match sim.set_edge_friction(e, friction) {
            Ok(()) => ok += 1,
            Err(_) => failed += 1,
        }
    }
    if failed > 0 {
        warn!("friccion {friction} no aplicada en {failed} de {} edges", ok + failed);
    }
    ok
}

/// Aplica `friction` a todos los edges distintos del `RouteSet`. Devuelve cuantos se fijaron.
pub fn apply_route_friction<S: SimControl>(sim: &mut S, routes: &RouteSet, friction: f64) -> usize {
    apply_friction(sim, route_edges(routes), friction)
}

fn summarize(telemetry: &Telemetry) -> Vec<VehicleSummary> {
    telemetry
        .speeds
        .iter()
        .map(|(v, s)| {
            let avg = if s.is_empty() { 0.0 } else { s.iter().sum::<f64>() / s.len() as f64 };
            let max = s.iter().copied().fold(0.0, f64::max);
            VehicleSummary { vehicle: v.clone(), avg_kmh: avg, max_kmh: max }
        })
        .collect()
}

impl SimulationLoop {
    fn record_speeds<S: SimControl>(&self, sim: &mut S, tel: &mut Telemetry) {
        let active: BTreeSet<String> = match sim.vehicle_ids() {
            Ok(v) => v.into_iter().collect(),
            Err(e) => {
                warn!("lista de vehiculos: {e}");
                BTreeSet::new()
            }
        };
        for v in &self.cfg.tracked {
            let kmh = if active.contains(v) {
                sim.vehicle_speed(v).map(|ms| ms * MS_TO_KMH).unwrap_or(0.0)
            } else {
                0.0
            };
            tel.speeds.entry(v.clone()).or_default().push(kmh);
        }
    }

    pub async fn run<S, R, F>(
        mut self,
        sim: &mut S,
        orch: &mut RerouteOrchestrator<R>,
        feed: &IncidentFeed<'_, F>,
        cancel: &AtomicBool,
    ) -> RunReport
    where
        S: SimControl,
        R: Router,
        F: FeedSource,
    {
        let mut tel = Telemetry::default();
        for v in &self.cfg.tracked {
            tel.speeds.insert(v.clone(), Vec::new());
        }

        let n = apply_route_friction(sim, &self.routes, self.initial.friction);
        info!("friccion inicial {} ({}) en {n} edges", self.initial.friction, self.initial.label);
        tel.weather_log.push(WeatherEvent { time: 0.0, weather: self.initial.label.clone(), friction: self.initial.friction });
        let mut prev_code = self.initial.code;
        let mut friction = self.initial.friction;

        info!("inicio de simulacion, t=0 -> {}", self.anchor.format("%H:%M:%S %Y-%m-%d"));
        let mut t = 0.0;
        let mut cancelled = false;

        loop {
            match sim.pending_vehicles() {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    error!("simulador sin respuesta: {e}");
                    break;
                }
            }
            if let Err(e) = sim.step() {
                error!("fallo en el paso de simulacion: {e}");
                break;
            }
            t = match sim.time() {
                Ok(x) => x,
                Err(e) => {
                    error!("no se pudo leer el reloj: {e}");
                    break;
                }
            };

            tel.times.push(t);
            self.record_speeds(sim, &mut tel);

            match &self.plan {
                WeatherPlan::Forecast(fc) => {
                    if let Some(s) = resolve(fc, self.anchor, t) {
                        let reading = reading_for(s.code);
                        if Some(s.code) != prev_code {
                            apply_route_friction(sim, &self.routes, reading.friction);
                            let real = self.anchor + ChronoDuration::seconds(t as i64);
                            info!(
                                "cambio de clima en {:.1} min ({}): {} (friccion {})",
                                t / 60.0,
                                real.format("%H:%M"),
                                reading.label,
                                reading.friction
                            );
                            friction = reading.friction;
                            tel.weather_log.push(WeatherEvent { time: t, weather: reading.label, friction: reading.friction });
                            prev_code = Some(s.code);
                        } else if every(t, self.cfg.weather_log_s) {
                            info!("clima: {} (friccion {})", reading.label, reading.friction);
                        }
                    }
                }
                WeatherPlan::Fixed => {
                    if every(t, self.cfg.weather_log_s) {
                        info!("escenario fijo: se mantiene {} (friccion {})", self.initial.label, self.initial.friction);
                    }
                }
            }

            if every(t, self.cfg.incident_check_s) {
                let incidents = feed.poll(&self.cfg.areas, &self.cfg.categories).await;
                let before: BTreeSet<String> = route_edges(&self.routes).into_iter().map(str::to_string).collect();
                match orch.live(sim, &incidents, &mut self.cache, &mut self.routes, &self.tf) {
                    LiveOutcome::Unchanged => info!("trafico: sin cambios en incidencias"),
                    LiveOutcome::Applied { affected_edges, rerouted, .. } => {
                        info!("trafico: {affected_edges} tramos afectados, {rerouted} vehiculos re-enrutados");
                        if rerouted > 0 {
                            let fresh: Vec<&str> =
                                route_edges(&self.routes).into_iter().filter(|e| !before.contains(*e)).collect();
                            if !fresh.is_empty() {
                                let n = apply_friction(sim, fresh, friction);
                                info!("friccion {friction} aplicada a {n} edges nuevos tras el reroute");
                            }
                        }
                    }
                }
            }

            if cancel.load(Ordering::Relaxed) {
                warn!("cancelado en t={t}");
                cancelled = true;
                break;
            }
            tokio::task::yield_now().await;
        }

        let end = self.anchor + ChronoDuration::milliseconds((t * 1000.0) as i64);
        info!(
            "fin: periodo simulado {} a {} ({:.1} min)",
            self.anchor.format("%H:%M:%S"),
            end.format("%H:%M:%S"),
            t / 60.0
        );
        RunReport {
            sim_start_utc: self.anchor,
            sim_end_utc: end,
            duration_s: t,
            vehicles: summarize(&tel),
            weather_changes: tel.weather_log.len().saturating_sub(1),
            incidents_processed: orch.incidents_processed(),
            vehicles_rerouted: orch.vehicles_rerouted(),
            cancelled,
            telemetry: tel,
        }
    }
}
