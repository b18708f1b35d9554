//! Simulador y router de mentira para las pruebas del nucleo.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{Router, RouterError, SimControl, SimError};
#[cfg(unix)]
use super::router::Duarouter;
use crate::types::RouteSet;

fn unknown(what: &str, id: &str) -> SimError {
    SimError::Command(format!("{what} '{id}' is not known"))
}

#[derive(Default)]
pub struct FakeSim {
    pub lanes: HashMap<String, Vec<Vec<(f64, f64)>>>,
    pub edge_shapes: HashMap<String, Vec<(f64, f64)>>,
    pub lengths: HashMap<String, f64>,
    pub junctions: HashMap<String, (String, String)>,
    pub junction_pos: HashMap<String, (f64, f64)>,
    pub friction: HashMap<String, f64>,

    /// vehiculos activos y su ruta actual
    pub active: BTreeMap<String, Vec<String>>,
    pub speeds: HashMap<String, f64>,
    /// ruta que recibe un vehiculo al pedir reroute
    pub reroute_to: HashMap<String, Vec<String>>,
    pub rerouted: Vec<String>,

    pub time: f64,
    /// el simulador da 0 pendientes a partir de este instante
    pub end_at: f64,
    /// traza de llamadas que mutan estado, en orden
    pub ops: Vec<String>,
}

impl FakeSim {
    pub fn new(end_at: f64) -> Self {
        Self { end_at, ..Default::default() }
    }

    pub fn lane_edge(mut self, edge: &str, lanes: Vec<Vec<(f64, f64)>>, length: f64) -> Self {
        self.lanes.insert(edge.into(), lanes);
        self.lengths.insert(edge.into(), length);
        self
    }

    pub fn shape_edge(mut self, edge: &str, shape: Vec<(f64, f64)>) -> Self {
        self.edge_shapes.insert(edge.into(), shape);
        self
    }

    pub fn junction_edge(mut self, edge: &str, from: (f64, f64), to: (f64, f64)) -> Self {
        let (f, t) = (format!("{edge}_from"), format!("{edge}_to"));
        self.junction_pos.insert(f.clone(), from);
        self.junction_pos.insert(t.clone(), to);
        self.junctions.insert(edge.into(), (f, t));
        self
    }

    pub fn vehicle(mut self, id: &str, route: &[&str], speed_ms: f64) -> Self {
        self.active.insert(id.into(), route.iter().map(|s| s.to_string()).collect());
        self.speeds.insert(id.into(), speed_ms);
        self
    }
}

impl SimControl for FakeSim {
    fn lane_count(&mut self, edge: &str) -> Result<usize, SimError> {
        Ok(self.lanes.get(edge).map(Vec::len).unwrap_or(0))
    }

    fn lane_shape(&mut self, lane: &str) -> Result<Vec<(f64, f64)>, SimError> {
        let (edge, idx) = lane.rsplit_once('_').ok_or_else(|| unknown("Lane", lane))?;
        let idx: usize = idx.parse().map_err(|_| unknown("Lane", lane))?;
        self.lanes
            .get(edge)
            .and_then(|l| l.get(idx))
            .cloned()
            .ok_or_else(|| unknown("Lane", lane))
    }

    fn edge_shape(&mut self, edge: &str) -> Result<Vec<(f64, f64)>, SimError> {
        self.edge_shapes.get(edge).cloned().ok_or_else(|| unknown("Edge", edge))
    }

    fn edge_length(&mut self, edge: &str) -> Result<f64, SimError> {
        self.lengths.get(edge).copied().ok_or_else(|| unknown("Lane", &format!("{edge}_0")))
    }

    fn edge_junctions(&mut self, edge: &str) -> Result<(String, String), SimError> {
        self.junctions.get(edge).cloned().ok_or_else(|| unknown("Edge", edge))
    }

    fn junction_position(&mut self, junction: &str) -> Result<(f64, f64), SimError> {
        self.junction_pos.get(junction).copied().ok_or_else(|| unknown("Junction", junction))
    }

    fn set_edge_friction(&mut self, edge: &str, friction: f64) -> Result<(), SimError> {
        self.friction.insert(edge.into(), friction);
        self.ops.push(format!("friction:{edge}"));
        Ok(())
    }

    fn vehicle_ids(&mut self) -> Result<Vec<String>, SimError> {
        Ok(self.active.keys().cloned().collect())
    }

    fn vehicle_route(&mut self, vehicle: &str) -> Result<Vec<String>, SimError> {
        self.active.get(vehicle).cloned().ok_or_else(|| unknown("Vehicle", vehicle))
    }

    fn vehicle_speed(&mut self, vehicle: &str) -> Result<f64, SimError> {
        if !self.active.contains_key(vehicle) {
            return Err(unknown("Vehicle", vehicle));
        }
        Ok(self.speeds.get(vehicle).copied().unwrap_or(0.0))
    }

    fn reroute_by_travel_time(&mut self, vehicle: &str) -> Result<(), SimError> {
        if !self.active.contains_key(vehicle) {
            return Err(unknown("Vehicle", vehicle));
        }
        if let Some(r) = self.reroute_to.get(vehicle) {
            self.active.insert(vehicle.into(), r.clone());
        }
        self.rerouted.push(vehicle.into());
        self.ops.push(format!("reroute:{vehicle}"));
        Ok(())
    }

    fn step(&mut self) -> Result<(), SimError> {
        self.time += 1.0;
        self.ops.push("step".into());
        Ok(())
    }

    fn time(&mut self) -> Result<f64, SimError> {
        Ok(self.time)
    }

    fn pending_vehicles(&mut self) -> Result<usize, SimError> {
        Ok(if self.time < self.end_at { 1 } else { 0 })
    }
}

/// Router que devuelve una asignacion fija o falla, y recuerda los pesos recibidos.
#[derive(Default)]
pub struct FakeRouter {
    pub result: Option<RouteSet>,
    pub calls: Mutex<Vec<Option<PathBuf>>>,
}

impl Router for FakeRouter {
    fn route(&self, weights: Option<&Path>) -> Result<RouteSet, RouterError> {
        if let Ok(mut c) = self.calls.lock() {
            c.push(weights.map(Path::to_path_buf));
        }
        self.result
            .clone()
            .ok_or(RouterError::Failed { code: Some(1), stderr: "Error: no route".into() })
    }
}

/// Contenido previo del fichero de rutas en `script_router`.
#[cfg(unix)]
pub const PREVIOUS_ROUTES: &str = r#"<routes><vehicle id="v1" depart="0"><route edges="a b"/></vehicle></routes>"#;

/// `Duarouter` real sobre un script que escribe `body` en la ruta de `-o` y sale con `code`.
/// Cada llamada usa su propio directorio, con `routed.xml` ya poblado.
#[cfg(unix)]
pub fn script_router(tag: &str, body: &str, code: i32) -> (PathBuf, Duarouter) {
    use std::os::unix::fs::PermissionsExt;

    let dir = std::env::temp_dir().join(format!("duarouter-{tag}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let bin = dir.join("duarouter");
    let script = format!(
        "#!/bin/sh\nwhile [ $# -gt 0 ]; do [ \"$1\" = \"-o\" ] && out=\"$2\"; shift; done\nprintf '%s\\n' '{body}' > \"$out\"\nexit {code}\n"
    );
    std::fs::write(&bin, script).unwrap();
    std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();

    let output = dir.join("routed.xml");
    std::fs::write(&output, PREVIOUS_ROUTES).unwrap();
    let r = Duarouter { binary: bin, net: dir.join("net.xml"), trips: dir.join("trips.xml"), output };
    (dir, r)
}
