//! sumo/mod.rs
//!
//! Colaboradores externos: el simulador (via TraCI) y el router (duarouter).
//!
//! El nucleo solo habla con `SimControl` y `Router`; asi se puede probar
//! sin un SUMO levantado.

pub mod router;
pub mod traci;

#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;

use crate::types::RouteSet;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("E/S con el simulador: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocolo TraCI: {0}")]
    Protocol(String),
    #[error("comando rechazado por SUMO: {0}")]
    Command(String),
    #[error("simulador no disponible: {0}")]
    NotRunning(String),
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("no se pudo lanzar el router: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("router termino con estado {code:?}: {stderr}")]
    Failed { code: Option<i32>, stderr: String },
    #[error("salida del router ilegible: {0}")]
    Output(String),
}

/// Lo que el controlador necesita del simulador. No es reentrante:
/// ninguna llamada puede solaparse con `step()`.
pub trait SimControl {
    fn lane_count(&mut self, edge: &str) -> Result<usize, SimError>;
    fn lane_shape(&mut self, lane: &str) -> Result<Vec<(f64, f64)>, SimError>;
    fn edge_shape(&mut self, edge: &str) -> Result<Vec<(f64, f64)>, SimError>;
    fn edge_length(&mut self, edge: &str) -> Result<f64, SimError>;
    /// (desde, hasta)
    fn edge_junctions(&mut self, edge: &str) -> Result<(String, String), SimError>;
    fn junction_position(&mut self, junction: &str) -> Result<(f64, f64), SimError>;
    fn set_edge_friction(&mut self, edge: &str, friction: f64) -> Result<(), SimError>;

    fn vehicle_ids(&mut self) -> Result<Vec<String>, SimError>;
    fn vehicle_route(&mut self, vehicle: &str) -> Result<Vec<String>, SimError>;
    /// m/s
    fn vehicle_speed(&mut self, vehicle: &str) -> Result<f64, SimError>;
    fn reroute_by_travel_time(&mut self, vehicle: &str) -> Result<(), SimError>;

    fn step(&mut self) -> Result<(), SimError>;
    fn time(&mut self) -> Result<f64, SimError>;
    /// Vehiculos por salir o en circulacion
    fn pending_vehicles(&mut self) -> Result<usize, SimError>;
}

/// Router externo: red + viajes + pesos opcionales -> asignacion completa.
pub trait Router {
    fn route(&self, weights: Option<&std::path::Path>) -> Result<RouteSet, RouterError>;
}
