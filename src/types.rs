//! types.rs
//! Modelos de datos compartidos por el controlador: incidencias, centros de
//! tramo, muestras de clima, configuracion y telemetria de la corrida

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

/// vehiculo -> lista ordenada de edges
pub type RouteSet = BTreeMap<String, Vec<String>>;

/// edge -> severidad maxima de las incidencias que lo cubren
pub type AffectedEdgeMap = BTreeMap<String, Severity>;

/// Ids de la ultima tanda de incidencias observada
pub type PrevIncidentSet = BTreeSet<String>;

/// Severidad de una incidencia. El orden derivado es el ranking: Low < Medium < High.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    /// Radio base de deteccion en metros.
    pub fn base_radius_m(self) -> f64 {
        match self {
            Severity::High => 200.0,
            Severity::Medium => 100.0,
            Severity::Low => 50.0,
        }
    }

    /// Penalizacion de tiempo de viaje en unidades del router.
    pub fn penalty(self) -> u32 {
        match self {
            Severity::High => 100_000,
            Severity::Medium => 10_000,
            Severity::Low => 2_000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Warning,
    Roadworks,
}

impl Category {
    /// Nombre del servicio en la API de autobahn (y clave del array en la respuesta).
    pub fn service(self) -> &'static str {
        match self {
            Category::Warning => "warning",
            Category::Roadworks => "roadworks",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "warning" => Some(Category::Warning),
            "roadworks" => Some(Category::Roadworks),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    pub lat: f64,
    pub lon: f64,
    /// Coordenadas planas de la red, si la proyeccion fue posible
    pub local: Option<(f64, f64)>,
    pub category: Category,
    pub area: String,
    pub severity: Severity,
    pub timestamp: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeCenter {
    pub edge: String,
    pub x: f64,
    pub y: f64,
    pub length: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct WeatherSample {
    pub ts: DateTime<Utc>,
    pub code: i32,
}

/// Lectura instantanea de clima ya traducida a friccion.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeatherReading {
    pub friction: f64,
    pub code: Option<i32>,
    pub label: String,
}

impl WeatherReading {
    pub fn clear_default() -> Self {
        Self { friction: 1.0, code: None, label: "Clear (default)".into() }
    }
}

/// Modo de friccion, resuelto una sola vez al arrancar.
#[derive(Clone, Debug, PartialEq)]
pub enum FrictionMode {
    LiveWeather,
    FixedScenario { friction: f64, label: String },
}

impl Default for FrictionMode {
    fn default() -> Self { FrictionMode::LiveWeather }
}

impl FrictionMode {
    /// Escenario de prueba de baja adherencia (tormenta con granizo).
    pub fn storm_scenario(friction: Option<f64>) -> Self {
        FrictionMode::FixedScenario {
            friction: friction.unwrap_or(0.25),
            label: "TEST: Heavy Thunderstorm with Hail".into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppCfg {
    pub sumo_home: Option<PathBuf>,
    pub sumo_bin: PathBuf,
    pub duarouter_bin: PathBuf,
    pub sumo_cfg: PathBuf,
    pub net_file: PathBuf,
    pub trip_file: PathBuf,
    pub routed_file: PathBuf,
    pub weights_file: PathBuf,
    pub traci_port: u16,
    pub sim_end_s: u32,

    pub weather_url: String,
    pub weather_lat: f64,
    pub weather_lon: f64,
    pub forecast_hours: u32,
    pub t_weather_timeout_s: u64,
    pub friction_mode: FrictionMode,

    pub incident_url: String,
    pub areas: Vec<String>,
    pub categories: Vec<Category>,
    pub t_incid_timeout_s: u64,
    pub incident_check_s: u32,
    pub weather_log_s: u32,

    /// None = usar lo que diga el net.xml
    pub utm_zone: Option<u8>,
    pub utm_south: bool,
    pub net_offset: Option<(f64, f64)>,
    pub projection_enabled: bool,

    pub tracked_vehicles: Vec<String>,
    pub telemetry_out: Option<PathBuf>,
}

impl Default for AppCfg {
    fn default() -> Self {
        Self {
            sumo_home: None,
            sumo_bin: "sumo".into(),
            duarouter_bin: "duarouter".into(),
            sumo_cfg: "wolfsburg.sumocfg".into(),
            net_file: "wolfsburg.net.xml".into(),
            trip_file: "wolfsburg.rou.xml".into(),
            routed_file: "wolfsburg.routed.xml".into(),
            weights_file: "edge_weights.xml".into(),
            traci_port: 8813,
            sim_end_s: 3600,

            weather_url: "https://api.open-meteo.com/v1/forecast".into(),
            weather_lat: 52.42,
            weather_lon: 10.78,
            forecast_hours: 3,
            t_weather_timeout_s: 10,
            friction_mode: FrictionMode::default(),

            incident_url: "https://verkehr.autobahn.de/o/autobahn".into(),
            areas: vec!["A2".into(), "A39".into()],
            categories: vec![Category::Warning, Category::Roadworks],
            t_incid_timeout_s: 5,
            incident_check_s: 900,
            weather_log_s: 900,

            utm_zone: None,
            utm_south: false,
            net_offset: None,
            projection_enabled: true,

            tracked_vehicles: Vec::new(),
            telemetry_out: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct WeatherEvent {
    pub time: f64,
    pub weather: String,
    pub friction: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct Telemetry {
    pub times: Vec<f64>,
    /// km/h por vehiculo seguido, 0 si no esta en la red
    pub speeds: BTreeMap<String, Vec<f64>>,
    pub weather_log: Vec<WeatherEvent>,
}

#[derive(Clone, Debug, Serialize)]
pub struct VehicleSummary {
    pub vehicle: String,
    pub avg_kmh: f64,
    pub max_kmh: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub sim_start_utc: DateTime<Utc>,
    pub sim_end_utc: DateTime<Utc>,
    pub duration_s: f64,
    pub vehicles: Vec<VehicleSummary>,
    pub weather_changes: usize,
    pub incidents_processed: usize,
    pub vehicles_rerouted: usize,
    pub cancelled: bool,
    pub telemetry: Telemetry,
}
