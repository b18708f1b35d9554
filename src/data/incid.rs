//! incid.rs
//!
//! Incidencias de trafico de la API de autobahn (JSON por tramo y servicio)
//!
//! - Una peticion por (tramo, servicio); si una falla, ese par aporta cero
//!   incidencias y el resto sigue
//! - Cada item se convierte en `Incident` con severidad (por palabras clave
//!   del titulo), id estable y proyeccion local best-effort
//! - Se eliminan duplicados: mismo titulo a menos de 100 m
//!
//! La severidad decide radio de deteccion y penalizacion en el router

use geo::{HaversineDistance, Point};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::fetch::{FeedError, FeedSource};
use crate::types::{Category, Incident, Severity};
use crate::utm::CoordinateTransformer;

/// Distancia minima entre dos incidencias con el mismo titulo para no ser duplicado
pub const DEDUP_DISTANCE_M: f64 = 100.0;

/// Palabras clave por nivel, en orden de precedencia. Sin coincidencia -> Low.
const SEVERITY_KEYWORDS: &[(Severity, &[&str])] = &[
    (Severity::High, &["gesperrt", "vollsperrung", "blocked", "closed"]),
    (Severity::Medium, &["baustelle", "construction", "roadwork", "lane"]),
    (Severity::Low, &["stau", "verkehrsbehinderung", "congestion", "slow"]),
];

pub fn classify_severity(title: &str) -> Severity {
    let t = title.to_lowercase();
    SEVERITY_KEYWORDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| t.contains(w)))
        .map(|(s, _)| *s)
        .unwrap_or(Severity::Low)
}

/// Id del proveedor si viene; si no, hash del contenido (titulo + coordenada
/// redondeada + categoria). Nunca depende de la posicion en la lista.
pub fn incident_id(area: &str, category: Category, identifier: Option<&str>, title: &str, lat: f64, lon: f64) -> String {
    match identifier.map(str::trim).filter(|s| !s.is_empty()) {
        Some(id) => format!("{area}_{}_{id}", category.service()),
        None => {
            let key = format!("{}|{:.4}|{:.4}|{}", title.trim(), lat, lon, category.service());
            let h = xxhash_rust::xxh3::xxh3_64(key.as_bytes());
            format!("{area}_{}_{h:016x}", category.service())
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawItem {
    #[serde(default)]
    identifier: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    coordinate: Option<RawCoord>,
    #[serde(default)]
    start_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawCoord {
    #[serde(default)]
    lat: Option<Value>,
    #[serde(default)]
    long: Option<Value>,
}

/// La API manda coordenadas como string; aceptamos tambien numeros.
fn num(v: &Option<Value>) -> Option<f64> {
    let x = match v.as_ref()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    x.filter(|x| x.is_finite())
}

/// Parsea la respuesta de un (tramo, servicio). Items sin coordenada se descartan.
pub fn parse_incidents_json(
    body: &[u8],
    area: &str,
    category: Category,
    tf: &CoordinateTransformer,
) -> Result<Vec<Incident>, FeedError> {
    let v: Value = serde_json::from_slice(body).map_err(|e| FeedError::Malformed(e.to_string()))?;
    let items = match v.get(category.service()) {
        Some(Value::Array(a)) => a,
        Some(_) => return Err(FeedError::Malformed(format!("'{}' no es un array", category.service()))),
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    for it in items {
        let raw: RawItem = match serde_json::from_value(it.clone()) {
            Ok(r) => r,
            Err(e) => { debug!("item descartado en {area}/{}: {e}", category.service()); continue; }
        };
        let Some(coord) = raw.coordinate.as_ref() else { continue };
        let (Some(lat), Some(lon)) = (num(&coord.lat), num(&coord.long)) else { continue };
        let title = raw.title.as_deref().unwrap_or("").trim().to_string();
        out.push(Incident {
            id: incident_id(area, category, raw.identifier.as_deref(), &title, lat, lon),
            severity: classify_severity(&title),
            local: tf.project(lat, lon),
            title,
            lat,
            lon,
            category,
            area: area.to_string(),
            timestamp: raw.start_timestamp,
        });
    }
    Ok(out)
}

fn separation_m(a: &Incident, b: &Incident) -> f64 {
    match (a.local, b.local) {
        (Some((ax, ay)), Some((bx, by))) => ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt(),
        _ => Point::new(a.lon, a.lat).haversine_distance(&Point::new(b.lon, b.lat)),
    }
}

/// Mismo titulo y < 100 m => duplicado; se queda el primero visto.
pub fn dedup(incidents: Vec<Incident>) -> Vec<Incident> {
    let mut unique: Vec<Incident> = Vec::with_capacity(incidents.len());
    for inc in incidents {
        let dup = unique
            .iter()
            .any(|u| u.title == inc.title && separation_m(u, &inc) < DEDUP_DISTANCE_M);
        if !dup { unique.push(inc); }
    }
    unique
}

pub struct IncidentFeed<'a, S: FeedSource> {
    pub source: &'a S,
    pub base_url: String,
    pub timeout: Duration,
    pub transformer: CoordinateTransformer,
}

impl<'a, S: FeedSource> IncidentFeed<'a, S> {
    fn url(&self, area: &str, category: Category) -> String {
        format!("{}/{}/services/{}", self.base_url.trim_end_matches('/'), area, category.service())
    }

    async fn fetch_pair(&self, area: &str, category: Category) -> Result<Vec<Incident>, FeedError> {
        let body = self.source.get(&self.url(area, category), self.timeout).await?;
        parse_incidents_json(&body, area, category, &self.transformer)
    }

    /// Lista deduplicada de incidencias activas. Nunca falla en bloque.
    pub async fn poll(&self, areas: &[String], categories: &[Category]) -> Vec<Incident> {
        let mut all = Vec::new();
        for area in areas {
            for &cat in categories {
                match self.fetch_pair(area, cat).await {
                    Ok(mut v) => all.append(&mut v),
                    Err(e) => warn!("incidencias {area}/{}: {e}", cat.service()),
                }
            }
        }
        let raw = all.len();
        let out = dedup(all);
        let sin_local = out.iter().filter(|i| i.local.is_none()).count();
        if sin_local > 0 {
            warn!("{sin_local} incidencias sin coordenadas locales: deteccion degradada por GPS");
        }
        info!("incidencias: {} ({} antes de deduplicar)", out.len(), raw);
        out
    }
}
