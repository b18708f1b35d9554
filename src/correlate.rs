//! correlate.rs
//!
//! Cruce incidencias -> tramos afectados (`AffectedEdgeMap`).
//!
//! - Con coordenadas locales: radio = base + min(longitud * 0.1, 100) m,
//!   distancia euclidea al centroide; candidatos via `RTree`.
//! - Sin coordenadas locales (modo degradado): radio = 2 * base, haversine
//!   contra la posicion GPS aproximada del centroide. Este camino recorre todos
//!   los tramos (incidencias x tramos) y es el cuello de botella con redes grandes.
//! - Cada tramo guarda la severidad maxima; el orden de las incidencias no importa.

use geo::{HaversineDistance, Point};
use tracing::{debug, info};

use crate::geoindex::GeoIndex;
use crate::types::{AffectedEdgeMap, EdgeCenter, Incident, Severity};
use crate::utm::CoordinateTransformer;

/// Extra maximo que aporta la longitud del tramo al radio local
pub const LENGTH_BONUS_CAP_M: f64 = 100.0;
pub const LENGTH_BONUS_FACTOR: f64 = 0.1;
/// Multiplicador del radio en el modo GPS
pub const GPS_RADIUS_FACTOR: f64 = 2.0;

pub fn local_radius(severity: Severity, edge_length: f64) -> f64 {
    severity.base_radius_m() + (edge_length * LENGTH_BONUS_FACTOR).min(LENGTH_BONUS_CAP_M)
}

pub fn gps_radius(severity: Severity) -> f64 {
    severity.base_radius_m() * GPS_RADIUS_FACTOR
}

fn record(out: &mut AffectedEdgeMap, edge: &str, sev: Severity) {
    out.entry(edge.to_string())
        .and_modify(|s| *s = (*s).max(sev))
        .or_insert(sev);
}

fn hits_local<'g>(geo: &'g GeoIndex, inc: &Incident, x: f64, y: f64) -> impl Iterator<Item = &'g EdgeCenter> {
    let sev = inc.severity;
    let reach = sev.base_radius_m() + LENGTH_BONUS_CAP_M + 1e-6;
    geo.within(x, y, reach).filter(move |c| {
        let d = ((c.x - x).powi(2) + (c.y - y).powi(2)).sqrt();
        d <= local_radius(sev, c.length)
    })
}

pub fn correlate(incidents: &[Incident], geo: &GeoIndex, tf: &CoordinateTransformer) -> AffectedEdgeMap {
    let mut out = AffectedEdgeMap::new();
    let mut degraded = 0usize;

    for inc in incidents {
        match inc.local {
            Some((x, y)) => {
                for c in hits_local(geo, inc, x, y) {
                    record(&mut out, &c.edge, inc.severity);
                }
            }
            None => {
                degraded += 1;
                let here = Point::new(inc.lon, inc.lat);
                let r = gps_radius(inc.severity);
                for c in geo.iter() {
                    let (lat, lon) = tf.approx_gps(c.x, c.y);
                    if here.haversine_distance(&Point::new(lon, lat)) <= r {
                        record(&mut out, &c.edge, inc.severity);
                    }
                }
            }
        }
    }

    if degraded > 0 {
        let why = if tf.is_available() { "fuera del dominio de la proyeccion" } else { "sin proyeccion" };
        debug!("{degraded} incidencias evaluadas por GPS, modo degradado ({why})");
    }
    let count = |s: Severity| out.values().filter(|&&v| v == s).count();
    info!(
        "tramos afectados: {} (high {}, medium {}, low {})",
        out.len(),
        count(Severity::High),
        count(Severity::Medium),
        count(Severity::Low)
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Category;
    use crate::utm::UtmProjection;
    use proptest::prelude::*;

    fn center(edge: &str, x: f64, y: f64, length: f64) -> EdgeCenter {
        EdgeCenter { edge: edge.into(), x, y, length }
    }

    fn inc(sev: Severity, local: Option<(f64, f64)>, lat: f64, lon: f64) -> Incident {
        Incident {
            id: format!("{sev:?}-{lat}-{lon}"),
            title: "t".into(),
            lat,
            lon,
            local,
            category: Category::Warning,
            area: "A2".into(),
            severity: sev,
            timestamp: None,
        }
    }

    #[test]
    fn high_severity_radius_with_length_bonus() {
        // radio 200 + min(500 * 0.1, 100) = 250
        let geo = GeoIndex::from_centers(vec![center("E1", 150.0, 0.0, 500.0)]);
        let out = correlate(&[inc(Severity::High, Some((0.0, 0.0)), 0.0, 0.0)], &geo, &CoordinateTransformer::unavailable());
        assert_eq!(out.get("E1"), Some(&Severity::High));
    }

    #[test]
    fn outside_radius_is_excluded() {
        // low: 50 + min(100 * 0.1, 100) = 60
        let geo = GeoIndex::from_centers(vec![center("in", 59.0, 0.0, 100.0), center("out", 61.0, 0.0, 100.0)]);
        let out = correlate(&[inc(Severity::Low, Some((0.0, 0.0)), 0.0, 0.0)], &geo, &CoordinateTransformer::unavailable());
        assert!(out.contains_key("in"));
        assert!(!out.contains_key("out"));
    }

    #[test]
    fn max_severity_wins_in_any_order() {
        let geo = GeoIndex::from_centers(vec![center("E", 10.0, 10.0, 100.0)]);
        let tf = CoordinateTransformer::unavailable();
        let low = inc(Severity::Low, Some((0.0, 0.0)), 0.0, 0.0);
        let high = inc(Severity::High, Some((20.0, 0.0)), 0.0, 0.0);
        let a = correlate(&[low.clone(), high.clone()], &geo, &tf);
        let b = correlate(&[high, low], &geo, &tf);
        assert_eq!(a.get("E"), Some(&Severity::High));
        assert_eq!(a, b);
    }

    #[test]
    fn gps_fallback_uses_doubled_radius() {
        let proj = UtmProjection { zone: 32, south: false, offset: (0.0, 0.0) };
        let tf = CoordinateTransformer::new(proj);
        let (x, y) = proj.forward(52.42, 10.78).unwrap();
        // ~150 m al norte: fuera de 100 (medium local) pero dentro de 200 (GPS)
        let geo = GeoIndex::from_centers(vec![center("E", x, y + 150.0, 0.0)]);
        let out = correlate(&[inc(Severity::Medium, None, 52.42, 10.78)], &geo, &tf);
        assert_eq!(out.get("E"), Some(&Severity::Medium));

        let far = GeoIndex::from_centers(vec![center("E", x, y + 250.0, 0.0)]);
        assert!(correlate(&[inc(Severity::Medium, None, 52.42, 10.78)], &far, &tf).is_empty());
    }

    #[test]
    fn gps_fallback_without_projection_uses_crude_degrees() {
        // (x, y) = (lon, lat) * 111000
        let geo = GeoIndex::from_centers(vec![center("E", 10.78 * 111_000.0, 52.42 * 111_000.0, 0.0)]);
        let out = correlate(&[inc(Severity::Low, None, 52.42, 10.78)], &geo, &CoordinateTransformer::unavailable());
        assert_eq!(out.get("E"), Some(&Severity::Low));
    }

    #[test]
    fn radius_grows_with_length_until_cap() {
        for s in [Severity::Low, Severity::Medium, Severity::High] {
            let mut prev = 0.0;
            for len in [0.0, 10.0, 100.0, 500.0, 1000.0, 5000.0] {
                let r = local_radius(s, len);
                assert!(r >= prev);
                prev = r;
            }
            assert_eq!(local_radius(s, 5000.0), s.base_radius_m() + LENGTH_BONUS_CAP_M);
        }
    }

    fn severity() -> impl Strategy<Value = Severity> {
        prop_oneof![Just(Severity::Low), Just(Severity::Medium), Just(Severity::High)]
    }

    proptest! {
        #[test]
        fn radius_is_monotonic_in_severity(len in 0.0f64..100_000.0) {
            prop_assert!(local_radius(Severity::High, len) >= local_radius(Severity::Medium, len));
            prop_assert!(local_radius(Severity::Medium, len) >= local_radius(Severity::Low, len));
            prop_assert!(gps_radius(Severity::High) >= gps_radius(Severity::Medium));
            prop_assert!(gps_radius(Severity::Medium) >= gps_radius(Severity::Low));
        }

        #[test]
        fn higher_severity_covers_at_least_as_many_edges(
            edges in prop::collection::vec((-800.0f64..800.0, -800.0f64..800.0, 0.0f64..2000.0), 1..40),
            x in -800.0f64..800.0,
            y in -800.0f64..800.0,
        ) {
            let centers: Vec<_> = edges.iter().enumerate()
                .map(|(i, &(ex, ey, l))| center(&format!("e{i}"), ex, ey, l))
                .collect();
            let geo = GeoIndex::from_centers(centers);
            let tf = CoordinateTransformer::unavailable();
            let hit = |s: Severity| correlate(&[inc(s, Some((x, y)), 0.0, 0.0)], &geo, &tf);
            let (low, medium, high) = (hit(Severity::Low), hit(Severity::Medium), hit(Severity::High));
            prop_assert!(low.keys().all(|e| medium.contains_key(e)));
            prop_assert!(medium.keys().all(|e| high.contains_key(e)));
        }

        #[test]
        fn every_affected_edge_is_covered(
            edges in prop::collection::vec((-800.0f64..800.0, -800.0f64..800.0, 0.0f64..2000.0), 1..40),
            incs in prop::collection::vec((-800.0f64..800.0, -800.0f64..800.0, severity()), 0..8),
        ) {
            let centers: Vec<_> = edges.iter().enumerate()
                .map(|(i, &(x, y, l))| center(&format!("e{i}"), x, y, l))
                .collect();
            let geo = GeoIndex::from_centers(centers.clone());
            let incidents: Vec<_> = incs.iter().map(|&(x, y, s)| inc(s, Some((x, y)), 0.0, 0.0)).collect();
            let out = correlate(&incidents, &geo, &CoordinateTransformer::unavailable());

            for c in &centers {
                let covering: Vec<Severity> = incidents.iter()
                    .filter(|i| {
                        let (x, y) = i.local.unwrap();
                        ((c.x - x).powi(2) + (c.y - y).powi(2)).sqrt() <= local_radius(i.severity, c.length)
                    })
                    .map(|i| i.severity)
                    .collect();
                prop_assert_eq!(out.get(&c.edge).copied(), covering.into_iter().max());
            }
        }
    }
}
