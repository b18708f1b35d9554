//! utm.rs
//!
//! Conversion de coordenadas WGS84 (lat/lon) ↔ sistema plano local de SUMO.
//!
//! - SUMO trabaja en UTM desplazado por `netOffset` (ver `<location>` del net.xml).
//! - Aqui se implementa la proyeccion directa (GPS -> local) y la inversa.
//! - Si la proyeccion no esta configurada o el punto cae fuera del dominio
//!   se devuelve `None`: el llamador debe usar el modo degradado por haversine.
//!
//! El modo degradado es menos preciso; nunca se presenta como equivalente.

use tracing::debug;

const A: f64 = 6378137.0;
const E: f64 = 0.08181919084262149;
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500000.0;
const FALSE_NORTHING_SOUTH: f64 = 10000000.0;
/// Mas alla de esto respecto al meridiano central la precision ya no es de metros
const MAX_DLON_DEG: f64 = 9.0;

/// Metros por grado usados en el modo sin proyeccion (aproximacion gruesa)
pub const CRUDE_M_PER_DEG: f64 = 111_000.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct UtmProjection {
    pub zone: u8,
    pub south: bool,
    /// Desplazamiento que SUMO suma a las coordenadas UTM
    pub offset: (f64, f64),
}

impl UtmProjection {
    fn central_meridian(&self) -> f64 {
        (self.zone as f64 - 1.0) * 6.0 - 180.0 + 3.0
    }

    pub fn forward(&self, lat: f64, lon: f64) -> Option<(f64, f64)> {
        if !lat.is_finite() || !lon.is_finite() { return None; }
        if !(-80.0..=84.0).contains(&lat) { return None; }
        let dlon = lon - self.central_meridian();
        if dlon.abs() > MAX_DLON_DEG { return None; }

        let e2 = E * E;
        let ep2 = e2 / (1.0 - e2);
        let phi = lat.to_radians();
        let (s, c) = phi.sin_cos();
        let n = A / (1.0 - e2 * s * s).sqrt();
        let t = phi.tan().powi(2);
        let cc = ep2 * c * c;
        let a = c * dlon.to_radians();
        let m = A * ((1.0 - e2 / 4.0 - 3.0 * e2.powi(2) / 64.0 - 5.0 * e2.powi(3) / 256.0) * phi
            - (3.0 * e2 / 8.0 + 3.0 * e2.powi(2) / 32.0 + 45.0 * e2.powi(3) / 1024.0) * (2.0 * phi).sin()
            + (15.0 * e2.powi(2) / 256.0 + 45.0 * e2.powi(3) / 1024.0) * (4.0 * phi).sin()
            - (35.0 * e2.powi(3) / 3072.0) * (6.0 * phi).sin());

        let x = K0 * n * (a + (1.0 - t + cc) * a.powi(3) / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * cc - 58.0 * ep2) * a.powi(5) / 120.0)
            + FALSE_EASTING;
        let mut y = K0 * (m + n * phi.tan() * (a * a / 2.0
            + (5.0 - t + 9.0 * cc + 4.0 * cc * cc) * a.powi(4) / 24.0
            + (61.0 - 58.0 * t + t * t + 600.0 * cc - 330.0 * ep2) * a.powi(6) / 720.0));
        if self.south { y += FALSE_NORTHING_SOUTH; }

        if !x.is_finite() || !y.is_finite() { return None; }
        Some((x + self.offset.0, y + self.offset.1))
    }

    pub fn inverse(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        if !x.is_finite() || !y.is_finite() { return None; }
        let x = x - self.offset.0 - FALSE_EASTING;
        let mut y = y - self.offset.1;
        if self.south { y -= FALSE_NORTHING_SOUTH; }

        let m = y / K0;
        let mu = m / (A * (1.0 - E * E / 4.0 - 3.0 * E.powi(4) / 64.0 - 5.0 * E.powi(6) / 256.0));
        let e1 = (1.0 - (1.0 - E * E).sqrt()) / (1.0 + (1.0 - E * E).sqrt());
        let j1 = 3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0;
        let j2 = 21.0 * e1.powi(2) / 16.0 - 55.0 * e1.powi(4) / 32.0;
        let j3 = 151.0 * e1.powi(3) / 96.0;
        let j4 = 1097.0 * e1.powi(4) / 512.0;
        let fp = mu + j1 * (2.0 * mu).sin() + j2 * (4.0 * mu).sin() + j3 * (6.0 * mu).sin() + j4 * (8.0 * mu).sin();
        let e2 = E * E / (1.0 - E * E);
        let c1 = e2 * fp.cos().powi(2);
        let t1 = fp.tan().powi(2);
        let r1 = A * (1.0 - E * E) / (1.0 - (E * fp.sin()).powi(2)).powf(1.5);
        let n1 = A / (1.0 - (E * fp.sin()).powi(2)).sqrt();
        let d = x / (n1 * K0);

        let lat = fp - (n1 * fp.tan() / r1)
            * (d * d / 2.0 - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * e2) * d.powi(4) / 24.0
            + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1 - 252.0 * e2 - 3.0 * c1 * c1) * d.powi(6) / 720.0);
        let lon = (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * e2 + 24.0 * t1 * t1) * d.powi(5) / 120.0) / fp.cos();

        let (lat, lon) = (lat.to_degrees(), self.central_meridian() + lon.to_degrees());
        if lat.is_finite() && lon.is_finite() { Some((lat, lon)) } else { None }
    }
}

/// GPS -> plano local. Sin proyeccion configurada todo devuelve `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct CoordinateTransformer {
    proj: Option<UtmProjection>,
}

impl CoordinateTransformer {
    pub fn new(proj: UtmProjection) -> Self { Self { proj: Some(proj) } }

    pub fn unavailable() -> Self { Self { proj: None } }

    pub fn is_available(&self) -> bool { self.proj.is_some() }

    pub fn project(&self, lat: f64, lon: f64) -> Option<(f64, f64)> {
        let out = self.proj.and_then(|p| p.forward(lat, lon));
        if out.is_none() && self.proj.is_some() {
            debug!("proyeccion fuera de dominio para ({lat}, {lon})");
        }
        out
    }

    pub fn unproject(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        self.proj.and_then(|p| p.inverse(x, y))
    }

    /// Posicion GPS aproximada de un punto local. Sin proyeccion se usa la
    /// division por metros/grado: error de cientos de metros, solo para el modo degradado.
    pub fn approx_gps(&self, x: f64, y: f64) -> (f64, f64) {
        self.unproject(x, y).unwrap_or((y / CRUDE_M_PER_DEG, x / CRUDE_M_PER_DEG))
    }
}
