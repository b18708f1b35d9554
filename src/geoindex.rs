//! geoindex.rs
//!
//! Indice espacial de los tramos (edges) que aparecen en las rutas.
//!
//! Funcionalidad principal:
//! - Resolver la geometria de cada edge via el simulador: carriles, luego
//!   forma del edge, luego punto medio entre sus dos cruces.
//! - Centroide = media aritmetica de todos los vertices resueltos.
//! - Longitud del edge (100 m si no se puede consultar).
//! - `RTree` sobre los centroides para las consultas por radio.
//!
//! Un edge sin geometria resoluble se omite; nunca se coloca en un punto centinela.
//! `GeoCache` es el contexto que se invalida y reconstruye cuando cambia el `RouteSet`.

use rstar::{PointDistance, RTree, RTreeObject, AABB};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::sumo::SimControl;
use crate::types::{EdgeCenter, RouteSet};

/// Longitud supuesta cuando el simulador no la devuelve.
pub const DEFAULT_EDGE_LENGTH_M: f64 = 100.0;

#[derive(Clone, Copy, Debug)]
pub struct EdgeItem {
    pub idx: usize,
    pub pos: [f64; 2],
}

impl RTreeObject for EdgeItem {
    type Envelope = AABB<[f64; 2]>;
    fn envelope(&self) -> Self::Envelope { AABB::from_point(self.pos) }
}

impl PointDistance for EdgeItem {
    fn distance_2(&self, p: &[f64; 2]) -> f64 {
        let (dx, dy) = (self.pos[0] - p[0], self.pos[1] - p[1]);
        dx * dx + dy * dy
    }
}

#[derive(Clone)]
pub struct GeoIndex {
    centers: Vec<EdgeCenter>,
    tree: RTree<EdgeItem>,
}

fn centroid(pts: &[(f64, f64)]) -> Option<(f64, f64)> {
    if pts.is_empty() { return None; }
    let n = pts.len() as f64;
    let (sx, sy) = pts.iter().fold((0.0, 0.0), |(ax, ay), (x, y)| (ax + x, ay + y));
    let c = (sx / n, sy / n);
    (c.0.is_finite() && c.1.is_finite()).then_some(c)
}

/// Vertices del edge por orden de preferencia. `None` si nada resuelve.
fn resolve_vertices<S: SimControl>(sim: &mut S, edge: &str) -> Option<Vec<(f64, f64)>> {
    // 1) concatenacion de las formas de todos los carriles
    let lanes = sim.lane_count(edge).unwrap_or(0);
    let mut pts = Vec::new();
    for i in 0..lanes {
        match sim.lane_shape(&format!("{edge}_{i}")) {
            Ok(s) => pts.extend(s),
            Err(e) => debug!("carril {edge}_{i}: {e}"),
        }
    }
    if !pts.is_empty() { return Some(pts); }

    // 2) forma propia del edge
    if let Ok(s) = sim.edge_shape(edge) {
        if !s.is_empty() { return Some(s); }
    }

    // 3) punto medio entre cruces
    let (from, to) = sim.edge_junctions(edge).ok()?;
    let a = sim.junction_position(&from).ok()?;
    let b = sim.junction_position(&to).ok()?;
    Some(vec![((a.0 + b.0) / 2.0, (a.1 + b.1) / 2.0)])
}

impl GeoIndex {
    /// Construye el indice para todos los edges distintos de `routes`.
    pub fn build<S: SimControl>(sim: &mut S, routes: &RouteSet) -> Self {
        let edges: BTreeSet<&str> = routes.values().flatten().map(String::as_str).collect();
        let mut centers = Vec::with_capacity(edges.len());
        let mut omitted = 0usize;

        for edge in edges {
            let Some((x, y)) = resolve_vertices(sim, edge).and_then(|v| centroid(&v)) else {
                warn!("edge {edge} sin geometria resoluble, se omite");
                omitted += 1;
                continue;
            };
            let length = sim
                .edge_length(edge)
                .ok()
                .filter(|l| l.is_finite() && *l > 0.0)
                .unwrap_or(DEFAULT_EDGE_LENGTH_M);
            centers.push(EdgeCenter { edge: edge.to_string(), x, y, length });
        }

        info!("indice de tramos: {} edges ({} omitidos)", centers.len(), omitted);
        Self::from_centers(centers)
    }

    pub fn from_centers(centers: Vec<EdgeCenter>) -> Self {
        let items = centers
            .iter()
            .enumerate()
            .map(|(idx, c)| EdgeItem { idx, pos: [c.x, c.y] })
            .collect();
        Self { centers, tree: RTree::bulk_load(items) }
    }

    pub fn is_empty(&self) -> bool { self.centers.is_empty() }
    #[cfg(test)]
    pub fn len(&self) -> usize { self.centers.len() }
    #[cfg(test)]
    pub fn get(&self, edge: &str) -> Option<&EdgeCenter> { self.centers.iter().find(|c| c.edge == edge) }
    pub fn iter(&self) -> impl Iterator<Item = &EdgeCenter> { self.centers.iter() }

    /// Centros a distancia euclidea <= `r` de (x, y).
    pub fn within(&self, x: f64, y: f64, r: f64) -> impl Iterator<Item = &EdgeCenter> {
        self.tree
            .locate_within_distance([x, y], r * r)
            .map(move |it| &self.centers[it.idx])
    }
}

/// Contexto del indice: se invalida cuando cambia el `RouteSet` y se
/// reconstruye entero, nunca se parchea.
#[derive(Default)]
pub struct GeoCache {
    index: Option<GeoIndex>,
    builds: usize,
}

impl GeoCache {
    pub fn invalidate(&mut self) {
        if self.index.take().is_some() {
            debug!("indice de tramos invalidado");
        }
    }

    pub fn rebuild<S: SimControl>(&mut self, sim: &mut S, routes: &RouteSet) -> &GeoIndex {
        self.builds += 1;
        debug!("reconstruyendo indice de tramos (#{})", self.builds);
        self.index.insert(GeoIndex::build(sim, routes))
    }

    /// Indice vigente, reconstruyendo si estaba invalidado.
    pub fn ensure<S: SimControl>(&mut self, sim: &mut S, routes: &RouteSet) -> &GeoIndex {
        if self.index.is_none() {
            return self.rebuild(sim, routes);
        }
        self.index.get_or_insert_with(|| GeoIndex::from_centers(Vec::new()))
    }

    pub fn current(&self) -> Option<&GeoIndex> { self.index.as_ref() }
    #[cfg(test)]
    pub fn builds(&self) -> usize { self.builds }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sumo::fake::FakeSim;

    fn routes(list: &[(&str, &[&str])]) -> RouteSet {
        list.iter()
            .map(|(v, e)| (v.to_string(), e.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    #[test]
    fn geometry_preference_order() {
        let mut sim = FakeSim::new(0.0)
            .lane_edge("lanes", vec![vec![(0.0, 0.0), (10.0, 0.0)], vec![(0.0, 2.0), (10.0, 2.0)]], 10.0)
            .shape_edge("lanes", vec![(500.0, 500.0)])
            .shape_edge("shape", vec![(100.0, 100.0), (200.0, 300.0)])
            .junction_edge("junct", (0.0, 0.0), (40.0, 20.0));
        let idx = GeoIndex::build(&mut sim, &routes(&[("v", &["lanes", "shape", "junct"])]));

        let l = idx.get("lanes").unwrap();
        assert_eq!((l.x, l.y, l.length), (5.0, 1.0, 10.0));
        let s = idx.get("shape").unwrap();
        assert_eq!((s.x, s.y), (150.0, 200.0));
        assert_eq!(s.length, DEFAULT_EDGE_LENGTH_M);
        let j = idx.get("junct").unwrap();
        assert_eq!((j.x, j.y), (20.0, 10.0));
    }

    #[test]
    fn unresolvable_edge_is_omitted() {
        let mut sim = FakeSim::new(0.0).shape_edge("ok", vec![(1.0, 1.0)]);
        let idx = GeoIndex::build(&mut sim, &routes(&[("a", &["ok", "ghost"]), ("b", &["ok"])]));
        assert_eq!(idx.len(), 1);
        assert!(idx.get("ghost").is_none());
        assert!(idx.iter().all(|c| c.x.is_finite() && c.y.is_finite()));
    }

    #[test]
    fn within_radius() {
        let idx = GeoIndex::from_centers(vec![
            EdgeCenter { edge: "near".into(), x: 30.0, y: 40.0, length: 100.0 },
            EdgeCenter { edge: "far".into(), x: 300.0, y: 400.0, length: 100.0 },
        ]);
        let hits: Vec<_> = idx.within(0.0, 0.0, 50.0).map(|c| c.edge.as_str()).collect();
        assert_eq!(hits, vec!["near"]);
        assert_eq!(idx.within(0.0, 0.0, 49.9).count(), 0);
    }

    #[test]
    fn cache_rebuilds_after_invalidate() {
        let mut sim = FakeSim::new(0.0).shape_edge("a", vec![(0.0, 0.0)]).shape_edge("b", vec![(9.0, 9.0)]);
        let mut cache = GeoCache::default();
        assert_eq!(cache.ensure(&mut sim, &routes(&[("v", &["a"])])).len(), 1);
        // sin invalidar no se reconstruye
        assert_eq!(cache.ensure(&mut sim, &routes(&[("v", &["a", "b"])])).len(), 1);
        cache.invalidate();
        assert!(cache.current().is_none());
        assert_eq!(cache.ensure(&mut sim, &routes(&[("v", &["a", "b"])])).len(), 2);
        assert_eq!(cache.builds(), 2);
    }
}
