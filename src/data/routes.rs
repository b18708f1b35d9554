//! routes.rs
//!
//! Lectura del fichero de rutas que genera duarouter (`*.routed.xml`)
//!
//! - `<vehicle>` con `<route edges="..."/>` anidado
//! - `<route id=... edges=...>` de primer nivel referenciado con `route="id"`
//! - Dentro de `<routeDistribution last="N">` se toma la ruta de indice N (la
//!   elegida por duarouter); sin `last` valido, la ultima listada
//!
//! Vehiculos sin ruta resoluble no aparecen en el resultado.

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

use crate::types::RouteSet;

fn attr(e: &BytesStart, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn split_edges(s: &str) -> Vec<String> {
    s.split_whitespace().map(str::to_string).collect()
}

/// `<routeDistribution>` abierta: id (si es de primer nivel), indice `last` y rutas vistas.
struct Distribution {
    id: Option<String>,
    last: Option<usize>,
    routes: Vec<Vec<String>>,
}

impl Distribution {
    fn chosen(mut self) -> Option<Vec<String>> {
        match self.last {
            Some(i) if i < self.routes.len() => Some(self.routes.swap_remove(i)),
            _ => self.routes.pop(),
        }
    }
}

pub fn parse_routes_xml(xml: &[u8]) -> Result<RouteSet, quick_xml::Error> {
    let mut r = Reader::from_reader(xml);
    r.trim_text(true);
    let mut buf = Vec::new();

    let mut named: HashMap<String, Vec<String>> = HashMap::new();
    // (vehiculo, ruta inline o referencia) en orden de aparicion
    let mut vehicles: Vec<(String, Option<Vec<String>>, Option<String>)> = Vec::new();
    let mut in_vehicle = false;
    let mut dist: Option<Distribution> = None;

    loop {
        let ev = r.read_event_into(&mut buf)?;
        match ev {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(ev, Event::Empty(_));
                match e.name().as_ref() {
                    b"vehicle" => {
                        if let Some(id) = attr(e, b"id") {
                            vehicles.push((id, None, attr(e, b"route")));
                            in_vehicle = !empty;
                        }
                    }
                    b"routeDistribution" if !empty => {
                        dist = Some(Distribution {
                            id: if in_vehicle { None } else { attr(e, b"id") },
                            last: attr(e, b"last").and_then(|v| v.trim().parse().ok()),
                            routes: Vec::new(),
                        });
                    }
                    b"route" => {
                        let edges = attr(e, b"edges").map(|s| split_edges(&s));
                        if let Some(d) = dist.as_mut() {
                            if let Some(edges) = edges {
                                d.routes.push(edges);
                            }
                        } else if in_vehicle {
                            if let (Some(v), Some(edges)) = (vehicles.last_mut(), edges) {
                                v.1 = Some(edges);
                            }
                        } else if let (Some(id), Some(edges)) = (attr(e, b"id"), edges) {
                            named.insert(id, edges);
                        }
                    }
                    _ => {}
                }
            }
            Event::End(ref e) => match e.name().as_ref() {
                b"vehicle" => in_vehicle = false,
                b"routeDistribution" => {
                    if let Some(d) = dist.take() {
                        let id = d.id.clone();
                        match (d.chosen(), id) {
                            (Some(edges), _) if in_vehicle => {
                                if let Some(v) = vehicles.last_mut() {
                                    v.1 = Some(edges);
                                }
                            }
                            (Some(edges), Some(id)) => {
                                named.insert(id, edges);
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    let mut out = RouteSet::new();
    for (id, inline, reference) in vehicles {
        let edges = inline.or_else(|| reference.and_then(|r| named.get(&r).cloned()));
        if let Some(edges) = edges.filter(|e| !e.is_empty()) {
            out.insert(id, edges);
        }
    }
    Ok(out)
}

/// Ids de `<vehicle>`, `<trip>` y `<flow>` en el orden del fichero.
pub fn vehicle_ids_in_order(xml: &[u8]) -> Result<Vec<String>, quick_xml::Error> {
    let mut r = Reader::from_reader(xml);
    r.trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    loop {
        match r.read_event_into(&mut buf)? {
            Event::Start(ref e) | Event::Empty(ref e)
                if matches!(e.name().as_ref(), b"vehicle" | b"trip" | b"flow") =>
            {
                if let Some(id) = attr(e, b"id") {
                    out.push(id);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}
