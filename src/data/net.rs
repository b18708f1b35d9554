//! net.rs
//!
//! Lee el elemento `<location>` de la red SUMO para alinear la proyeccion.
//!
//! `<location netOffset="-604763.28,-5804837.31" projParameter="+proj=utm +zone=32 ..."/>`
//! Solo interesa la primera aparicion; el resto del fichero no se recorre.

use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::Path;

use crate::utm::UtmProjection;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NetLocation {
    pub net_offset: Option<(f64, f64)>,
    pub zone: Option<u8>,
    pub south: bool,
}

impl NetLocation {
    pub fn projection(&self) -> Option<UtmProjection> {
        Some(UtmProjection { zone: self.zone?, south: self.south, offset: self.net_offset.unwrap_or((0.0, 0.0)) })
    }
}

fn parse_offset(s: &str) -> Option<(f64, f64)> {
    let (x, y) = s.split_once(',')?;
    Some((x.trim().parse().ok()?, y.trim().parse().ok()?))
}

/// `+proj=utm +zone=32 +south ...`: zona y hemisferio. Otras proyecciones no se soportan.
fn parse_proj(s: &str) -> (Option<u8>, bool) {
    if !s.split_whitespace().any(|t| t == "+proj=utm") {
        return (None, false);
    }
    let zone = s
        .split_whitespace()
        .find_map(|t| t.strip_prefix("+zone="))
        .and_then(|z| z.parse::<u8>().ok())
        .filter(|z| (1..=60).contains(z));
    (zone, s.split_whitespace().any(|t| t == "+south"))
}

pub fn parse_location(xml: &[u8]) -> Result<Option<NetLocation>, quick_xml::Error> {
    let mut r = Reader::from_reader(xml);
    r.trim_text(true);
    let mut buf = Vec::new();

    loop {
        match r.read_event_into(&mut buf)? {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"location" => {
                let mut loc = NetLocation::default();
                for a in e.attributes().flatten() {
                    let v = a.unescape_value()?.into_owned();
                    match a.key.as_ref() {
                        b"netOffset" => loc.net_offset = parse_offset(&v),
                        b"projParameter" => (loc.zone, loc.south) = parse_proj(&v),
                        _ => {}
                    }
                }
                return Ok(Some(loc));
            }
            // el <location> va antes que los edges; si llega un edge no hay
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"edge" => return Ok(None),
            Event::Eof => return Ok(None),
            _ => {}
        }
        buf.clear();
    }
}

pub fn read_location(path: &Path) -> anyhow::Result<Option<NetLocation>> {
    use anyhow::Context;
    let xml = std::fs::read(path).with_context(|| format!("leyendo {}", path.display()))?;
    parse_location(&xml).with_context(|| format!("XML de red invalido en {}", path.display()))
}
