//! weights.rs
//!
//! Fichero de pesos por edge para duarouter (`--weight-files`).
//!
//! Formato meandata: un unico `<interval>` que cubre todo el horizonte de la
//! simulacion y un `<edge id traveltime>` por tramo afectado, con la
//! penalizacion de su severidad.

use anyhow::Context;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::types::AffectedEdgeMap;

const XSI_NS: &str = "http://www.w3.org/2001/XMLSchema-instance";
const MEANDATA_XSD: &str = "http://sumo.dlr.de/xsd/meandata_file.xsd";

#[derive(Clone, Debug)]
pub struct PenaltyWriter {
    pub path: PathBuf,
    pub horizon_s: u32,
}

pub fn render(affected: &AffectedEdgeMap, horizon_s: u32) -> Result<Vec<u8>, quick_xml::Error> {
    let mut w = Writer::new_with_indent(Vec::new(), b' ', 4);
    w.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;
    w.write_event(Event::Start(
        BytesStart::new("meandata")
            .with_attributes([("xmlns:xsi", XSI_NS), ("xsi:noNamespaceSchemaLocation", MEANDATA_XSD)]),
    ))?;

    let end = horizon_s.to_string();
    w.write_event(Event::Start(BytesStart::new("interval").with_attributes([("begin", "0"), ("end", end.as_str())])))?;
    for (edge, sev) in affected {
        let tt = sev.penalty().to_string();
        w.write_event(Event::Empty(
            BytesStart::new("edge").with_attributes([("id", edge.as_str()), ("traveltime", tt.as_str())]),
        ))?;
    }
    w.write_event(Event::End(BytesEnd::new("interval")))?;
    w.write_event(Event::End(BytesEnd::new("meandata")))?;
    Ok(w.into_inner())
}

impl PenaltyWriter {
    pub fn write(&self, affected: &AffectedEdgeMap) -> anyhow::Result<&Path> {
        let xml = render(affected, self.horizon_s).context("serializando pesos")?;
        std::fs::write(&self.path, xml).with_context(|| format!("escribiendo {}", self.path.display()))?;
        info!("pesos escritos en {} ({} edges)", self.path.display(), affected.len());
        Ok(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    #[test]
    fn one_interval_one_entry_per_edge() {
        let mut m = AffectedEdgeMap::new();
        m.insert("e1".into(), Severity::High);
        m.insert("e2".into(), Severity::Medium);
        m.insert("e3".into(), Severity::Low);
        let xml = String::from_utf8(render(&m, 3600).unwrap()).unwrap();

        assert_eq!(xml.matches("<interval").count(), 1);
        assert!(xml.contains(r#"<interval begin="0" end="3600">"#));
        assert!(xml.contains(r#"<edge id="e1" traveltime="100000"/>"#));
        assert!(xml.contains(r#"<edge id="e2" traveltime="10000"/>"#));
        assert!(xml.contains(r#"<edge id="e3" traveltime="2000"/>"#));
        assert!(xml.contains("meandata_file.xsd"));
    }

    #[test]
    fn edge_ids_are_escaped() {
        let mut m = AffectedEdgeMap::new();
        m.insert("a&b".into(), Severity::Low);
        let xml = String::from_utf8(render(&m, 10).unwrap()).unwrap();
        assert!(xml.contains(r#"id="a&amp;b""#));
    }

    #[test]
    fn write_to_disk() {
        let path = std::env::temp_dir().join(format!("weights-{}.xml", std::process::id()));
        let w = PenaltyWriter { path: path.clone(), horizon_s: 3600 };
        let mut m = AffectedEdgeMap::new();
        m.insert("-25009994#6".into(), Severity::High);
        w.write(&m).unwrap();
        let back = std::fs::read_to_string(&path).unwrap();
        assert!(back.contains(r##"id="-25009994#6""##));
        let _ = std::fs::remove_file(path);
    }
}
