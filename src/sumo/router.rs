//! router.rs
//!
//! `Router` sobre el binario `duarouter` de SUMO.
//!
//! - `duarouter -n red -r viajes -o salida [--weight-files pesos] --ignore-errors --repair`
//! - La salida se vuelve a leer con `data::routes` para obtener el `RouteSet`
//! - Un estado distinto de cero o una salida ilegible es error; el llamador decide
//! - duarouter escribe en un fichero de trabajo hermano; `output` solo se
//!   sustituye si el proceso acaba bien y la salida trae al menos una ruta

use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use super::{Router, RouterError};
use crate::data::routes::parse_routes_xml;
use crate::types::RouteSet;

#[derive(Clone, Debug)]
pub struct Duarouter {
    pub binary: PathBuf,
    pub net: PathBuf,
    pub trips: PathBuf,
    pub output: PathBuf,
}

impl Duarouter {
    /// `routed.xml` -> `routed.partial.xml`, en el mismo directorio.
    pub(crate) fn staging(&self) -> PathBuf {
        self.output.with_extension("partial.xml")
    }

    pub(crate) fn args(&self, out: &Path, weights: Option<&Path>) -> Vec<String> {
        let mut a = vec![
            "-n".to_string(), self.net.display().to_string(),
            "-r".to_string(), self.trips.display().to_string(),
            "-o".to_string(), out.display().to_string(),
        ];
        if let Some(w) = weights {
            a.push("--weight-files".into());
            a.push(w.display().to_string());
        }
        a.push("--ignore-errors".into());
        a.push("--repair".into());
        a
    }

    fn run(&self, out: &Path, weights: Option<&Path>) -> Result<RouteSet, RouterError> {
        let args = self.args(out, weights);
        debug!("{} {}", self.binary.display(), args.join(" "));
        let proc = Command::new(&self.binary).args(&args).output()?;
        if !proc.status.success() {
            let stderr = String::from_utf8_lossy(&proc.stderr).trim().to_string();
            return Err(RouterError::Failed { code: proc.status.code(), stderr });
        }
        let xml = std::fs::read(out).map_err(|e| RouterError::Output(format!("{}: {e}", out.display())))?;
        let routes = parse_routes_xml(&xml).map_err(|e| RouterError::Output(e.to_string()))?;
        info!(
            "duarouter: {} rutas{}",
            routes.len(),
            if weights.is_some() { " (con penalizaciones)" } else { "" }
        );
        Ok(routes)
    }
}

impl Router for Duarouter {
    fn route(&self, weights: Option<&Path>) -> Result<RouteSet, RouterError> {
        let staging = self.staging();
        let res = self.run(&staging, weights);
        if !matches!(res, Ok(ref r) if !r.is_empty()) {
            // el fichero que carga SUMO queda intacto
            let _ = std::fs::remove_file(&staging);
            return res;
        }
        std::fs::rename(&staging, &self.output).map_err(|e| {
            RouterError::Output(format!("{} -> {}: {e}", staging.display(), self.output.display()))
        })?;
        res
    }
}
