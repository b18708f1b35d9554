//! Parsers y proveedores de datos externos: feeds HTTP y ficheros de SUMO.

pub mod incid;
pub mod net;
pub mod routes;
pub mod weather;
