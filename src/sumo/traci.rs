//! traci.rs
//!
//! Cliente TraCI minimo sobre TCP (big-endian).
//!
//! - Lanza `sumo` con `--remote-port` y reintenta la conexion
//! - Implementa `SimControl` con los comandos GET/SET que usa el controlador
//! - Cierra la sesion (CMD_CLOSE) y espera al proceso al soltarse
//!
//! Formato: mensaje = u32 longitud total + comandos; comando = u8 longitud
//! (0 + u32 si no cabe) + u8 id + contenido. Cada respuesta empieza por un
//! comando de estado (resultado + descripcion).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{SimControl, SimError};

// ===== Comandos =====
const CMD_SIMSTEP: u8 = 0x02;
const CMD_CLOSE: u8 = 0x7f;
const CMD_GET_LANE_VARIABLE: u8 = 0xa3;
const CMD_GET_VEHICLE_VARIABLE: u8 = 0xa4;
const CMD_GET_JUNCTION_VARIABLE: u8 = 0xa9;
const CMD_GET_EDGE_VARIABLE: u8 = 0xaa;
const CMD_GET_SIM_VARIABLE: u8 = 0xab;
const CMD_SET_VEHICLE_VARIABLE: u8 = 0xc4;
const CMD_SET_EDGE_VARIABLE: u8 = 0xca;
/// Las respuestas GET llevan id = comando + 0x10
const RESPONSE_OFFSET: u8 = 0x10;

// ===== Variables =====
const ID_LIST: u8 = 0x00;
const VAR_SPEED: u8 = 0x40;
const VAR_POSITION: u8 = 0x42;
const VAR_FRICTION: u8 = 0x37;
const VAR_LENGTH: u8 = 0x44;
const VAR_SHAPE: u8 = 0x4e;
const VAR_LANE_INDEX: u8 = 0x52;
const VAR_EDGES: u8 = 0x54;
const VAR_TIME: u8 = 0x66;
const FROM_JUNCTION: u8 = 0x7b;
const TO_JUNCTION: u8 = 0x7c;
const VAR_MIN_EXPECTED_VEHICLES: u8 = 0x7d;
const CMD_REROUTE_TRAVELTIME: u8 = 0x90;

// ===== Tipos =====
const POSITION_2D: u8 = 0x01;
const TYPE_POLYGON: u8 = 0x06;
const TYPE_INTEGER: u8 = 0x09;
const TYPE_DOUBLE: u8 = 0x0b;
const TYPE_STRING: u8 = 0x0c;
const TYPE_STRINGLIST: u8 = 0x0e;
const TYPE_COMPOUND: u8 = 0x0f;

const RTYPE_OK: u8 = 0x00;

const CONNECT_RETRIES: u32 = 50;
const CONNECT_WAIT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct LaunchOpts {
    pub binary: PathBuf,
    pub config: PathBuf,
    pub route_file: PathBuf,
    pub port: u16,
    pub end_s: u32,
}

impl LaunchOpts {
    fn args(&self) -> Vec<String> {
        vec![
            "-c".into(), self.config.display().to_string(),
            "--route-files".into(), self.route_file.display().to_string(),
            "--remote-port".into(), self.port.to_string(),
            "--step-length".into(), "1".into(),
            "--end".into(), self.end_s.to_string(),
            "--no-warnings".into(),
            "--no-step-log".into(),
        ]
    }
}

// -------------------------------
// Codificacion
// -------------------------------
pub(crate) fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

/// Un comando con su cabecera de longitud (corta o extendida).
pub(crate) fn encode_command(cmd: u8, content: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(content.len() + 6);
    let short = 1 + 1 + content.len();
    if short <= 255 {
        out.put_u8(short as u8);
    } else {
        out.put_u8(0);
        out.put_u32((1 + 4 + 1 + content.len()) as u32);
    }
    out.put_u8(cmd);
    out.put_slice(content);
    out
}

pub(crate) fn encode_message(command: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(command.len() + 4);
    out.put_u32((command.len() + 4) as u32);
    out.put_slice(command);
    out
}

fn get_content(var: u8, id: &str) -> BytesMut {
    let mut c = BytesMut::new();
    c.put_u8(var);
    put_string(&mut c, id);
    c
}

/// SET friccion de edge: variable + id + double tipado.
fn friction_content(edge: &str, friction: f64) -> BytesMut {
    let mut c = get_content(VAR_FRICTION, edge);
    c.put_u8(TYPE_DOUBLE);
    c.put_f64(friction);
    c
}

// -------------------------------
// Decodificacion
// -------------------------------
pub(crate) struct Cursor {
    buf: Bytes,
}

impl Cursor {
    pub(crate) fn new(buf: Bytes) -> Self { Self { buf } }

    fn need(&self, n: usize) -> Result<(), SimError> {
        if self.buf.remaining() < n {
            return Err(SimError::Protocol(format!("respuesta truncada: faltan {} bytes", n - self.buf.remaining())));
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, SimError> { self.need(1)?; Ok(self.buf.get_u8()) }
    fn i32(&mut self) -> Result<i32, SimError> { self.need(4)?; Ok(self.buf.get_i32()) }
    fn u32(&mut self) -> Result<u32, SimError> { self.need(4)?; Ok(self.buf.get_u32()) }
    fn f64(&mut self) -> Result<f64, SimError> { self.need(8)?; Ok(self.buf.get_f64()) }

    fn string(&mut self) -> Result<String, SimError> {
        let n = self.u32()? as usize;
        self.need(n)?;
        let raw = self.buf.split_to(n);
        String::from_utf8(raw.to_vec()).map_err(|e| SimError::Protocol(e.to_string()))
    }

    /// Cabecera de comando: devuelve el id. La longitud no se usa, el
    /// contenido se consume campo a campo.
    fn command_header(&mut self) -> Result<u8, SimError> {
        if self.u8()? == 0 { self.u32()?; }
        self.u8()
    }

    pub(crate) fn status(&mut self) -> Result<(), SimError> {
        let cmd = self.command_header()?;
        let result = self.u8()?;
        let desc = self.string()?;
        if result != RTYPE_OK {
            return Err(SimError::Command(format!("0x{cmd:02x}: {desc}")));
        }
        Ok(())
    }

    /// Tras el estado de un GET: cabecera de respuesta y tipo del valor.
    pub(crate) fn get_response(&mut self, domain: u8, var: u8) -> Result<u8, SimError> {
        let cmd = self.command_header()?;
        if cmd != domain + RESPONSE_OFFSET {
            return Err(SimError::Protocol(format!("respuesta 0x{cmd:02x} a comando 0x{domain:02x}")));
        }
        let v = self.u8()?;
        if v != var {
            return Err(SimError::Protocol(format!("variable 0x{v:02x}, esperaba 0x{var:02x}")));
        }
        self.string()?;
        self.u8()
    }

    pub(crate) fn value_f64(&mut self) -> Result<f64, SimError> { self.f64() }
    pub(crate) fn value_i32(&mut self) -> Result<i32, SimError> { self.i32() }
    pub(crate) fn value_string(&mut self) -> Result<String, SimError> { self.string() }

    pub(crate) fn value_string_list(&mut self) -> Result<Vec<String>, SimError> {
        let n = self.u32()? as usize;
        (0..n).map(|_| self.string()).collect()
    }

    pub(crate) fn value_polygon(&mut self) -> Result<Vec<(f64, f64)>, SimError> {
        let mut n = self.u8()? as usize;
        // formas de mas de 255 puntos: 0 + entero
        if n == 0 && self.buf.remaining() >= 4 {
            n = self.i32()?.max(0) as usize;
        }
        (0..n)
            .map(|_| -> Result<(f64, f64), SimError> { Ok((self.f64()?, self.f64()?)) })
            .collect()
    }

    pub(crate) fn value_position(&mut self) -> Result<(f64, f64), SimError> {
        Ok((self.f64()?, self.f64()?))
    }
}

// -------------------------------
// Cliente
// -------------------------------
pub struct TraciClient {
    stream: TcpStream,
    child: Option<Child>,
    closed: bool,
}

impl TraciClient {
    pub fn connect(host: &str, port: u16) -> Result<Self, SimError> {
        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        Ok(Self { stream, child: None, closed: false })
    }

    /// Lanza SUMO y espera a que acepte la conexion TraCI.
    pub async fn launch(opts: &LaunchOpts) -> Result<Self, SimError> {
        info!("lanzando {} en puerto {}", opts.binary.display(), opts.port);
        let mut child = Command::new(&opts.binary)
            .args(opts.args())
            .stdout(Stdio::null())
            .spawn()?;

        for attempt in 0..CONNECT_RETRIES {
            if let Some(status) = child.try_wait()? {
                return Err(SimError::NotRunning(format!("SUMO termino antes de conectar ({status})")));
            }
            match Self::connect("127.0.0.1", opts.port) {
                Ok(mut c) => {
                    c.child = Some(child);
                    let t = c.time()?;
                    info!("conexion TraCI establecida (t={t})");
                    return Ok(c);
                }
                Err(e) => debug!("intento {attempt}: {e}"),
            }
            tokio::time::sleep(CONNECT_WAIT).await;
        }
        let _ = child.kill();
        let _ = child.wait();
        Err(SimError::NotRunning(format!("sin respuesta en el puerto {}", opts.port)))
    }

    fn send(&mut self, cmd: u8, content: &[u8]) -> Result<Cursor, SimError> {
        if self.closed {
            return Err(SimError::NotRunning("sesion cerrada".into()));
        }
        let msg = encode_message(&encode_command(cmd, content));
        self.stream.write_all(&msg)?;

        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let total = u32::from_be_bytes(len) as usize;
        if total < 4 {
            return Err(SimError::Protocol(format!("longitud de mensaje {total}")));
        }
        let mut body = vec![0u8; total - 4];
        self.stream.read_exact(&mut body)?;

        let mut cur = Cursor::new(Bytes::from(body));
        cur.status()?;
        Ok(cur)
    }

    fn get(&mut self, domain: u8, var: u8, id: &str, ty: u8) -> Result<Cursor, SimError> {
        let mut cur = self.send(domain, &get_content(var, id))?;
        let got = cur.get_response(domain, var)?;
        if got != ty {
            return Err(SimError::Protocol(format!("tipo 0x{got:02x} para var 0x{var:02x}, esperaba 0x{ty:02x}")));
        }
        Ok(cur)
    }

    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if !self.closed {
            if let Err(e) = self.send(CMD_CLOSE, &[]) {
                debug!("cierre TraCI: {e}");
            }
            self.closed = true;
        }
        if let Some(mut c) = self.child.take() {
            if let Ok(None) = c.try_wait() {
                std::thread::sleep(Duration::from_millis(100));
                if let Ok(None) = c.try_wait() {
                    warn!("SUMO sigue vivo tras el cierre, se termina el proceso");
                    let _ = c.kill();
                }
            }
            let _ = c.wait();
        }
    }
}

impl Drop for TraciClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SimControl for TraciClient {
    fn lane_count(&mut self, edge: &str) -> Result<usize, SimError> {
        let n = self.get(CMD_GET_EDGE_VARIABLE, VAR_LANE_INDEX, edge, TYPE_INTEGER)?.value_i32()?;
        Ok(n.max(0) as usize)
    }

    fn lane_shape(&mut self, lane: &str) -> Result<Vec<(f64, f64)>, SimError> {
        self.get(CMD_GET_LANE_VARIABLE, VAR_SHAPE, lane, TYPE_POLYGON)?.value_polygon()
    }

    fn edge_shape(&mut self, edge: &str) -> Result<Vec<(f64, f64)>, SimError> {
        self.get(CMD_GET_EDGE_VARIABLE, VAR_SHAPE, edge, TYPE_POLYGON)?.value_polygon()
    }

    /// TraCI no expone la longitud del edge; se usa la del carril 0.
    fn edge_length(&mut self, edge: &str) -> Result<f64, SimError> {
        self.get(CMD_GET_LANE_VARIABLE, VAR_LENGTH, &format!("{edge}_0"), TYPE_DOUBLE)?.value_f64()
    }

    fn edge_junctions(&mut self, edge: &str) -> Result<(String, String), SimError> {
        let from = self.get(CMD_GET_EDGE_VARIABLE, FROM_JUNCTION, edge, TYPE_STRING)?.value_string()?;
        let to = self.get(CMD_GET_EDGE_VARIABLE, TO_JUNCTION, edge, TYPE_STRING)?.value_string()?;
        Ok((from, to))
    }

    fn junction_position(&mut self, junction: &str) -> Result<(f64, f64), SimError> {
        self.get(CMD_GET_JUNCTION_VARIABLE, VAR_POSITION, junction, POSITION_2D)?.value_position()
    }

    fn set_edge_friction(&mut self, edge: &str, friction: f64) -> Result<(), SimError> {
        self.send(CMD_SET_EDGE_VARIABLE, &friction_content(edge, friction)).map(|_| ())
    }

    fn vehicle_ids(&mut self) -> Result<Vec<String>, SimError> {
        self.get(CMD_GET_VEHICLE_VARIABLE, ID_LIST, "", TYPE_STRINGLIST)?.value_string_list()
    }

    fn vehicle_route(&mut self, vehicle: &str) -> Result<Vec<String>, SimError> {
        self.get(CMD_GET_VEHICLE_VARIABLE, VAR_EDGES, vehicle, TYPE_STRINGLIST)?.value_string_list()
    }

    fn vehicle_speed(&mut self, vehicle: &str) -> Result<f64, SimError> {
        self.get(CMD_GET_VEHICLE_VARIABLE, VAR_SPEED, vehicle, TYPE_DOUBLE)?.value_f64()
    }

    fn reroute_by_travel_time(&mut self, vehicle: &str) -> Result<(), SimError> {
        let mut c = get_content(CMD_REROUTE_TRAVELTIME, vehicle);
        c.put_u8(TYPE_COMPOUND);
        c.put_i32(0);
        self.send(CMD_SET_VEHICLE_VARIABLE, &c).map(|_| ())
    }

    fn step(&mut self) -> Result<(), SimError> {
        let mut c = BytesMut::new();
        c.put_f64(0.0);
        let mut cur = self.send(CMD_SIMSTEP, &c)?;
        // numero de resultados de suscripcion; no usamos suscripciones
        let subs = cur.value_i32()?;
        if subs != 0 {
            debug!("{subs} resultados de suscripcion ignorados");
        }
        Ok(())
    }

    fn time(&mut self) -> Result<f64, SimError> {
        self.get(CMD_GET_SIM_VARIABLE, VAR_TIME, "", TYPE_DOUBLE)?.value_f64()
    }

    fn pending_vehicles(&mut self) -> Result<usize, SimError> {
        let n = self.get(CMD_GET_SIM_VARIABLE, VAR_MIN_EXPECTED_VEHICLES, "", TYPE_INTEGER)?.value_i32()?;
        Ok(n.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_ok(cmd: u8) -> BytesMut {
        let mut c = BytesMut::new();
        c.put_u8(RTYPE_OK);
        put_string(&mut c, "");
        encode_command(cmd, &c)
    }

    #[test]
    fn get_command_layout() {
        let msg = encode_message(&encode_command(CMD_GET_VEHICLE_VARIABLE, &get_content(VAR_SPEED, "veh0")));
        // 4 total + 1 len + 1 cmd + 1 var + 4 strlen + 4 chars
        assert_eq!(msg.len(), 15);
        assert_eq!(&msg[..4], &15u32.to_be_bytes());
        assert_eq!(msg[4], 11);
        assert_eq!(msg[5], CMD_GET_VEHICLE_VARIABLE);
        assert_eq!(msg[6], VAR_SPEED);
        assert_eq!(&msg[7..11], &4u32.to_be_bytes());
        assert_eq!(&msg[11..], b"veh0");
    }

    #[test]
    fn set_friction_layout() {
        let cmd = encode_command(CMD_SET_EDGE_VARIABLE, &friction_content("e1", 0.5));
        // 1 len + 1 cmd + 1 var + 4 strlen + 2 chars + 1 tipo + 8 double
        assert_eq!(cmd.len(), 18);
        assert_eq!(&cmd[..3], &[18, 0xca, 0x37]);
        assert_eq!(&cmd[3..7], &2u32.to_be_bytes());
        assert_eq!(&cmd[7..9], b"e1");
        assert_eq!(cmd[9], TYPE_DOUBLE);
        assert_eq!(&cmd[10..], &0.5f64.to_be_bytes());
    }

    #[test]
    fn long_commands_use_extended_length() {
        let content = vec![7u8; 300];
        let cmd = encode_command(CMD_SET_EDGE_VARIABLE, &content);
        assert_eq!(cmd[0], 0);
        assert_eq!(&cmd[1..5], &306u32.to_be_bytes());
        assert_eq!(cmd[5], CMD_SET_EDGE_VARIABLE);
        assert_eq!(cmd.len(), 306);
    }

    #[test]
    fn decodes_string_list_response() {
        let mut buf = status_ok(CMD_GET_VEHICLE_VARIABLE);
        let mut r = BytesMut::new();
        r.put_u8(ID_LIST);
        put_string(&mut r, "");
        r.put_u8(TYPE_STRINGLIST);
        r.put_u32(2);
        put_string(&mut r, "vehicle_1");
        put_string(&mut r, "vehicle_2");
        buf.extend_from_slice(&encode_command(CMD_GET_VEHICLE_VARIABLE + RESPONSE_OFFSET, &r));

        let mut cur = Cursor::new(buf.freeze());
        cur.status().unwrap();
        assert_eq!(cur.get_response(CMD_GET_VEHICLE_VARIABLE, ID_LIST).unwrap(), TYPE_STRINGLIST);
        assert_eq!(cur.value_string_list().unwrap(), vec!["vehicle_1", "vehicle_2"]);
    }

    #[test]
    fn decodes_polygon() {
        let mut r = BytesMut::new();
        r.put_u8(2);
        for v in [1.0, 2.0, 3.0, 4.5] { r.put_f64(v); }
        let mut cur = Cursor::new(r.freeze());
        assert_eq!(cur.value_polygon().unwrap(), vec![(1.0, 2.0), (3.0, 4.5)]);
    }

    #[test]
    fn error_status_becomes_command_error() {
        let mut c = BytesMut::new();
        c.put_u8(0xff);
        put_string(&mut c, "Vehicle 'x' is not known");
        let mut cur = Cursor::new(encode_command(CMD_GET_VEHICLE_VARIABLE, &c).freeze());
        match cur.status() {
            Err(SimError::Command(m)) => assert!(m.contains("not known")),
            other => panic!("esperaba error de comando, hubo {other:?}"),
        }
    }

    #[test]
    fn truncated_response_is_protocol_error() {
        let mut cur = Cursor::new(Bytes::from_static(&[0, 0, 0, 9, b'a']));
        assert!(matches!(cur.value_string(), Err(SimError::Protocol(_))));
    }
}
