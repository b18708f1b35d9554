mod correlate; mod fetch; mod geoindex; mod reroute; mod sim_loop; mod types; mod utm; mod weights;
mod data;
mod sumo;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{env, time::Duration};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use data::incid::IncidentFeed;
use data::net::NetLocation;
use data::weather::WeatherFeed;
use fetch::HttpFetcher;
use geoindex::GeoCache;
use reroute::RerouteOrchestrator;
use sim_loop::{LoopCfg, SimulationLoop, WeatherPlan};
use sumo::router::Duarouter;
use sumo::traci::{LaunchOpts, TraciClient};
use sumo::Router;
use types::{AppCfg, Category, FrictionMode, RunReport, WeatherReading};
use utm::CoordinateTransformer;
use weights::PenaltyWriter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Logs
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let app_cfg = app_cfg_from_env();
    if let Some(home) = &app_cfg.sumo_home {
        info!("SUMO_HOME = {}", home.display());
    }

    // Entradas obligatorias
    if !app_cfg.net_file.exists() {
        bail!("no existe la red {}", app_cfg.net_file.display());
    }
    if !app_cfg.trip_file.exists() {
        bail!("no existe el fichero de viajes {}", app_cfg.trip_file.display());
    }
    if !app_cfg.sumo_cfg.exists() {
        bail!("no existe la configuracion {}", app_cfg.sumo_cfg.display());
    }

    let tf = transformer_for(&app_cfg);

    // Paso 1: enrutado inicial sin penalizaciones
    let router = Duarouter {
        binary: app_cfg.duarouter_bin.clone(),
        net: app_cfg.net_file.clone(),
        trips: app_cfg.trip_file.clone(),
        output: app_cfg.routed_file.clone(),
    };
    let mut routes = router.route(None).context("enrutado inicial con duarouter")?;
    if routes.is_empty() {
        bail!("duarouter no produjo ninguna ruta a partir de {}", app_cfg.trip_file.display());
    }
    info!("rutas establecidas para {} vehiculos", routes.len());

    let tracked = if app_cfg.tracked_vehicles.is_empty() {
        // los dos primeros viajes del fichero que duarouter pudo enrutar
        let xml = std::fs::read(&app_cfg.trip_file)
            .with_context(|| format!("leyendo {}", app_cfg.trip_file.display()))?;
        data::routes::vehicle_ids_in_order(&xml)
            .context("ids de vehiculos del fichero de viajes")?
            .into_iter()
            .filter(|v| routes.contains_key(v))
            .take(2)
            .collect()
    } else {
        app_cfg.tracked_vehicles.clone()
    };

    let fetcher = HttpFetcher::new()?;
    let incidents_feed = IncidentFeed {
        source: &fetcher,
        base_url: app_cfg.incident_url.clone(),
        timeout: Duration::from_secs(app_cfg.t_incid_timeout_s),
        transformer: tf,
    };
    let weather_feed = WeatherFeed {
        source: &fetcher,
        base_url: app_cfg.weather_url.clone(),
        lat: app_cfg.weather_lat,
        lon: app_cfg.weather_lon,
        horizon_hours: app_cfg.forecast_hours,
        timeout: Duration::from_secs(app_cfg.t_weather_timeout_s),
    };

    let launch = LaunchOpts {
        binary: app_cfg.sumo_bin.clone(),
        config: app_cfg.sumo_cfg.clone(),
        route_file: app_cfg.routed_file.clone(),
        port: app_cfg.traci_port,
        end_s: app_cfg.sim_end_s,
    };

    // Paso 2: sesion temporal para la geometria de los tramos
    let mut cache = GeoCache::default();
    {
        let mut tmp = TraciClient::launch(&launch).await.context("sesion TraCI temporal")?;
        if cache.rebuild(&mut tmp, &routes).is_empty() {
            warn!("ningun tramo con geometria: no se podran correlacionar incidencias");
        }
        tmp.close();
        info!("sesion temporal cerrada");
    }

    // Paso 3: incidencias contra las rutas y re-enrutado completo si hace falta
    let mut orch = RerouteOrchestrator::new(
        router,
        PenaltyWriter { path: app_cfg.weights_file.clone(), horizon_s: app_cfg.sim_end_s },
    );
    let incidents = incidents_feed.poll(&app_cfg.areas, &app_cfg.categories).await;
    let replaced = match cache.current() {
        Some(geo) => orch.startup(&incidents, geo, &tf, &mut routes),
        None => false,
    };
    if replaced {
        cache.invalidate();
    }

    // Paso 4: clima
    let (initial, plan) = match &app_cfg.friction_mode {
        FrictionMode::LiveWeather => {
            let now = Utc::now();
            let initial = weather_feed.current().await;
            (initial, WeatherPlan::Forecast(weather_feed.forecast(now).await))
        }
        FrictionMode::FixedScenario { friction, label } => {
            info!("modo escenario fijo: {label} (friccion {friction})");
            (WeatherReading { friction: *friction, code: None, label: label.clone() }, WeatherPlan::Fixed)
        }
    };

    // Paso 5: simulacion principal
    let mut sim = TraciClient::launch(&launch).await.context("sesion TraCI principal")?;
    cache.ensure(&mut sim, &routes);

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("senal de salida recibida");
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let sim_loop = SimulationLoop {
        cfg: LoopCfg {
            incident_check_s: app_cfg.incident_check_s,
            weather_log_s: app_cfg.weather_log_s,
            tracked,
            areas: app_cfg.areas.clone(),
            categories: app_cfg.categories.clone(),
        },
        routes,
        cache,
        tf,
        plan,
        anchor: Utc::now(),
        initial,
    };
    let report = sim_loop.run(&mut sim, &mut orch, &incidents_feed, &cancel).await;
    sim.close();

    log_report(&report);
    if let Some(out) = &app_cfg.telemetry_out {
        write_report(out, &report)?;
    }
    Ok(())
}

fn app_cfg_from_env() -> AppCfg {
    let mut c = AppCfg::default();
    if let Ok(v) = env::var("SUMO_HOME") {
        let bin = PathBuf::from(&v).join("bin");
        c.sumo_bin = bin.join("sumo");
        c.duarouter_bin = bin.join("duarouter");
        c.sumo_home = Some(v.into());
    }
    if let Ok(v) = env::var("SUMO_BIN") { c.sumo_bin = v.into(); }
    if let Ok(v) = env::var("DUAROUTER_BIN") { c.duarouter_bin = v.into(); }
    if let Ok(v) = env::var("SUMO_CFG") { c.sumo_cfg = v.into(); }
    if let Ok(v) = env::var("NET_FILE") { c.net_file = v.into(); }
    if let Ok(v) = env::var("TRIP_FILE") { c.trip_file = v.into(); }
    if let Ok(v) = env::var("ROUTED_FILE") { c.routed_file = v.into(); }
    if let Ok(v) = env::var("WEIGHTS_FILE") { c.weights_file = v.into(); }
    if let Ok(v) = env::var("TRACI_PORT") { c.traci_port = v.parse().unwrap_or(c.traci_port); }
    if let Ok(v) = env::var("SIM_END_S") { c.sim_end_s = v.parse().unwrap_or(c.sim_end_s); }

    if let Ok(v) = env::var("WEATHER_URL") { c.weather_url = v; }
    if let Ok(v) = env::var("WEATHER_LAT") { c.weather_lat = v.parse().unwrap_or(c.weather_lat); }
    if let Ok(v) = env::var("WEATHER_LON") { c.weather_lon = v.parse().unwrap_or(c.weather_lon); }
    if let Ok(v) = env::var("FORECAST_HOURS") { c.forecast_hours = v.parse().unwrap_or(c.forecast_hours); }
    if let Ok(v) = env::var("T_WEATHER_S") { c.t_weather_timeout_s = v.parse().unwrap_or(c.t_weather_timeout_s); }
    if let Ok(v) = env::var("FRICTION_MODE") {
        c.friction_mode = match v.trim().to_ascii_lowercase().as_str() {
            "fixed" | "test" => {
                FrictionMode::storm_scenario(env::var("FIXED_FRICTION").ok().and_then(|f| f.parse().ok()))
            }
            _ => FrictionMode::LiveWeather,
        };
    }

    if let Ok(v) = env::var("INCIDENT_URL") { c.incident_url = v; }
    if let Ok(v) = env::var("AREAS") { c.areas = split_list(&v); }
    if let Ok(v) = env::var("CATEGORIES") {
        let cats: Vec<Category> = split_list(&v).iter().filter_map(|s| Category::parse(s)).collect();
        if !cats.is_empty() { c.categories = cats; }
    }
    if let Ok(v) = env::var("T_INCID_S") { c.t_incid_timeout_s = v.parse().unwrap_or(c.t_incid_timeout_s); }
    if let Ok(v) = env::var("INCIDENT_CHECK_S") { c.incident_check_s = v.parse().unwrap_or(c.incident_check_s); }
    if let Ok(v) = env::var("WEATHER_LOG_S") { c.weather_log_s = v.parse().unwrap_or(c.weather_log_s); }

    if let Ok(v) = env::var("UTM_ZONE") { c.utm_zone = v.parse().ok(); }
    if let Ok(v) = env::var("UTM_SOUTH") { c.utm_south = matches!(v.as_str(), "1" | "true" | "yes"); }
    if let Ok(v) = env::var("NET_OFFSET") {
        c.net_offset = v.split_once(',').and_then(|(x, y)| Some((x.trim().parse().ok()?, y.trim().parse().ok()?)));
    }
    if let Ok(v) = env::var("PROJECTION") { c.projection_enabled = !v.eq_ignore_ascii_case("none"); }

    if let Ok(v) = env::var("TRACKED_VEHICLES") { c.tracked_vehicles = split_list(&v); }
    if let Ok(v) = env::var("TELEMETRY_OUT") { c.telemetry_out = Some(v.into()); }
    c
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',').map(str::trim).filter(|x| !x.is_empty()).map(str::to_string).collect()
}

/// Proyeccion alineada con la red: env primero, luego `<location>` del net.xml.
fn transformer_for(c: &AppCfg) -> CoordinateTransformer {
    if !c.projection_enabled {
        warn!("proyeccion desactivada: deteccion de incidencias en modo GPS degradado");
        return CoordinateTransformer::unavailable();
    }
    let loc = match data::net::read_location(&c.net_file) {
        Ok(l) => l.unwrap_or_default(),
        Err(e) => {
            warn!("no se pudo leer <location> de la red: {e:#}");
            Default::default()
        }
    };
    // lo fijado por entorno manda sobre lo declarado en la red
    let merged = NetLocation {
        net_offset: c.net_offset.or(loc.net_offset),
        zone: c.utm_zone.or(loc.zone),
        south: c.utm_south || loc.south,
    };
    let Some(proj) = merged.projection() else {
        warn!("la red no declara proyeccion UTM: deteccion de incidencias en modo GPS degradado");
        return CoordinateTransformer::unavailable();
    };
    info!("proyeccion UTM zona {}{} offset {:?}", proj.zone, if proj.south { "S" } else { "N" }, proj.offset);
    CoordinateTransformer::new(proj)
}

fn log_report(r: &RunReport) {
    info!("==== resumen de la simulacion ====");
    info!("duracion: {}s ({:.1} min){}", r.duration_s as i64, r.duration_s / 60.0, if r.cancelled { " [cancelada]" } else { "" });
    info!(
        "periodo real simulado: {} a {} ({})",
        r.sim_start_utc.format("%H:%M:%S"),
        r.sim_end_utc.format("%H:%M:%S"),
        r.sim_start_utc.format("%Y-%m-%d")
    );
    for v in &r.vehicles {
        info!("{}: media {:.1} km/h, max {:.1} km/h", v.vehicle, v.avg_kmh, v.max_kmh);
    }
    info!("cambios de clima: {}", r.weather_changes);
    info!("incidencias procesadas: {}", r.incidents_processed);
    info!("vehiculos re-enrutados: {}", r.vehicles_rerouted);
}

fn write_report(path: &Path, r: &RunReport) -> Result<()> {
    let f = std::fs::File::create(path).with_context(|| format!("creando {}", path.display()))?;
    serde_json::to_writer_pretty(std::io::BufWriter::new(f), r).context("serializando informe")?;
    info!("informe escrito en {}", path.display());
    Ok(())
}
