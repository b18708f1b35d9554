//! weather.rs
//!
//! Clima de Open-Meteo -> coeficiente de friccion para SUMO
//!
//! - `current()` da la lectura instantanea (por defecto: despejado, 1.0)
//! - `forecast()` da la serie de 15 min; si falla se sintetiza una serie
//!   despejada anclada a "ahora" para que el bucle siempre tenga entrada valida
//! - `resolve()` elige la muestra vigente para un instante simulado
//!
//! La tabla codigo WMO -> (etiqueta, friccion) es estatica.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};

use crate::fetch::{FeedError, FeedSource};
use crate::types::{WeatherReading, WeatherSample};

/// Granularidad del pronostico (minutely_15)
pub const FORECAST_STEP_MIN: i64 = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WeatherCode {
    ClearSky,
    MainlyClear,
    PartlyCloudy,
    Overcast,
    Fog,
    DenseFog,
    LightDrizzle,
    ModerateDrizzle,
    DenseDrizzle,
    LightRain,
    ModerateRain,
    HeavyRain,
    LightSnow,
    ModerateSnow,
    HeavySnow,
    SnowGrains,
    LightRainShowers,
    ModerateRainShowers,
    ViolentRainShowers,
    LightSnowShowers,
    HeavySnowShowers,
    Thunderstorm,
    ThunderstormHail,
    ThunderstormHeavyHail,
}

impl WeatherCode {
    pub const CLEAR: i32 = 0;

    pub fn from_wmo(code: i32) -> Option<Self> {
        use WeatherCode::*;
        Some(match code {
            0 => ClearSky,
            1 => MainlyClear,
            2 => PartlyCloudy,
            3 => Overcast,
            45 => Fog,
            48 => DenseFog,
            51 => LightDrizzle,
            53 => ModerateDrizzle,
            55 => DenseDrizzle,
            61 => LightRain,
            63 => ModerateRain,
            65 => HeavyRain,
            71 => LightSnow,
            73 => ModerateSnow,
            75 => HeavySnow,
            77 => SnowGrains,
            80 => LightRainShowers,
            81 => ModerateRainShowers,
            82 => ViolentRainShowers,
            85 => LightSnowShowers,
            86 => HeavySnowShowers,
            95 => Thunderstorm,
            96 => ThunderstormHail,
            99 => ThunderstormHeavyHail,
            _ => return None,
        })
    }

    pub fn label(self) -> &'static str {
        use WeatherCode::*;
        match self {
            ClearSky => "Clear sky",
            MainlyClear => "Mainly clear",
            PartlyCloudy => "Partly cloudy",
            Overcast => "Overcast",
            Fog => "Fog",
            DenseFog => "Dense fog",
            LightDrizzle => "Light drizzle",
            ModerateDrizzle => "Moderate drizzle",
            DenseDrizzle => "Dense drizzle",
            LightRain => "Light rain",
            ModerateRain => "Moderate rain",
            HeavyRain => "Heavy rain",
            LightSnow => "Light snow",
            ModerateSnow => "Moderate snow",
            HeavySnow => "Heavy snow",
            SnowGrains => "Snow grains",
            LightRainShowers => "Light rain showers",
            ModerateRainShowers => "Moderate rain showers",
            ViolentRainShowers => "Violent rain showers",
            LightSnowShowers => "Light snow showers",
            HeavySnowShowers => "Heavy snow showers",
            Thunderstorm => "Thunderstorm",
            ThunderstormHail => "Thunderstorm with hail",
            ThunderstormHeavyHail => "Thunderstorm with heavy hail",
        }
    }

    pub fn friction(self) -> f64 {
        use WeatherCode::*;
        match self {
            ClearSky => 1.0,
            MainlyClear => 0.95,
            PartlyCloudy => 0.9,
            Overcast => 0.85,
            Fog => 0.8,
            DenseFog => 0.65,
            LightDrizzle => 0.75,
            ModerateDrizzle => 0.7,
            DenseDrizzle => 0.65,
            LightRain => 0.7,
            ModerateRain => 0.6,
            HeavyRain => 0.5,
            LightSnow => 0.55,
            ModerateSnow => 0.45,
            HeavySnow => 0.35,
            SnowGrains => 0.5,
            LightRainShowers => 0.65,
            ModerateRainShowers => 0.55,
            ViolentRainShowers => 0.4,
            LightSnowShowers => 0.5,
            HeavySnowShowers => 0.3,
            Thunderstorm => 0.45,
            ThunderstormHail => 0.35,
            ThunderstormHeavyHail => 0.25,
        }
    }
}

/// (etiqueta, friccion); codigos sin mapear -> ("Unknown", 1.0)
pub fn friction_for(code: i32) -> (&'static str, f64) {
    WeatherCode::from_wmo(code)
        .map(|w| (w.label(), w.friction()))
        .unwrap_or(("Unknown", 1.0))
}

pub fn reading_for(code: i32) -> WeatherReading {
    let (label, friction) = friction_for(code);
    WeatherReading { friction, code: Some(code), label: label.to_string() }
}

/// Muestra vigente: la de mayor timestamp <= anchor + elapsed; si ninguna, la primera.
/// `forecast` debe venir ordenado ascendente. Busqueda binaria (se llama cada tick).
pub fn resolve(forecast: &[WeatherSample], anchor: DateTime<Utc>, elapsed_s: f64) -> Option<WeatherSample> {
    let now = anchor + ChronoDuration::milliseconds((elapsed_s * 1000.0).round() as i64);
    let idx = forecast.partition_point(|s| s.ts <= now);
    if idx == 0 { forecast.first().copied() } else { forecast.get(idx - 1).copied() }
}

/// Pronostico despejado de respaldo, anclado a `now`.
pub fn synthetic_forecast(now: DateTime<Utc>, hours: u32) -> Vec<WeatherSample> {
    let n = (hours.max(1) as i64) * 60 / FORECAST_STEP_MIN;
    (0..n)
        .map(|i| WeatherSample {
            ts: now + ChronoDuration::minutes(FORECAST_STEP_MIN * i),
            code: WeatherCode::CLEAR,
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct CurrentResponse {
    current_weather: CurrentWeather,
}

#[derive(Debug, Deserialize)]
struct CurrentWeather {
    #[serde(default)]
    weathercode: i32,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    minutely_15: Minutely15,
}

#[derive(Debug, Deserialize)]
struct Minutely15 {
    /// unixtime (se pide `timeformat=unixtime`)
    time: Vec<i64>,
    weathercode: Vec<Option<i32>>,
}

pub fn parse_current(body: &[u8]) -> Result<WeatherReading, FeedError> {
    let r: CurrentResponse = serde_json::from_slice(body).map_err(|e| FeedError::Malformed(e.to_string()))?;
    Ok(reading_for(r.current_weather.weathercode))
}

/// Huecos (`null`) en la serie se descartan; el resultado queda ordenado por tiempo.
pub fn parse_forecast(body: &[u8]) -> Result<Vec<WeatherSample>, FeedError> {
    let r: ForecastResponse = serde_json::from_slice(body).map_err(|e| FeedError::Malformed(e.to_string()))?;
    let m = r.minutely_15;
    if m.time.len() != m.weathercode.len() {
        return Err(FeedError::Malformed(format!(
            "minutely_15: {} tiempos vs {} codigos", m.time.len(), m.weathercode.len()
        )));
    }
    let mut out: Vec<WeatherSample> = m
        .time
        .iter()
        .zip(m.weathercode.iter())
        .filter_map(|(t, c)| Some(WeatherSample { ts: DateTime::from_timestamp(*t, 0)?, code: (*c)? }))
        .collect();
    if out.is_empty() {
        return Err(FeedError::Malformed("pronostico vacio".into()));
    }
    out.sort_by_key(|s| s.ts);
    Ok(out)
}

pub struct WeatherFeed<'a, S: FeedSource> {
    pub source: &'a S,
    pub base_url: String,
    pub lat: f64,
    pub lon: f64,
    pub horizon_hours: u32,
    pub timeout: Duration,
}

impl<'a, S: FeedSource> WeatherFeed<'a, S> {
    fn current_url(&self) -> String {
        format!("{}?latitude={}&longitude={}&current_weather=true", self.base_url, self.lat, self.lon)
    }

    fn forecast_url(&self) -> String {
        format!(
            "{}?latitude={}&longitude={}&minutely_15=weathercode&forecast_minutely_15={}&timeformat=unixtime&timezone=GMT",
            self.base_url, self.lat, self.lon, self.horizon_hours as i64 * 60 / FORECAST_STEP_MIN
        )
    }

    pub async fn try_current(&self) -> Result<WeatherReading, FeedError> {
        let body = self.source.get(&self.current_url(), self.timeout).await?;
        parse_current(&body)
    }

    /// Nunca falla: ante cualquier error devuelve despejado (1.0) y lo deja en el log.
    pub async fn current(&self) -> WeatherReading {
        match self.try_current().await {
            Ok(r) => r,
            Err(e) => {
                warn!("clima actual no disponible ({e}), uso valores por defecto");
                WeatherReading::clear_default()
            }
        }
    }

    pub async fn try_forecast(&self) -> Result<Vec<WeatherSample>, FeedError> {
        let body = self.source.get(&self.forecast_url(), self.timeout).await?;
        parse_forecast(&body)
    }

    pub async fn forecast(&self, now: DateTime<Utc>) -> Vec<WeatherSample> {
        match self.try_forecast().await {
            Ok(f) => {
                if let (Some(a), Some(b)) = (f.first(), f.last()) {
                    let h = (b.ts - a.ts).num_minutes() as f64 / 60.0;
                    info!("pronostico: {} puntos cubriendo {h:.1} h ({} a {})",
                        f.len(), a.ts.format("%H:%M"), b.ts.format("%H:%M"));
                }
                f
            }
            Err(e) => {
                warn!("pronostico no disponible ({e}), uso serie despejada sintetica");
                synthetic_forecast(now, self.horizon_hours)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::fake::FakeSource;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn scenario() -> Vec<WeatherSample> {
        vec![
            WeatherSample { ts: t0(), code: 0 },
            WeatherSample { ts: t0() + ChronoDuration::seconds(900), code: 65 },
        ]
    }

    fn feed(src: &FakeSource) -> WeatherFeed<'_, FakeSource> {
        WeatherFeed {
            source: src,
            base_url: "https://api.open-meteo.com/v1/forecast".into(),
            lat: 52.42,
            lon: 10.78,
            horizon_hours: 3,
            timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn friction_table_lookups() {
        assert_eq!(friction_for(0), ("Clear sky", 1.0));
        assert_eq!(friction_for(65), ("Heavy rain", 0.5));
        assert_eq!(friction_for(99), ("Thunderstorm with heavy hail", 0.25));
        assert_eq!(friction_for(42), ("Unknown", 1.0));
    }

    #[test]
    fn resolve_heavy_rain_scenario() {
        let f = scenario();
        assert_eq!(resolve(&f, t0(), 0.0).unwrap().code, 0);
        assert_eq!(resolve(&f, t0(), 899.0).unwrap().code, 0);
        assert_eq!(resolve(&f, t0(), 900.0).unwrap().code, 65);
        assert_eq!(resolve(&f, t0(), 1800.0).unwrap().code, 65);
    }

    #[test]
    fn resolve_before_first_sample_returns_earliest() {
        let f = scenario();
        let anchor = t0() - ChronoDuration::hours(2);
        assert_eq!(resolve(&f, anchor, 0.0).unwrap().ts, t0());
        assert!(resolve(&[], t0(), 0.0).is_none());
    }

    #[test]
    fn synthetic_forecast_is_clear_and_anchored() {
        let f = synthetic_forecast(t0(), 3);
        assert_eq!(f.len(), 12);
        assert_eq!(f[0].ts, t0());
        assert!(f.iter().all(|s| s.code == WeatherCode::CLEAR));
        assert!(f.windows(2).all(|w| w[0].ts < w[1].ts));
    }

    #[test]
    fn parse_forecast_sorts_and_skips_nulls() {
        let body = br#"{"minutely_15":{"time":[1740816900,1740816000,1740817800],"weathercode":[61,3,null]}}"#;
        let f = parse_forecast(body).unwrap();
        assert_eq!(f.len(), 2);
        assert_eq!(f[0].code, 3);
        assert_eq!(f[1].code, 61);
    }

    #[test]
    fn parse_forecast_rejects_mismatched_arrays() {
        let body = br#"{"minutely_15":{"time":[1,2],"weathercode":[0]}}"#;
        assert!(matches!(parse_forecast(body), Err(FeedError::Malformed(_))));
    }

    #[tokio::test]
    async fn current_weather_maps_code() {
        let src = FakeSource::default().with("current_weather=true", Ok(r#"{"current_weather":{"weathercode":73}}"#));
        let r = feed(&src).current().await;
        assert_eq!(r.code, Some(73));
        assert_eq!(r.label, "Moderate snow");
        assert_eq!(r.friction, 0.45);
    }

    #[tokio::test]
    async fn current_weather_degrades_on_timeout() {
        let src = FakeSource::default().with("current_weather", Err(FeedError::Timeout("x".into())));
        assert_eq!(feed(&src).current().await, WeatherReading::clear_default());
    }

    #[tokio::test]
    async fn forecast_falls_back_to_synthetic_on_bad_payload() {
        let src = FakeSource::default().with("minutely_15", Ok("<html>oops</html>"));
        let f = feed(&src).forecast(t0()).await;
        assert_eq!(f, synthetic_forecast(t0(), 3));
    }

    proptest! {
        #[test]
        fn resolve_is_monotonic_in_time(
            mut offsets in proptest::collection::vec(0i64..20_000, 1..20),
            t1 in 0.0f64..30_000.0,
            dt in 0.0f64..30_000.0,
        ) {
            offsets.sort();
            let f: Vec<WeatherSample> = offsets
                .iter()
                .map(|o| WeatherSample { ts: t0() + ChronoDuration::seconds(*o), code: (*o % 100) as i32 })
                .collect();
            let a = resolve(&f, t0(), t1).unwrap();
            let again = resolve(&f, t0(), t1).unwrap();
            let b = resolve(&f, t0(), t1 + dt).unwrap();
            prop_assert_eq!(a, again);
            prop_assert!(a.ts <= b.ts);
        }
    }
}
