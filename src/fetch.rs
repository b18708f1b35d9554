//! fetch.rs
//!
//! GET con timeout y cache condicional (ETag / Last-Modified) para los feeds
//! de clima e incidencias. Un `304` reutiliza el ultimo cuerpo de esa URL.
//!
//! Los errores se tipan para que cada proveedor decida su valor por defecto.

use bytes::Bytes;
use reqwest::{Client, StatusCode};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    #[error("timeout en {0}")]
    Timeout(String),
    #[error("error de transporte: {0}")]
    Transport(String),
    #[error("HTTP {status} en {url}")]
    Status { status: u16, url: String },
    #[error("payload invalido: {0}")]
    Malformed(String),
}

/// "GET url -> bytes". Se abstrae para poder probar los proveedores sin red.
pub trait FeedSource {
    fn get(&self, url: &str, timeout: Duration) -> impl Future<Output = Result<Bytes, FeedError>>;
}

#[derive(Default, Clone)]
pub struct CacheCtl {
    pub etag: Option<String>,
    pub last_mod: Option<String>,
    pub body: Option<Bytes>,
}

pub struct HttpFetcher {
    client: Client,
    cache: Mutex<HashMap<String, CacheCtl>>,
}

impl HttpFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder().brotli(true).gzip(true).deflate(true).build()?;
        Ok(Self { client, cache: Mutex::new(HashMap::new()) })
    }

    fn cached(&self, url: &str) -> CacheCtl {
        self.cache
            .lock()
            .map(|c| c.get(url).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    fn store(&self, url: &str, ctl: CacheCtl) {
        if let Ok(mut c) = self.cache.lock() {
            c.insert(url.to_string(), ctl);
        }
    }
}

fn map_reqwest(url: &str, e: reqwest::Error) -> FeedError {
    if e.is_timeout() {
        FeedError::Timeout(url.to_string())
    } else if e.is_decode() || e.is_body() {
        FeedError::Malformed(e.to_string())
    } else {
        FeedError::Transport(e.to_string())
    }
}

impl FeedSource for HttpFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> Result<Bytes, FeedError> {
        let cache = self.cached(url);
        let mut req = self.client.get(url).timeout(timeout);
        if cache.body.is_some() {
            if let Some(et) = &cache.etag { req = req.header("If-None-Match", et); }
            if let Some(lm) = &cache.last_mod { req = req.header("If-Modified-Since", lm); }
        }
        let resp = req.send().await.map_err(|e| map_reqwest(url, e))?;
        match resp.status() {
            StatusCode::NOT_MODIFIED => cache
                .body
                .ok_or_else(|| FeedError::Malformed(format!("304 sin cuerpo previo en {url}"))),
            s if s.is_success() => {
                let header = |name: &str| {
                    resp.headers().get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
                };
                let etag = header("etag");
                let last_mod = header("last-modified");
                let bytes = resp.bytes().await.map_err(|e| map_reqwest(url, e))?;
                self.store(url, CacheCtl { etag, last_mod, body: Some(bytes.clone()) });
                Ok(bytes)
            }
            s => Err(FeedError::Status { status: s.as_u16(), url: url.to_string() }),
        }
    }
}
