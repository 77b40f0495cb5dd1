use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Receiver reference position used for locally-unambiguous CPR
/// decoding and distance annotation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverPosition {
    pub lat: f64,
    pub lon: f64,
}

/// Immutable runtime configuration, constructed once at startup from
/// the environment. Components receive this by reference and never
/// re-read the environment themselves.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream dump1090 feed.
    pub dump1090_host: String,
    pub dump1090_raw_port: u16,

    /// WebSocket publish endpoint (server side).
    pub ws_port: u16,
    /// WebSocket subscribe endpoint (client side).
    pub ws_uri: String,

    /// SQLite database path.
    pub db_path: PathBuf,

    /// Publisher tick.
    pub publish_interval: Duration,
    /// Persistence throttle per aircraft.
    pub save_interval: Duration,

    /// Optional receiver reference; both coordinates or neither.
    pub receiver: Option<ReceiverPosition>,

    /// Aircraft expiry: idle entries beyond this are evicted.
    pub expiry: Duration,
    /// Gap that splits two flight sessions. Defaults to `expiry`.
    pub session_gap: Duration,
    /// Incomplete-assembly threshold.
    pub assembly_timeout: Duration,

    /// Bounded persistence queue between subscriber and DB worker.
    pub persist_queue_capacity: usize,

    /// Log and metrics artifact directories.
    pub log_dir: PathBuf,
    pub metrics_dir: PathBuf,

    /// Health/metrics HTTP port; 0 disables the endpoint.
    pub health_port: u16,
}

impl Config {
    /// Reads every recognized variable, applying defaults and
    /// validating. Invalid values are fatal: a misconfigured component
    /// should refuse to start rather than run with surprises.
    pub fn from_env() -> Result<Self> {
        let expiry = Duration::from_secs_f64(env_parse("ADSB_EXPIRY_SECONDS", 120.0)?);
        let session_gap = match env::var("ADSB_SESSION_GAP_SECONDS") {
            Ok(raw) => Duration::from_secs_f64(
                raw.parse()
                    .with_context(|| format!("invalid ADSB_SESSION_GAP_SECONDS: {raw}"))?,
            ),
            Err(_) => expiry,
        };

        let cfg = Self {
            dump1090_host: env_string("DUMP1090_HOST", "localhost"),
            dump1090_raw_port: env_parse("DUMP1090_RAW_PORT", 30002u16)?,
            ws_port: env_parse("ADSB_WS_PORT", 8443u16)?,
            ws_uri: env_string("ADSB_WS_URI", "ws://localhost:8443"),
            db_path: PathBuf::from(env_string("ADSB_DB_PATH", "./adsb_data.db")),
            publish_interval: Duration::from_secs_f64(env_parse(
                "ADSB_PUBLISH_INTERVAL",
                1.0,
            )?),
            save_interval: Duration::from_secs_f64(env_parse("ADSB_SAVE_INTERVAL", 5.0)?),
            receiver: receiver_from_env()?,
            expiry,
            session_gap,
            assembly_timeout: Duration::from_secs_f64(env_parse(
                "MESSAGE_ASSEMBLY_TIMEOUT_SECONDS",
                120.0,
            )?),
            persist_queue_capacity: env_parse("ADSB_PERSIST_QUEUE_CAPACITY", 1024usize)?,
            log_dir: PathBuf::from(env_string("ADSB_LOG_DIR", "tmp/logs")),
            metrics_dir: PathBuf::from(env_string("ADSB_METRICS_DIR", "tmp/metrics")),
            health_port: env_parse("ADSB_HEALTH_PORT", 9090u16)?,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.publish_interval.is_zero() {
            bail!("ADSB_PUBLISH_INTERVAL must be > 0");
        }
        if self.expiry.is_zero() {
            bail!("ADSB_EXPIRY_SECONDS must be > 0");
        }
        if self.persist_queue_capacity == 0 {
            bail!("ADSB_PERSIST_QUEUE_CAPACITY must be > 0");
        }
        if let Some(r) = &self.receiver {
            if r.lat.abs() > 90.0 || r.lon.abs() > 180.0 {
                bail!(
                    "RECEIVER_LAT/RECEIVER_LON out of range: {}, {}",
                    r.lat,
                    r.lon
                );
            }
        }
        Ok(())
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("invalid {key}: {raw}")),
        Err(_) => Ok(default),
    }
}

/// Both coordinates must be present for a usable reference; one
/// without the other is a configuration error.
fn receiver_from_env() -> Result<Option<ReceiverPosition>> {
    let lat = env::var("RECEIVER_LAT").ok();
    let lon = env::var("RECEIVER_LON").ok();

    match (lat, lon) {
        (Some(lat), Some(lon)) => {
            let lat: f64 = lat
                .parse()
                .with_context(|| format!("invalid RECEIVER_LAT: {lat}"))?;
            let lon: f64 = lon
                .parse()
                .with_context(|| format!("invalid RECEIVER_LON: {lon}"))?;
            Ok(Some(ReceiverPosition { lat, lon }))
        }
        (None, None) => Ok(None),
        _ => bail!("RECEIVER_LAT and RECEIVER_LON must be set together"),
    }
}
