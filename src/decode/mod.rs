//! Mode-S extended squitter decoding.
//!
//! The bit-level work is delegated to the `rs1090` crate: frame
//! parsing via `Message::from_bytes` and position resolution via its
//! CPR machinery (`decode_position`), which pairs even/odd frames per
//! aircraft and falls back to the receiver reference when one is
//! configured. This module only filters downlink formats and maps the
//! library output onto the pipeline's message shape. Malformed frames
//! are returned as errors for the caller to count and drop, never
//! propagated further.

use std::collections::BTreeMap;
use std::fmt;

use rs1090::decode::adsb::ME;
use rs1090::decode::bds::bds09::AirborneVelocitySubType;
use rs1090::decode::cpr::{decode_position, AircraftState, CPRFormat, Position};
use rs1090::decode::DF;
use rs1090::prelude::*;
use thiserror::Error;

use crate::config::ReceiverPosition;

/// 24-bit transponder address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Icao(u32);

impl Icao {
    pub const fn new(addr: u32) -> Self {
        Self(addr & 0x00ff_ffff)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        u32::from_str_radix(s, 16).ok().map(Self::new)
    }
}

impl fmt::Display for Icao {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

/// CPR zone layout parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CprParity {
    Even,
    Odd,
}

impl From<&CPRFormat> for CprParity {
    fn from(fmt: &CPRFormat) -> Self {
        match fmt {
            CPRFormat::Even => CprParity::Even,
            CPRFormat::Odd => CprParity::Odd,
        }
    }
}

/// Which kind of message produced a velocity reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VelocityKind {
    Airborne,
    Surface,
}

impl VelocityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VelocityKind::Airborne => "airborne",
            VelocityKind::Surface => "surface",
        }
    }
}

/// One decoded extended squitter.
///
/// Position messages carry both the raw CPR cell (parity and encoded
/// cell indices) and, when the library could resolve it from a pair
/// or the receiver reference, the decoded coordinates.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedMessage {
    Identification {
        icao: Icao,
        callsign: String,
        rx_time: f64,
    },
    AirbornePosition {
        icao: Icao,
        parity: CprParity,
        cell_lat: u32,
        cell_lon: u32,
        latitude: Option<f64>,
        longitude: Option<f64>,
        altitude_ft: Option<f64>,
        rx_time: f64,
    },
    SurfacePosition {
        icao: Icao,
        parity: CprParity,
        cell_lat: u32,
        cell_lon: u32,
        latitude: Option<f64>,
        longitude: Option<f64>,
        ground_speed: Option<f64>,
        track_deg: Option<f64>,
        rx_time: f64,
    },
    Velocity {
        icao: Icao,
        ground_speed: f64,
        track_deg: f64,
        vertical_rate_fpm: Option<f64>,
        kind: VelocityKind,
        rx_time: f64,
    },
    Other {
        icao: Icao,
        rx_time: f64,
    },
}

impl DecodedMessage {
    pub fn icao(&self) -> Icao {
        match self {
            DecodedMessage::Identification { icao, .. }
            | DecodedMessage::AirbornePosition { icao, .. }
            | DecodedMessage::SurfacePosition { icao, .. }
            | DecodedMessage::Velocity { icao, .. }
            | DecodedMessage::Other { icao, .. } => *icao,
        }
    }

    pub fn rx_time(&self) -> f64 {
        match self {
            DecodedMessage::Identification { rx_time, .. }
            | DecodedMessage::AirbornePosition { rx_time, .. }
            | DecodedMessage::SurfacePosition { rx_time, .. }
            | DecodedMessage::Velocity { rx_time, .. }
            | DecodedMessage::Other { rx_time, .. } => *rx_time,
        }
    }
}

/// Reasons a frame cannot be decoded.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame is not valid hex")]
    BadHex,
    #[error("malformed frame: {0}")]
    Malformed(String),
    #[error("unsupported downlink format")]
    UnsupportedDownlink,
}

/// Stateful decoder wrapper.
///
/// The CPR machinery needs per-aircraft even/odd frame history, so
/// the decoder owns that state; it lives on the ingest task and is
/// touched by nothing else.
pub struct Decoder {
    aircraft: BTreeMap<ICAO, AircraftState>,
    reference: Option<Position>,
}

impl Decoder {
    pub fn new(receiver: Option<ReceiverPosition>) -> Self {
        Self {
            aircraft: BTreeMap::new(),
            reference: receiver.map(|r| Position {
                latitude: r.lat,
                longitude: r.lon,
            }),
        }
    }

    /// Decodes one hex frame received at `rx_time` (epoch seconds).
    /// Only extended squitters (DF 17/18) are consumed.
    pub fn decode(&mut self, hex_frame: &str, rx_time: f64) -> Result<DecodedMessage, FrameError> {
        let bytes = hex::decode(hex_frame.trim()).map_err(|_| FrameError::BadHex)?;

        let (_, mut msg) = Message::from_bytes((&bytes, 0))
            .map_err(|e| FrameError::Malformed(e.to_string()))?;

        match &mut msg.df {
            DF::ExtendedSquitterADSB(adsb) => {
                decode_position(
                    &mut adsb.message,
                    rx_time,
                    &adsb.icao24,
                    &mut self.aircraft,
                    &mut self.reference,
                    &None,
                );
                let icao = convert_icao(&adsb.icao24)?;
                Ok(map_me(icao, &adsb.message, rx_time))
            }
            DF::ExtendedSquitterTisB { cf, .. } => {
                decode_position(
                    &mut cf.me,
                    rx_time,
                    &cf.aa,
                    &mut self.aircraft,
                    &mut self.reference,
                    &None,
                );
                let icao = convert_icao(&cf.aa)?;
                Ok(map_me(icao, &cf.me, rx_time))
            }
            _ => Err(FrameError::UnsupportedDownlink),
        }
    }
}

fn convert_icao(icao24: &ICAO) -> Result<Icao, FrameError> {
    Icao::from_hex(&icao24.to_string())
        .ok_or_else(|| FrameError::Malformed("unparseable ICAO address".to_string()))
}

/// Maps one library ME payload onto the pipeline message shape.
fn map_me(icao: Icao, me: &ME, rx_time: f64) -> DecodedMessage {
    match me {
        ME::BDS08 { inner, .. } => {
            let callsign = sanitize_callsign(&inner.callsign);
            if callsign.is_empty() {
                DecodedMessage::Other { icao, rx_time }
            } else {
                DecodedMessage::Identification {
                    icao,
                    callsign,
                    rx_time,
                }
            }
        }

        ME::BDS05 { inner, .. } => DecodedMessage::AirbornePosition {
            icao,
            parity: CprParity::from(&inner.parity),
            cell_lat: inner.lat_cpr,
            cell_lon: inner.lon_cpr,
            latitude: inner.latitude,
            longitude: inner.longitude,
            altitude_ft: inner.alt.map(f64::from),
            rx_time,
        },

        ME::BDS06 { inner, .. } => DecodedMessage::SurfacePosition {
            icao,
            parity: CprParity::from(&inner.parity),
            cell_lat: inner.lat_cpr,
            cell_lon: inner.lon_cpr,
            latitude: inner.latitude,
            longitude: inner.longitude,
            ground_speed: inner.groundspeed,
            track_deg: inner.track,
            rx_time,
        },

        ME::BDS09(velocity) => match &velocity.velocity {
            AirborneVelocitySubType::GroundSpeedDecoding(gsd) => DecodedMessage::Velocity {
                icao,
                ground_speed: gsd.groundspeed,
                track_deg: gsd.track,
                vertical_rate_fpm: velocity.vertical_rate.map(f64::from),
                kind: VelocityKind::Airborne,
                rx_time,
            },
            // Airspeed subtypes carry heading/airspeed, not track
            // state, and do not feed kinematics.
            _ => DecodedMessage::Other { icao, rx_time },
        },

        _ => DecodedMessage::Other { icao, rx_time },
    }
}

/// Callsigns are 8 AIS characters padded with spaces; keep the
/// uppercase alphanumeric prefix.
fn sanitize_callsign(raw: &str) -> String {
    raw.trim_end_matches([' ', '_', '#'])
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Decoder {
        Decoder::new(None)
    }

    #[test]
    fn test_identification_frame() {
        let msg = decoder().decode("8D4840D6202CC371C32CE0576098", 1.0).unwrap();
        match msg {
            DecodedMessage::Identification {
                icao, callsign, ..
            } => {
                assert_eq!(icao, Icao::new(0x4840d6));
                assert_eq!(callsign, "KLM1023");
            }
            other => panic!("expected identification, got {other:?}"),
        }
    }

    #[test]
    fn test_position_pair_resolves_on_second_frame() {
        let mut dec = decoder();

        // Odd frame first: no pair yet, position deferred.
        let msg = dec.decode("8D40621D58C386435CC412692AD6", 1.0).unwrap();
        match msg {
            DecodedMessage::AirbornePosition {
                parity,
                latitude,
                longitude,
                altitude_ft,
                ..
            } => {
                assert_eq!(parity, CprParity::Odd);
                assert_eq!(latitude, None);
                assert_eq!(longitude, None);
                assert_eq!(altitude_ft, Some(38_000.0));
            }
            other => panic!("expected airborne position, got {other:?}"),
        }

        // The even frame completes the pair; with it the most recent,
        // the pair resolves to the published reference values.
        let msg = dec.decode("8D40621D58C382D690C8AC2863A7", 2.0).unwrap();
        match msg {
            DecodedMessage::AirbornePosition {
                icao,
                parity,
                latitude,
                longitude,
                ..
            } => {
                assert_eq!(icao, Icao::new(0x40621d));
                assert_eq!(parity, CprParity::Even);
                let lat = latitude.expect("pair resolves");
                let lon = longitude.expect("pair resolves");
                assert!((lat - 52.257_202).abs() < 1e-5, "lat = {lat}");
                assert!((lon - 3.919_372).abs() < 1e-5, "lon = {lon}");
            }
            other => panic!("expected airborne position, got {other:?}"),
        }
    }

    #[test]
    fn test_single_frame_resolves_against_receiver_reference() {
        let mut dec = Decoder::new(Some(ReceiverPosition { lat: 52.0, lon: 4.0 }));

        let msg = dec.decode("8D40621D58C382D690C8AC2863A7", 1.0).unwrap();
        match msg {
            DecodedMessage::AirbornePosition {
                latitude, longitude, ..
            } => {
                let lat = latitude.expect("local decode with reference");
                let lon = longitude.expect("local decode with reference");
                assert!((lat - 52.257_202).abs() < 1e-4, "lat = {lat}");
                assert!((lon - 3.919_372).abs() < 1e-4, "lon = {lon}");
            }
            other => panic!("expected airborne position, got {other:?}"),
        }
    }

    #[test]
    fn test_velocity_frame() {
        let msg = decoder().decode("8D485020994409940838175B284F", 4.0).unwrap();
        match msg {
            DecodedMessage::Velocity {
                ground_speed,
                track_deg,
                vertical_rate_fpm,
                kind,
                ..
            } => {
                assert!((ground_speed - 159.20).abs() < 0.01, "gs = {ground_speed}");
                assert!((track_deg - 182.88).abs() < 0.01, "trk = {track_deg}");
                assert_eq!(vertical_rate_fpm, Some(-832.0));
                assert_eq!(kind, VelocityKind::Airborne);
            }
            other => panic!("expected velocity, got {other:?}"),
        }
    }

    #[test]
    fn test_unsupported_downlink() {
        // DF4 surveillance altitude replies are not extended squitters.
        let err = decoder().decode("2000171806A983", 1.0).unwrap_err();
        assert_eq!(err, FrameError::UnsupportedDownlink);
    }

    #[test]
    fn test_bad_hex() {
        let mut dec = decoder();
        assert_eq!(dec.decode("not-a-frame", 1.0).unwrap_err(), FrameError::BadHex);
        assert_eq!(dec.decode("8D4", 1.0).unwrap_err(), FrameError::BadHex);
        // Valid hex, but far too short to be a Mode-S frame.
        assert!(matches!(
            dec.decode("8D48", 1.0).unwrap_err(),
            FrameError::Malformed(_)
        ));
    }

    #[test]
    fn test_sanitize_callsign() {
        assert_eq!(sanitize_callsign("KLM1023 "), "KLM1023");
        assert_eq!(sanitize_callsign("AB12____"), "AB12");
        assert_eq!(sanitize_callsign("        "), "");
    }

    #[test]
    fn test_icao_display() {
        assert_eq!(Icao::new(0x00ab12).to_string(), "00ab12");
        assert_eq!(Icao::from_hex("4840d6"), Some(Icao::new(0x4840d6)));
        assert_eq!(Icao::from_hex("zz"), None);
    }
}
