//! Traffic Obfuscation
//!
//! Packet transforms that disguise tunnel traffic from deep packet
//! inspection. The mode is picked once when the layer is built:
//!
//! | Mode          | Frame                                                   |
//! |---------------|---------------------------------------------------------|
//! | `stealth`     | `17 03 03 <len:u16 BE> <payload>` (TLS application data) |
//! | `scramble`    | payload XOR repeating key                               |
//! | `shadowsocks` | `<n:u8> <n random bytes> <unix ts:u64 BE> <payload>`     |
//! | `stunnel`     | payload unchanged, TLS is provided by an external tunnel |
//!
//! A disabled layer passes bytes through untouched.

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::{ToSocketAddrs, UdpSocket};
use tracing::{debug, info, trace};

const TLS_HEADER: [u8; 3] = [0x17, 0x03, 0x03];
const STEALTH_HEADER_LEN: usize = 5;
const SHADOWSOCKS_MIN_LEN: usize = 10;

/// Built-in scramble key used when none is configured
pub const DEFAULT_SCRAMBLE_KEY: &[u8] = b"hopnode-scramble-v1-5b3e9d02c7a41f68";

/// Obfuscation mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObfuscationMode {
    Stealth,
    Scramble,
    Shadowsocks,
    Stunnel,
}

impl ObfuscationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObfuscationMode::Stealth => "stealth",
            ObfuscationMode::Scramble => "scramble",
            ObfuscationMode::Shadowsocks => "shadowsocks",
            ObfuscationMode::Stunnel => "stunnel",
        }
    }
}

impl std::fmt::Display for ObfuscationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObfuscationMode {
    type Err = ObfuscationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "stealth" => Ok(ObfuscationMode::Stealth),
            "scramble" => Ok(ObfuscationMode::Scramble),
            "shadowsocks" => Ok(ObfuscationMode::Shadowsocks),
            "stunnel" => Ok(ObfuscationMode::Stunnel),
            other => Err(ObfuscationError::UnknownMode(other.to_string())),
        }
    }
}

/// Obfuscation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObfuscationConfig {
    pub enabled: bool,
    pub mode: ObfuscationMode,
    /// Scramble key; the built-in key is used when unset
    pub scramble_key: Option<String>,
    /// Underlying tunnel protocol, reported in the status map
    pub tunnel_method: String,
}

impl Default for ObfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: ObfuscationMode::Stealth,
            scramble_key: None,
            tunnel_method: "wireguard".to_string(),
        }
    }
}

/// Packet transform selected at construction
pub struct ObfuscationLayer {
    enabled: bool,
    mode: ObfuscationMode,
    key: Vec<u8>,
    tunnel_method: String,
}

impl ObfuscationLayer {
    pub fn new(config: &ObfuscationConfig) -> Result<Self, ObfuscationError> {
        let key = match &config.scramble_key {
            Some(k) if k.is_empty() => return Err(ObfuscationError::EmptyKey),
            Some(k) => k.as_bytes().to_vec(),
            None => DEFAULT_SCRAMBLE_KEY.to_vec(),
        };

        if config.enabled {
            info!("Obfuscation enabled ({} over {})", config.mode, config.tunnel_method);
        }

        Ok(Self {
            enabled: config.enabled,
            mode: config.mode,
            key,
            tunnel_method: config.tunnel_method.clone(),
        })
    }

    /// A layer that leaves every packet untouched
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            mode: ObfuscationMode::Stealth,
            key: DEFAULT_SCRAMBLE_KEY.to_vec(),
            tunnel_method: "wireguard".to_string(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn mode(&self) -> ObfuscationMode {
        self.mode
    }

    pub fn obfuscate(&self, data: &[u8]) -> Vec<u8> {
        if !self.enabled {
            return data.to_vec();
        }

        match self.mode {
            ObfuscationMode::Stealth => {
                let len = u16::try_from(data.len()).unwrap_or(u16::MAX);
                let mut out = Vec::with_capacity(STEALTH_HEADER_LEN + data.len());
                out.extend_from_slice(&TLS_HEADER);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            ObfuscationMode::Scramble => self.xor(data),
            ObfuscationMode::Shadowsocks => {
                let mut rng = rand::thread_rng();
                let pad_len: u8 = rng.gen_range(1..=255);
                let mut padding = vec![0u8; pad_len as usize];
                rng.fill_bytes(&mut padding);
                let timestamp = chrono::Utc::now().timestamp().max(0) as u64;

                let mut out = Vec::with_capacity(1 + padding.len() + 8 + data.len());
                out.push(pad_len);
                out.extend_from_slice(&padding);
                out.extend_from_slice(&timestamp.to_be_bytes());
                out.extend_from_slice(data);
                out
            }
            ObfuscationMode::Stunnel => data.to_vec(),
        }
    }

    pub fn deobfuscate(&self, data: &[u8]) -> Result<Vec<u8>, ObfuscationError> {
        if !self.enabled {
            return Ok(data.to_vec());
        }

        match self.mode {
            ObfuscationMode::Stealth => {
                if data.len() < STEALTH_HEADER_LEN {
                    return Err(ObfuscationError::Truncated {
                        mode: self.mode,
                        len: data.len(),
                    });
                }
                if data[..3] != TLS_HEADER {
                    trace!("Stealth frame without TLS record header");
                }
                Ok(data[STEALTH_HEADER_LEN..].to_vec())
            }
            ObfuscationMode::Scramble => Ok(self.xor(data)),
            ObfuscationMode::Shadowsocks => {
                if data.len() < SHADOWSOCKS_MIN_LEN {
                    return Err(ObfuscationError::Truncated {
                        mode: self.mode,
                        len: data.len(),
                    });
                }
                let pad_len = data[0] as usize;
                if pad_len == 0 {
                    return Err(ObfuscationError::Malformed("zero padding length".into()));
                }
                let start = 1 + pad_len + 8;
                if start > data.len() {
                    return Err(ObfuscationError::Malformed(format!(
                        "padding length {} exceeds frame of {} bytes",
                        pad_len,
                        data.len()
                    )));
                }
                Ok(data[start..].to_vec())
            }
            ObfuscationMode::Stunnel => Ok(data.to_vec()),
        }
    }

    fn xor(&self, data: &[u8]) -> Vec<u8> {
        data.iter()
            .zip(self.key.iter().cycle())
            .map(|(b, k)| b ^ k)
            .collect()
    }

    /// Status map: `enabled`, `mode`, `tunnel_method`
    pub fn status(&self) -> serde_json::Value {
        serde_json::json!({
            "enabled": self.enabled,
            "mode": self.mode.as_str(),
            "tunnel_method": self.tunnel_method,
        })
    }
}

/// UDP socket that runs every datagram through an [`ObfuscationLayer`]
pub struct ObfuscatedSocket {
    socket: UdpSocket,
    layer: ObfuscationLayer,
}

impl ObfuscatedSocket {
    pub async fn bind<A: ToSocketAddrs>(addr: A, layer: ObfuscationLayer) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("Obfuscated socket bound to {:?}", socket.local_addr()?);
        Ok(Self { socket, layer })
    }

    pub fn from_socket(socket: UdpSocket, layer: ObfuscationLayer) -> Self {
        Self { socket, layer }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn layer(&self) -> &ObfuscationLayer {
        &self.layer
    }

    /// Obfuscate and send one datagram; returns the payload length sent
    pub async fn send_to(&self, payload: &[u8], target: SocketAddr) -> Result<usize, ObfuscationError> {
        let frame = self.layer.obfuscate(payload);
        self.socket.send_to(&frame, target).await?;
        Ok(payload.len())
    }

    /// Receive one datagram and return its deobfuscated payload
    pub async fn recv_from(&self) -> Result<(Vec<u8>, SocketAddr), ObfuscationError> {
        let mut buf = vec![0u8; 65_536];
        let (n, from) = self.socket.recv_from(&mut buf).await?;
        let payload = self.layer.deobfuscate(&buf[..n])?;
        Ok((payload, from))
    }
}

/// Obfuscation errors
#[derive(Debug, thiserror::Error)]
pub enum ObfuscationError {
    #[error("Unknown obfuscation mode: {0}")]
    UnknownMode(String),

    #[error("Scramble key must not be empty")]
    EmptyKey,

    #[error("{mode} frame too short ({len} bytes)")]
    Truncated { mode: ObfuscationMode, len: usize },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODES: [ObfuscationMode; 4] = [
        ObfuscationMode::Stealth,
        ObfuscationMode::Scramble,
        ObfuscationMode::Shadowsocks,
        ObfuscationMode::Stunnel,
    ];

    fn layer(mode: ObfuscationMode) -> ObfuscationLayer {
        ObfuscationLayer::new(&ObfuscationConfig {
            enabled: true,
            mode,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_all_modes() {
        for mode in MODES {
            let layer = layer(mode);
            for len in [0usize, 1, 100, 65536] {
                let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let wire = layer.obfuscate(&data);
                assert_eq!(layer.deobfuscate(&wire).unwrap(), data, "{} len {}", mode, len);
            }
        }
    }

    #[test]
    fn test_disabled_is_identity() {
        let layer = ObfuscationLayer::disabled();
        let data = b"plain wireguard packet".to_vec();
        assert_eq!(layer.obfuscate(&data), data);
        assert_eq!(layer.deobfuscate(&data).unwrap(), data);
    }

    #[test]
    fn test_stealth_header() {
        let layer = layer(ObfuscationMode::Stealth);
        let wire = layer.obfuscate(&[0xAA; 300]);
        assert_eq!(&wire[..5], &[0x17, 0x03, 0x03, 0x01, 0x2C]);

        // oversized payloads saturate the length field
        let wire = layer.obfuscate(&vec![0u8; 70_000]);
        assert_eq!(&wire[3..5], &[0xFF, 0xFF]);

        assert!(matches!(layer.deobfuscate(&[0x17, 0x03]), Err(ObfuscationError::Truncated { .. })));
    }

    #[test]
    fn test_scramble_custom_key() {
        let layer = ObfuscationLayer::new(&ObfuscationConfig {
            enabled: true,
            mode: ObfuscationMode::Scramble,
            scramble_key: Some("k".into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(layer.obfuscate(&[0x00, b'k']), vec![b'k', 0x00]);

        let empty = ObfuscationConfig {
            scramble_key: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(ObfuscationLayer::new(&empty), Err(ObfuscationError::EmptyKey)));
    }

    #[test]
    fn test_shadowsocks_malformed() {
        let layer = layer(ObfuscationMode::Shadowsocks);
        assert!(matches!(layer.deobfuscate(&[1u8; 9]), Err(ObfuscationError::Truncated { .. })));

        let mut zero = vec![0u8; 20];
        zero[0] = 0;
        assert!(matches!(layer.deobfuscate(&zero), Err(ObfuscationError::Malformed(_))));

        let mut long = vec![0u8; 20];
        long[0] = 50;
        assert!(matches!(layer.deobfuscate(&long), Err(ObfuscationError::Malformed(_))));

        let wire = layer.obfuscate(b"x");
        let pad = wire[0] as usize;
        assert!((1..=255).contains(&pad));
        assert_eq!(wire.len(), 1 + pad + 8 + 1);
    }

    #[test]
    fn test_mode_parsing_and_status() {
        assert_eq!("Shadowsocks".parse::<ObfuscationMode>().unwrap(), ObfuscationMode::Shadowsocks);
        assert!(matches!("rot13".parse::<ObfuscationMode>(), Err(ObfuscationError::UnknownMode(_))));

        let status = layer(ObfuscationMode::Stunnel).status();
        assert_eq!(status["enabled"], true);
        assert_eq!(status["mode"], "stunnel");
        assert_eq!(status["tunnel_method"], "wireguard");
    }

    #[tokio::test]
    async fn test_obfuscated_socket() {
        let a = ObfuscatedSocket::bind("127.0.0.1:0", layer(ObfuscationMode::Shadowsocks)).await.unwrap();
        let b = ObfuscatedSocket::bind("127.0.0.1:0", layer(ObfuscationMode::Shadowsocks)).await.unwrap();

        a.send_to(b"handshake", b.local_addr().unwrap()).await.unwrap();
        let (payload, from) = b.recv_from().await.unwrap();
        assert_eq!(payload, b"handshake");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
