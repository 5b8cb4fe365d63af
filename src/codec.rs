//! Payload compression for stored node data.
//!
//! Every row carries a one-byte `flags` marker next to its payload. The
//! marker, not the current configuration, decides how a payload is read
//! back, so the compression setting can change over a store's lifetime
//! without breaking reads of older rows.
//!
//! ```ignore
//! let codec = Codec::new(Compression::Zstd);
//! let encoded = codec.encode(b"payload")?;
//! let data = Codec::decode(encoded.flags, &encoded.payload)?;
//! ```

use flate2::Compression as ZlibLevel;
use flate2::read::{ZlibDecoder, ZlibEncoder};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::io::Read;
use std::str::FromStr;

/// Row marker for zlib-compressed payloads.
pub const FLAG_COMPRESSED_ZLIB: u8 = 1 << 0;
/// Row marker for zstd-compressed payloads.
pub const FLAG_COMPRESSED_ZSTD: u8 = 1 << 1;

const KNOWN_FLAGS: u8 = FLAG_COMPRESSED_ZLIB | FLAG_COMPRESSED_ZSTD;

/// zstd level used for every write.
const ZSTD_LEVEL: i32 = 3;

/// Errors raised while decoding a stored payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The marker carries bits this codec does not understand.
    #[error("unknown compression flags {0:#04b}")]
    UnknownFlags(u8),

    /// More than one compression marker is set.
    #[error("conflicting compression flags {0:#04b}")]
    ConflictingFlags(u8),

    /// The payload is not a valid stream for its marker.
    #[error("corrupt {scheme} payload: {source}")]
    Corrupt {
        scheme: Compression,
        #[source]
        source: std::io::Error,
    },
}

/// Compression applied to newly written payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Off,
    Zlib,
    Zstd,
}

impl Compression {
    /// Row marker written alongside payloads compressed with this scheme.
    #[must_use]
    pub const fn flag(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::Zlib => FLAG_COMPRESSED_ZLIB,
            Self::Zstd => FLAG_COMPRESSED_ZSTD,
        }
    }

    fn from_flags(flags: u8) -> Result<Self, DecodeError> {
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::UnknownFlags(flags));
        }
        match flags {
            0 => Ok(Self::Off),
            FLAG_COMPRESSED_ZLIB => Ok(Self::Zlib),
            FLAG_COMPRESSED_ZSTD => Ok(Self::Zstd),
            _ => Err(DecodeError::ConflictingFlags(flags)),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Off => "off",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
        })
    }
}

impl FromStr for Compression {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" | "none" | "" => Ok(Self::Off),
            "zlib" => Ok(Self::Zlib),
            "zstd" => Ok(Self::Zstd),
            other => Err(format!(
                "unknown compression '{other}', expected one of: off, zlib, zstd"
            )),
        }
    }
}

// Accepts the legacy boolean form as well: `true` means zlib.
impl<'de> Deserialize<'de> for Compression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Enabled(bool),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Enabled(true) => Ok(Self::Zlib),
            Repr::Enabled(false) => Ok(Self::Off),
            Repr::Name(name) => name.parse().map_err(serde::de::Error::custom),
        }
    }
}

/// An encoded payload together with its row marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    pub flags: u8,
    pub payload: Vec<u8>,
}

/// Stateless payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    compression: Compression,
}

impl Codec {
    pub fn new(compression: Compression) -> Self {
        Self { compression }
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Encodes `data` under the configured compression.
    ///
    /// With compression off the payload is `data` unchanged and the marker
    /// is zero. Compression writes to memory and cannot fail in practice;
    /// an I/O error from the encoder is still propagated.
    pub fn encode(&self, data: &[u8]) -> std::io::Result<Encoded> {
        let payload = match self.compression {
            Compression::Off => data.to_vec(),
            Compression::Zlib => {
                let mut out = Vec::with_capacity(data.len() / 2);
                ZlibEncoder::new(data, ZlibLevel::default()).read_to_end(&mut out)?;
                out
            },
            Compression::Zstd => zstd::encode_all(data, ZSTD_LEVEL)?,
        };

        Ok(Encoded {
            flags: self.compression.flag(),
            payload,
        })
    }

    /// Decodes a stored payload using its own marker.
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError`] if the marker is unknown or the payload is
    /// not a valid stream for the scheme it names.
    pub fn decode(flags: u8, payload: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let scheme = Compression::from_flags(flags)?;
        let corrupt = |source| DecodeError::Corrupt { scheme, source };

        match scheme {
            Compression::Off => Ok(payload.to_vec()),
            Compression::Zlib => {
                let mut out = Vec::with_capacity(payload.len() * 2);
                ZlibDecoder::new(payload)
                    .read_to_end(&mut out)
                    .map_err(corrupt)?;
                Ok(out)
            },
            Compression::Zstd => zstd::decode_all(payload).map_err(corrupt),
        }
    }
}
