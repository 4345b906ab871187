use std::io::{self, Read, Write};

use serde::Deserialize;

/// Payload compression algorithm, carried in the envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    Zlib = 2,
    Zstd = 3,
    Snappy = 4,
}

impl Compression {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Zlib),
            3 => Some(Self::Zstd),
            4 => Some(Self::Snappy),
            _ => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zlib => "zlib",
            Self::Zstd => "zstd",
            Self::Snappy => "snappy",
        }
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compresses data using the specified algorithm.
pub fn compress(data: &[u8], algorithm: Compression) -> io::Result<Vec<u8>> {
    match algorithm {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => compress_gzip(data),
        Compression::Zlib => compress_zlib(data),
        Compression::Zstd => zstd::encode_all(data, 0),
        Compression::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(io::Error::from),
    }
}

/// Reverses [`compress`].
pub fn decompress(data: &[u8], algorithm: Compression) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match algorithm {
        Compression::None => out.extend_from_slice(data),
        Compression::Gzip => {
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Zlib => {
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
        }
        Compression::Zstd => out = zstd::decode_all(data)?,
        Compression::Snappy => {
            out = snap::raw::Decoder::new()
                .decompress_vec(data)
                .map_err(io::Error::from)?;
        }
    }
    Ok(out)
}

fn compress_gzip(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

fn compress_zlib(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}
