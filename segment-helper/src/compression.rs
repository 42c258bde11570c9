//! Streaming compression for segment data files.
//!
//! The codec is fixed per backup set and encoded in the data file extension.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
use async_compression::Level;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite};

use crate::utils::errors::HelperError;

pub type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Supported compression types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Gzip,
    Zstd,
}

impl CompressionType {
    /// File extension including the leading dot, empty for uncompressed data.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::None => "",
            Self::Gzip => ".gz",
            Self::Zstd => ".zst",
        }
    }

    pub fn from_extension(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Some(Self::Gzip),
            Some("zst") => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Shell command that decompresses stdin to stdout, used inside `COPY ... FROM PROGRAM`.
    pub fn decompress_command(&self) -> &'static str {
        match self {
            Self::None => "cat -",
            Self::Gzip => "gzip -d -c",
            Self::Zstd => "zstd -d -c",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Zstd => "zstd",
        }
    }

    pub fn is_compressed(&self) -> bool {
        *self != Self::None
    }

    /// Picks the codec for a helper invocation.
    ///
    /// An explicit type wins; a compression level of 0 means uncompressed;
    /// otherwise the data file extension decides, falling back to gzip when a
    /// level was given without a recognised extension.
    pub fn resolve(explicit: Option<Self>, level: Option<u32>, data_file: &Path) -> Self {
        if let Some(kind) = explicit {
            if level == Some(0) {
                return Self::None;
            }
            return kind;
        }
        if level == Some(0) {
            return Self::None;
        }
        match Self::from_extension(data_file) {
            Some(kind) => kind,
            None if level.is_some() => Self::Gzip,
            None => Self::None,
        }
    }

    pub fn default_level(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Zstd => 3,
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CompressionType {
    type Err = HelperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "zstd" => Ok(Self::Zstd),
            other => Err(HelperError::Config(format!(
                "unknown compression type {:?}, expected gzip or zstd",
                other
            ))),
        }
    }
}

/// Wraps `inner` in a compressing writer. The caller must `shutdown()` it to
/// flush the final frame.
pub fn encoder<W>(compression: CompressionType, level: u32, inner: W) -> BoxedWriter
where
    W: AsyncWrite + Send + 'static,
{
    let level = if level == 0 {
        compression.default_level()
    } else {
        level
    } as i32;
    match compression {
        CompressionType::None => Box::pin(inner),
        CompressionType::Gzip => Box::pin(GzipEncoder::with_quality(inner, Level::Precise(level))),
        CompressionType::Zstd => Box::pin(ZstdEncoder::with_quality(inner, Level::Precise(level))),
    }
}

/// Wraps `inner` in a decompressing reader.
pub fn decoder<R>(compression: CompressionType, inner: R) -> BoxedReader
where
    R: AsyncBufRead + Send + 'static,
{
    match compression {
        CompressionType::None => Box::pin(inner),
        CompressionType::Gzip => {
            let mut decoder = GzipDecoder::new(inner);
            decoder.multiple_members(true);
            Box::pin(decoder)
        }
        CompressionType::Zstd => {
            let mut decoder = ZstdDecoder::new(inner);
            decoder.multiple_members(true);
            Box::pin(decoder)
        }
    }
}
