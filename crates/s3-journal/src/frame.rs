//! Record Framing and Batch Compression
//!
//! Turns a drained batch of records into the single byte blob that gets
//! appended to the current part. Framing first, per record:
//!
//! | delimiter | sized | layout                                 |
//! |-----------|-------|----------------------------------------|
//! | set       | false | `encode(r) ‖ delimiter`                |
//! | unset     | true  | `be_u32(len) ‖ encode(r)`              |
//! | set       | true  | `be_u32(len) ‖ encode(r) ‖ delimiter`  |
//! | unset     | false | `encode(r)`                            |
//!
//! then the concatenated stream runs through the configured compressor.
//! An empty (`None`) batch encodes to zero bytes.

use std::io::Write;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Batch compression applied after framing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression
    #[default]
    Identity,
    Gzip,
    Snappy,
    Bzip2,
}

impl Compression {
    /// Object-key suffix conventionally paired with this compressor.
    pub fn suffix(&self) -> Option<&'static str> {
        match self {
            Compression::Identity => None,
            Compression::Gzip => Some("gz"),
            Compression::Snappy => Some("snappy"),
            Compression::Bzip2 => Some("bz2"),
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::Identity => Ok(data.to_vec()),
            Compression::Gzip => {
                let mut encoder =
                    flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Error::Encode(format!("gzip: {e}")))
            }
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(data)
                .map_err(|e| Error::Encode(format!("snappy: {e}"))),
            Compression::Bzip2 => {
                let mut encoder =
                    bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
                encoder
                    .write_all(data)
                    .and_then(|_| encoder.finish())
                    .map_err(|e| Error::Encode(format!("bzip2: {e}")))
            }
        }
    }
}

/// Record-level encoder hook, applied before framing.
pub type EncodeFn = dyn Fn(&Bytes) -> Bytes + Send + Sync;

/// Whole-batch compressor hook; overrides [`Compression`] when set.
pub type CompressFn = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// Applies per-record framing, then compression.
#[derive(Clone)]
pub struct Framer {
    delimiter: Option<Bytes>,
    sized: bool,
    compression: Compression,
    encoder: Option<Arc<EncodeFn>>,
    custom_compressor: Option<Arc<CompressFn>>,
}

impl Framer {
    pub fn new(delimiter: Option<Vec<u8>>, sized: bool, compression: Compression) -> Self {
        Self {
            delimiter: delimiter.filter(|d| !d.is_empty()).map(Bytes::from),
            sized,
            compression,
            encoder: None,
            custom_compressor: None,
        }
    }

    /// Install a record-level encoder (default: identity).
    pub fn with_encoder(mut self, encoder: Arc<EncodeFn>) -> Self {
        self.encoder = Some(encoder);
        self
    }

    /// Install a custom whole-batch compressor in place of the built-ins.
    pub fn with_custom_compressor(mut self, compressor: Arc<CompressFn>) -> Self {
        self.custom_compressor = Some(compressor);
        self
    }

    /// Encode a drained batch into one blob. `None` (an empty flush)
    /// encodes to zero bytes.
    pub fn encode_batch(&self, batch: Option<&[Bytes]>) -> Result<Bytes> {
        let records = match batch {
            Some(records) if !records.is_empty() => records,
            _ => return Ok(Bytes::new()),
        };

        let mut framed = BytesMut::new();
        for record in records {
            let encoded = match &self.encoder {
                Some(encode) => encode(record),
                None => record.clone(),
            };
            if self.sized {
                framed.put_u32(encoded.len() as u32);
            }
            framed.extend_from_slice(&encoded);
            if let Some(delimiter) = &self.delimiter {
                framed.extend_from_slice(delimiter);
            }
        }

        let compressed = match &self.custom_compressor {
            Some(compress) => compress(&framed),
            None => self.compression.compress(&framed)?,
        };
        Ok(Bytes::from(compressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn records(values: &[&str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from(v.to_string())).collect()
    }

    #[test]
    fn test_delimiter_only() {
        let framer = Framer::new(Some(b"\n".to_vec()), false, Compression::Identity);
        let blob = framer
            .encode_batch(Some(&records(&["hello", "world"])))
            .unwrap();
        assert_eq!(blob, Bytes::from("hello\nworld\n"));
    }

    #[test]
    fn test_sized_only() {
        let framer = Framer::new(None, true, Compression::Identity);
        let blob = framer.encode_batch(Some(&records(&["hi"]))).unwrap();
        assert_eq!(&blob[..], &[0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_sized_and_delimiter() {
        let framer = Framer::new(Some(b"|".to_vec()), true, Compression::Identity);
        let blob = framer.encode_batch(Some(&records(&["ab"]))).unwrap();
        assert_eq!(&blob[..], &[0, 0, 0, 2, b'a', b'b', b'|']);
    }

    #[test]
    fn test_bare_concatenation() {
        let framer = Framer::new(None, false, Compression::Identity);
        let blob = framer.encode_batch(Some(&records(&["ab", "cd"]))).unwrap();
        assert_eq!(blob, Bytes::from("abcd"));
    }

    #[test]
    fn test_empty_batch_is_zero_bytes() {
        let framer = Framer::new(Some(b"\n".to_vec()), true, Compression::Gzip);
        assert!(framer.encode_batch(None).unwrap().is_empty());
        assert!(framer.encode_batch(Some(&[])).unwrap().is_empty());
    }

    #[test]
    fn test_gzip_roundtrip() {
        let framer = Framer::new(Some(b"\n".to_vec()), false, Compression::Gzip);
        let blob = framer
            .encode_batch(Some(&records(&["hello", "world"])))
            .unwrap();

        let mut decoder = flate2::read::GzDecoder::new(&blob[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed, "hello\nworld\n");
    }

    #[test]
    fn test_snappy_roundtrip() {
        let framer = Framer::new(None, false, Compression::Snappy);
        let blob = framer.encode_batch(Some(&records(&["snap snap"]))).unwrap();

        let decompressed = snap::raw::Decoder::new().decompress_vec(&blob).unwrap();
        assert_eq!(decompressed, b"snap snap");
    }

    #[test]
    fn test_bzip2_roundtrip() {
        let framer = Framer::new(None, false, Compression::Bzip2);
        let blob = framer.encode_batch(Some(&records(&["bzzz"]))).unwrap();

        let mut decoder = bzip2::read::BzDecoder::new(&blob[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, b"bzzz");
    }

    #[test]
    fn test_record_encoder_applies_before_framing() {
        let framer = Framer::new(Some(b"\n".to_vec()), false, Compression::Identity)
            .with_encoder(Arc::new(|r: &Bytes| {
                Bytes::from(r.iter().map(u8::to_ascii_uppercase).collect::<Vec<_>>())
            }));
        let blob = framer.encode_batch(Some(&records(&["hello"]))).unwrap();
        assert_eq!(blob, Bytes::from("HELLO\n"));
    }

    #[test]
    fn test_custom_compressor_overrides_builtin() {
        let framer = Framer::new(None, false, Compression::Gzip)
            .with_custom_compressor(Arc::new(|data: &[u8]| {
                let mut out = data.to_vec();
                out.reverse();
                out
            }));
        let blob = framer.encode_batch(Some(&records(&["abc"]))).unwrap();
        assert_eq!(blob, Bytes::from("cba"));
    }

    #[test]
    fn test_compression_suffixes() {
        assert_eq!(Compression::Identity.suffix(), None);
        assert_eq!(Compression::Gzip.suffix(), Some("gz"));
        assert_eq!(Compression::Snappy.suffix(), Some("snappy"));
        assert_eq!(Compression::Bzip2.suffix(), Some("bz2"));
    }
}
