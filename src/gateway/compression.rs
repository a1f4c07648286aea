//! Transport stream compression
//!
//! With `zlib-stream` the whole socket shares one deflate context. Frames may
//! split a message anywhere; a message is complete once the buffered bytes end
//! with the sync-flush marker `00 00 FF FF`.

use crate::error::CodecError;
use flate2::{Decompress, FlushDecompress, Status};
use serde::{Deserialize, Serialize};

/// Sync-flush marker terminating every complete message
const ZLIB_SUFFIX: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Output headroom kept free before each inflate step
const INFLATE_CHUNK: usize = 16 * 1024;

/// Streaming decompressor sitting in front of the codec
pub trait Decompressor: Send {
    /// Value for the `compress` query parameter
    fn name(&self) -> &'static str;

    /// True for per-payload compression, false for transport compression
    fn is_payload_compression(&self) -> bool;

    /// Feed one binary chunk. Returns the inflated message once a boundary is seen.
    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError>;

    /// Drop the dictionary and any partial input
    fn reset(&mut self);
}

/// Compression negotiated at connect time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    #[default]
    #[serde(rename = "zlib-stream")]
    ZlibStream,
    #[serde(rename = "none")]
    Disabled,
}

impl Compression {
    /// Query parameter value, `None` when compression is off
    pub fn query_value(self) -> Option<&'static str> {
        match self {
            Self::ZlibStream => Some(ZlibStream::NAME),
            Self::Disabled => None,
        }
    }

    pub fn decompressor(self) -> Option<Box<dyn Decompressor>> {
        match self {
            Self::ZlibStream => Some(Box::new(ZlibStream::new())),
            Self::Disabled => None,
        }
    }
}

/// Shared-context zlib stream inflater
pub struct ZlibStream {
    inflater: Decompress,
    buffer: Vec<u8>,
}

impl ZlibStream {
    pub const NAME: &'static str = "zlib-stream";

    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            buffer: Vec::new(),
        }
    }

    /// Bytes buffered while waiting for a message boundary
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut output = Vec::with_capacity(input.len().saturating_mul(4).max(INFLATE_CHUNK));
        let mut offset = 0;

        loop {
            if output.capacity() - output.len() < INFLATE_CHUNK {
                output.reserve(INFLATE_CHUNK);
            }

            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();
            let status = self
                .inflater
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)
                .map_err(|e| CodecError::Decompress {
                    compression: Self::NAME,
                    reason: e.to_string(),
                })?;
            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            offset += consumed;

            if status == Status::StreamEnd {
                break;
            }
            // All input consumed and the inflater stopped short of filling the buffer.
            if offset >= input.len() && output.len() < output.capacity() {
                break;
            }
            if consumed == 0 && produced == 0 {
                break;
            }
        }

        Ok(output)
    }
}

impl Default for ZlibStream {
    fn default() -> Self {
        Self::new()
    }
}

impl Decompressor for ZlibStream {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn is_payload_compression(&self) -> bool {
        false
    }

    fn push(&mut self, chunk: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.buffer.extend_from_slice(chunk);
        if !self.buffer.ends_with(&ZLIB_SUFFIX) {
            return Ok(None);
        }

        let input = std::mem::take(&mut self.buffer);
        let output = self.inflate(&input)?;
        Ok(Some(output))
    }

    fn reset(&mut self) {
        self.inflater.reset(true);
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compress, FlushCompress};

    fn compress_sync(compressor: &mut Compress, data: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len() + 64);
        let mut offset = 0;
        loop {
            if out.capacity() - out.len() < 64 {
                out.reserve(1024);
            }
            let before = compressor.total_in();
            compressor
                .compress_vec(&data[offset..], &mut out, FlushCompress::Sync)
                .unwrap();
            offset += (compressor.total_in() - before) as usize;
            if offset >= data.len() && out.ends_with(&ZLIB_SUFFIX) {
                break;
            }
        }
        out
    }

    #[test]
    fn test_chunked_messages_share_dictionary() {
        let mut compressor = Compress::new(flate2::Compression::default(), true);
        let first = br#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
        let second = br#"{"op":11,"d":null,"heartbeat_interval":41250}"#;
        let first_z = compress_sync(&mut compressor, first);
        let second_z = compress_sync(&mut compressor, second);

        let mut stream = ZlibStream::new();
        let (head, tail) = first_z.split_at(first_z.len() / 2);
        assert_eq!(stream.push(head).unwrap(), None);
        assert!(stream.pending() > 0);
        assert_eq!(stream.push(tail).unwrap().as_deref(), Some(&first[..]));
        assert_eq!(stream.pending(), 0);

        assert_eq!(stream.push(&second_z).unwrap().as_deref(), Some(&second[..]));
    }

    #[test]
    fn test_large_message_inflates_fully() {
        let mut compressor = Compress::new(flate2::Compression::default(), true);
        let payload: Vec<u8> = (0..200_000u32).flat_map(|i| (i % 251).to_le_bytes()).collect();
        let compressed = compress_sync(&mut compressor, &payload);

        let mut stream = ZlibStream::new();
        let inflated = stream.push(&compressed).unwrap().unwrap();
        assert_eq!(inflated, payload);
    }

    #[test]
    fn test_reset_accepts_new_stream() {
        let mut stream = ZlibStream::new();
        let mut compressor = Compress::new(flate2::Compression::default(), true);
        let data = compress_sync(&mut compressor, b"first connection");
        assert_eq!(stream.push(&data).unwrap().as_deref(), Some(&b"first connection"[..]));

        stream.push(&[0x78]).unwrap();
        stream.reset();
        assert_eq!(stream.pending(), 0);

        let mut fresh = Compress::new(flate2::Compression::default(), true);
        let data = compress_sync(&mut fresh, b"second connection");
        assert_eq!(stream.push(&data).unwrap().as_deref(), Some(&b"second connection"[..]));
    }

    #[test]
    fn test_garbage_input_is_an_error() {
        let mut stream = ZlibStream::new();
        let err = stream.push(&[0x12, 0x34, 0x56, 0x00, 0x00, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, CodecError::Decompress { compression: "zlib-stream", .. }));
    }

    #[test]
    fn test_compression_selection() {
        assert_eq!(Compression::default().query_value(), Some("zlib-stream"));
        assert!(Compression::Disabled.decompressor().is_none());
        let decompressor = Compression::ZlibStream.decompressor().unwrap();
        assert!(!decompressor.is_payload_compression());
        let parsed: Compression = serde_json::from_str("\"none\"").unwrap();
        assert_eq!(parsed, Compression::Disabled);
    }
}
