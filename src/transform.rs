//! Pluggable byte transforms applied to file blocks.
//!
//! A transform sits between raw file bytes and the record framer (on read)
//! or between encoded rows and the output file (on write). Each block is
//! treated as an independent unit, so the gzip and zstd transforms emit one
//! self-contained member/frame per block; both formats concatenate cleanly,
//! and standard tools decompress the resulting files as one stream.
//!
//! Encryption or any other byte-level rewrite plugs in the same way: the
//! pipeline never interprets the bytes a transform returns beyond framing
//! them into records.

use std::io::{Read, Write};

/// Byte-level transform over one block.
///
/// Implementations must be `Send + Sync`; one instance is shared by every
/// reader and writer of a run.
pub trait BlockTransform: Send + Sync {
    /// Human-readable name, used in log lines.
    fn name(&self) -> &str;

    /// Decode one raw block into plain bytes.
    fn decode(&self, raw: &[u8]) -> std::io::Result<Vec<u8>>;

    /// Encode plain bytes into one output block.
    fn encode(&self, plain: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Pass-through transform. The default for uncompressed delimited files.
pub struct IdentityTransform;

impl BlockTransform for IdentityTransform {
    fn name(&self) -> &str {
        "identity"
    }

    fn decode(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }

    fn encode(&self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        Ok(plain.to_vec())
    }
}

#[cfg(feature = "compression-gzip")]
pub struct GzipTransform;

#[cfg(feature = "compression-gzip")]
impl BlockTransform for GzipTransform {
    fn name(&self) -> &str {
        "gzip"
    }

    fn decode(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut decoder = flate2::read::MultiGzDecoder::new(raw);
        let mut plain = Vec::with_capacity(raw.len() * 2);
        decoder.read_to_end(&mut plain)?;
        Ok(plain)
    }

    fn encode(&self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(plain)?;
        encoder.finish()
    }
}

#[cfg(feature = "compression-zstd")]
pub struct ZstdTransform;

#[cfg(feature = "compression-zstd")]
impl BlockTransform for ZstdTransform {
    fn name(&self) -> &str {
        "zstd"
    }

    fn decode(&self, raw: &[u8]) -> std::io::Result<Vec<u8>> {
        zstd::stream::decode_all(raw)
    }

    fn encode(&self, plain: &[u8]) -> std::io::Result<Vec<u8>> {
        zstd::stream::encode_all(plain, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_a_no_op() {
        let transform = IdentityTransform;
        let bytes = b"a,b,c\n1,2,3\n";
        assert_eq!(transform.decode(bytes).unwrap(), bytes);
        assert_eq!(transform.encode(bytes).unwrap(), bytes);
    }

    #[cfg(feature = "compression-gzip")]
    #[test]
    fn gzip_round_trips_and_concatenated_members_decode() {
        let transform = GzipTransform;
        let first = transform.encode(b"alpha\n").unwrap();
        let second = transform.encode(b"beta\n").unwrap();
        let mut joined = first;
        joined.extend_from_slice(&second);
        assert_eq!(transform.decode(&joined).unwrap(), b"alpha\nbeta\n");
    }

    #[cfg(feature = "compression-zstd")]
    #[test]
    fn zstd_round_trips() {
        let transform = ZstdTransform;
        let encoded = transform.encode(b"gamma\ndelta\n").unwrap();
        assert_eq!(transform.decode(&encoded).unwrap(), b"gamma\ndelta\n");
    }
}
