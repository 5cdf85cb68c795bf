//! # Compression Translator
//!
//! Optional stage that shrinks large frames before encryption.
//!
//! Output is prefixed with one flag byte: `0` means the body follows as-is,
//! `1` means it is compressed with the configured [`CompressionKind`]. Payloads
//! below the threshold, or whose sampled entropy suggests they will not shrink,
//! are passed through with flag `0`.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};
use crate::translator::{Translator, TranslatorFactory};
use serde::{Deserialize, Serialize};
use std::io::Read;

const FLAG_RAW: u8 = 0;
const FLAG_COMPRESSED: u8 = 1;

/// Inflated output may not exceed one packet payload
const MAX_DECOMPRESSION_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Bits per byte above which a sample is treated as incompressible
const MIN_ENTROPY_THRESHOLD: f64 = 4.0;
const ENTROPY_SAMPLE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

/// Shannon entropy in bits per byte, 0.0 to 8.0
fn entropy(data: &[u8]) -> f64 {
    if data.is_empty() {
        return 0.0;
    }
    let mut freq = [0u32; 256];
    for &byte in data {
        freq[usize::from(byte)] += 1;
    }
    let len = data.len() as f64;
    freq.iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = f64::from(c) / len;
            -p * p.log2()
        })
        .sum()
}

fn worth_compressing(data: &[u8], threshold: usize) -> bool {
    if data.len() < threshold {
        return false;
    }
    // Short payloads: the size check is enough.
    if data.len() < 1024 {
        return true;
    }
    entropy(&data[..ENTROPY_SAMPLE]) < MIN_ENTROPY_THRESHOLD
}

pub fn compress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Inflates `data`, refusing output larger than [`MAX_DECOMPRESSION_SIZE`]
pub fn decompress(data: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => {
            let header: [u8; 4] = data
                .get(..4)
                .and_then(|h| h.try_into().ok())
                .ok_or(ProtocolError::DecompressionFailure)?;
            // Check the claimed size before lz4_flex allocates for it.
            if u32::from_le_bytes(header) as usize > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| ProtocolError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            let decoder = zstd::stream::Decoder::new(data)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            let mut out = Vec::new();
            decoder
                .take(MAX_DECOMPRESSION_SIZE as u64 + 1)
                .read_to_end(&mut out)
                .map_err(|_| ProtocolError::DecompressionFailure)?;
            if out.len() > MAX_DECOMPRESSION_SIZE {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(out)
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionTranslator {
    kind: CompressionKind,
    threshold: usize,
}

impl CompressionTranslator {
    pub fn new(kind: CompressionKind, threshold: usize) -> Self {
        Self { kind, threshold }
    }
}

impl Translator for CompressionTranslator {
    fn name(&self) -> &'static str {
        "compression"
    }

    fn outbound(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if worth_compressing(data, self.threshold) {
            let compressed = compress(data, self.kind)?;
            if compressed.len() < data.len() {
                let mut out = Vec::with_capacity(compressed.len() + 1);
                out.push(FLAG_COMPRESSED);
                out.extend_from_slice(&compressed);
                return Ok(out);
            }
        }
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(FLAG_RAW);
        out.extend_from_slice(data);
        Ok(out)
    }

    fn inbound(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match data.split_first() {
            Some((&FLAG_RAW, body)) => Ok(body.to_vec()),
            Some((&FLAG_COMPRESSED, body)) => decompress(body, self.kind),
            _ => Err(ProtocolError::DecompressionFailure),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CompressionFactory {
    kind: CompressionKind,
    threshold: usize,
}

impl CompressionFactory {
    pub fn new(kind: CompressionKind, threshold: usize) -> Self {
        Self { kind, threshold }
    }
}

impl TranslatorFactory for CompressionFactory {
    fn create(&self) -> Result<Box<dyn Translator>> {
        Ok(Box::new(CompressionTranslator::new(self.kind, self.threshold)))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_roundtrip_both_kinds() {
        let original = b"frames of the same shape repeat, frames of the same shape repeat".repeat(20);
        for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
            let packed = compress(&original, kind).unwrap();
            assert!(packed.len() < original.len());
            assert_eq!(decompress(&packed, kind).unwrap(), original);
        }
    }

    #[test]
    fn test_lz4_rejects_oversized_claim() {
        let mut bomb = ((MAX_DECOMPRESSION_SIZE + 1) as u32).to_le_bytes().to_vec();
        bomb.extend_from_slice(&[0u8; 16]);
        assert!(decompress(&bomb, CompressionKind::Lz4).is_err());
        assert!(decompress(&[0x2b, 0x60], CompressionKind::Lz4).is_err());
    }

    #[test]
    fn test_entropy_bounds() {
        assert!(entropy(&[0u8; 100]) < 0.1);
        let spread: Vec<u8> = (0..=255).cycle().take(1024).collect();
        assert!(entropy(&spread) > 7.0);
    }

    #[test]
    fn test_translator_small_payload_passes_through() {
        let mut t = CompressionTranslator::new(CompressionKind::Lz4, 512);
        let out = t.outbound(b"tiny").unwrap();
        assert_eq!(out[0], FLAG_RAW);
        assert_eq!(t.inbound(&out).unwrap(), b"tiny");
    }

    #[test]
    fn test_translator_compresses_repetitive_payload() {
        let mut t = CompressionTranslator::new(CompressionKind::Zstd, 512);
        let data = vec![9u8; 4096];
        let out = t.outbound(&data).unwrap();
        assert_eq!(out[0], FLAG_COMPRESSED);
        assert!(out.len() < data.len());
        assert_eq!(t.inbound(&out).unwrap(), data);
    }

    #[test]
    fn test_translator_skips_high_entropy() {
        let mut t = CompressionTranslator::new(CompressionKind::Lz4, 512);
        let data: Vec<u8> = (0..=255).cycle().take(2048).collect();
        let out = t.outbound(&data).unwrap();
        assert_eq!(out[0], FLAG_RAW);
    }

    #[test]
    fn test_translator_rejects_unknown_flag() {
        let mut t = CompressionTranslator::new(CompressionKind::Lz4, 512);
        assert!(t.inbound(&[7, 1, 2]).is_err());
        assert!(t.inbound(&[]).is_err());
    }

    #[test]
    fn test_kind_serde_lowercase() {
        #[derive(Deserialize)]
        struct Holder {
            kind: CompressionKind,
        }
        let h: Holder = toml::from_str("kind = \"zstd\"").unwrap();
        assert_eq!(h.kind, CompressionKind::Zstd);
    }
}
