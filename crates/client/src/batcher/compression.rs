use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use synclink_common::error::CommonError;

use crate::error::NetResult;

/// Gzip for batch bodies above a size threshold
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    threshold: usize,
    level: u32,
}

impl Compressor {
    pub fn new(threshold: usize) -> Self {
        Self { threshold, level: 6 }
    }

    pub fn level(mut self, level: u32) -> Self {
        self.level = level.min(9);
        self
    }

    /// Compressed body, or `None` when `data` is at or below the threshold
    pub fn compress_if_needed(&self, data: &[u8]) -> NetResult<Option<Vec<u8>>> {
        if data.len() <= self.threshold {
            return Ok(None);
        }
        self.compress(data).map(Some)
    }

    pub fn compress(&self, data: &[u8]) -> NetResult<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(data)
            .map_err(|e| CommonError::internal(format!("Gzip compression failed: {e}")))?;
        Ok(encoder
            .finish()
            .map_err(|e| CommonError::internal(format!("Gzip finalization failed: {e}")))?)
    }

    pub fn decompress(data: &[u8]) -> NetResult<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| CommonError::internal(format!("Gzip decompression failed: {e}")))?;
        Ok(decompressed)
    }
}
