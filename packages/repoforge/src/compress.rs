//! Gzip and bzip2 framing for stored metadata payloads.

use std::io::{Read, Write};

use bzip2::Compression as BzCompression;
use bzip2::read::BzDecoder;
use bzip2::write::BzEncoder;
use flate2::Compression as GzCompression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::Result;

pub fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), GzCompression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn bzip2(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = BzEncoder::new(Vec::new(), BzCompression::best());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

pub fn bunzip2(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = BzDecoder::new(bytes);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_round_trip() {
        let payload = b"<metadata packages=\"0\"></metadata>";
        assert_eq!(gunzip(&gzip(payload).unwrap()).unwrap(), payload);
    }

    #[test]
    fn bzip2_round_trip() {
        let payload = vec![7u8; 100_000];
        assert_eq!(bunzip2(&bzip2(&payload).unwrap()).unwrap(), payload);
    }
}
