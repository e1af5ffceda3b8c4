//! Streaming digests and content-addressed naming.
//!
//! Package files can be arbitrarily large, so every digest here runs over a
//! fixed-size buffer instead of slurping the file. All digests render as
//! lowercase hex.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::Result;

const BUF_SIZE: usize = 64 * 1024;

fn stream_into<D: Digest, R: Read>(mut reader: R) -> Result<(String, u64)> {
    let mut hasher = D::new();
    let mut buf = [0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), total))
}

/// SHA-256 of a file's bytes, plus its size.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    stream_into::<Sha256, _>(File::open(path)?)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha1_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(bytes))
}

pub fn md5_bytes(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

/// All three digests of a file in one pass, for Debian package stanzas.
pub fn digest_file_all(path: &Path) -> Result<(String, String, String, u64)> {
    let mut file = File::open(path)?;
    let mut md5 = Md5::new();
    let mut sha1 = Sha1::new();
    let mut sha256 = Sha256::new();
    let mut buf = [0u8; BUF_SIZE];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha1.update(&buf[..n]);
        sha256.update(&buf[..n]);
        total += n as u64;
    }
    Ok((
        hex::encode(md5.finalize()),
        hex::encode(sha1.finalize()),
        hex::encode(sha256.finalize()),
        total,
    ))
}

/// Content-addressed filename: `<hex-sha256>-<base>`.
pub fn content_addressed_name(sha256: &str, base: &str) -> String {
    format!("{sha256}-{base}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// The streaming digest agrees with the one-shot digest.
    #[test]
    fn streaming_matches_oneshot() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let payload = vec![0xabu8; 200_000];
        file.write_all(&payload).unwrap();
        let (streamed, size) = sha256_file(file.path()).unwrap();
        assert_eq!(streamed, sha256_bytes(&payload));
        assert_eq!(size, payload.len() as u64);
    }

    #[test]
    fn content_address_prefixes_the_digest() {
        let sha = "a".repeat(64);
        assert_eq!(
            content_addressed_name(&sha, "primary.xml.gz"),
            format!("{sha}-primary.xml.gz")
        );
    }
}
