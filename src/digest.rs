//! Content digests
//!
//! Digests are computed by streaming the input through the configured
//! algorithm, so payload files and fetched containers never have to be held
//! in memory. The algorithm is always passed in, never assumed.

use crate::error::PreservationError;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Read size used when streaming files through a hasher (64KB)
pub const STREAM_BUFFER_SIZE: usize = 64 * 1024;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
}

impl DigestAlgorithm {
    /// Label used in container headers (`sha1`, `sha256`)
    pub fn label(&self) -> &'static str {
        match self {
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }

    /// Length of the hex encoding of a digest
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Sha1 => 40,
            Self::Sha256 => 64,
        }
    }
}

impl Default for DigestAlgorithm {
    fn default() -> Self {
        Self::Sha1
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = PreservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            _ => Err(PreservationError::UnknownValue {
                kind: "digest algorithm",
                value: s.to_string(),
                allowed: "sha1, sha256".to_string(),
            }),
        }
    }
}

/// A computed digest: algorithm plus lowercase hex value
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    pub algorithm: DigestAlgorithm,
    pub value: String,
}

impl Digest {
    pub fn new(algorithm: DigestAlgorithm, value: impl Into<String>) -> Self {
        Self {
            algorithm,
            value: value.into().to_ascii_lowercase(),
        }
    }

    /// Compare two digests, treating hex case as irrelevant
    pub fn matches(&self, other: &Digest) -> bool {
        self.algorithm == other.algorithm && self.value.eq_ignore_ascii_case(&other.value)
    }

    /// Compare against a bare hex string, ignoring case
    pub fn matches_hex(&self, hex_value: &str) -> bool {
        self.value.eq_ignore_ascii_case(hex_value.trim())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.value)
    }
}

impl FromStr for Digest {
    type Err = PreservationError;

    /// Parse the `<algorithm>:<hex>` form used in block digest headers
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, value) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| PreservationError::Format(format!("Malformed digest '{}'", s)))?;
        let algorithm: DigestAlgorithm = algo.parse()?;
        if value.len() != algorithm.hex_len() || hex::decode(value).is_err() {
            return Err(PreservationError::Format(format!(
                "Malformed {} digest value '{}'",
                algorithm, value
            )));
        }
        Ok(Self::new(algorithm, value))
    }
}

/// Incremental hasher over either algorithm
pub enum DigestBuilder {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl DigestBuilder {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        match self {
            Self::Sha1(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
        }
        self
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        match self {
            Self::Sha1(_) => DigestAlgorithm::Sha1,
            Self::Sha256(_) => DigestAlgorithm::Sha256,
        }
    }

    pub fn finalize(self) -> Digest {
        match self {
            Self::Sha1(h) => Digest::new(DigestAlgorithm::Sha1, hex::encode(h.finalize())),
            Self::Sha256(h) => Digest::new(DigestAlgorithm::Sha256, hex::encode(h.finalize())),
        }
    }
}

/// Digest an in-memory payload
pub fn digest_bytes(data: &[u8], algorithm: DigestAlgorithm) -> Digest {
    let mut builder = DigestBuilder::new(algorithm);
    builder.update(data);
    builder.finalize()
}

/// Digest everything a reader yields, returning the digest and byte count
pub async fn digest_reader<R>(
    mut reader: R,
    algorithm: DigestAlgorithm,
) -> Result<(Digest, u64), PreservationError>
where
    R: AsyncRead + Unpin,
{
    let mut builder = DigestBuilder::new(algorithm);
    let mut buf = vec![0u8; STREAM_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        builder.update(&buf[..n]);
        total += n as u64;
    }
    Ok((builder.finalize(), total))
}

/// Digest a file by streaming it from disk
pub async fn digest_file<P: AsRef<Path>>(
    path: P,
    algorithm: DigestAlgorithm,
) -> Result<Digest, PreservationError> {
    let file = File::open(path.as_ref()).await?;
    let (digest, _) = digest_reader(file, algorithm).await?;
    Ok(digest)
}

/// Reader adapter that digests every byte passing through it
pub struct HashingReader<R> {
    inner: R,
    builder: DigestBuilder,
    bytes_read: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R, algorithm: DigestAlgorithm) -> Self {
        Self {
            inner,
            builder: DigestBuilder::new(algorithm),
            bytes_read: 0,
        }
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Digest of everything read so far
    pub fn finish(self) -> (Digest, u64) {
        (self.builder.finalize(), self.bytes_read)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let fresh = &buf.filled()[before..];
            this.builder.update(fresh);
            this.bytes_read += fresh.len() as u64;
        }
        poll
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digests() {
        let sha1 = digest_bytes(b"abc", DigestAlgorithm::Sha1);
        assert_eq!(sha1.value, "a9993e364706816aba3e25717850c26c9cd0d89d");

        let sha256 = digest_bytes(b"abc", DigestAlgorithm::Sha256);
        assert_eq!(
            sha256.value,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_file_digest_is_deterministic() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &data).await.unwrap();

        let first = digest_file(&path, DigestAlgorithm::Sha1).await.unwrap();
        let second = digest_file(&path, DigestAlgorithm::Sha1).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, digest_bytes(&data, DigestAlgorithm::Sha1));
    }

    #[tokio::test]
    async fn test_missing_file_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        let err = digest_file(temp_dir.path().join("nope"), DigestAlgorithm::Sha256)
            .await
            .unwrap_err();
        assert!(matches!(err, PreservationError::Io(_)));
    }

    #[test]
    fn test_parse_and_match_ignores_case() {
        let parsed: Digest = "sha1:A9993E364706816ABA3E25717850C26C9CD0D89D".parse().unwrap();
        let computed = digest_bytes(b"abc", DigestAlgorithm::Sha1);
        assert!(parsed.matches(&computed));
        assert!(computed.matches_hex("A9993E364706816ABA3E25717850C26C9CD0D89D"));
        assert_eq!(computed.to_string(), "sha1:a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("sha1".parse::<Digest>().is_err());
        assert!("md5:abcd".parse::<Digest>().is_err());
        assert!("sha1:zz".parse::<Digest>().is_err());
    }

    #[tokio::test]
    async fn test_hashing_reader_matches_direct_digest() {
        let data = b"streamed through the hashing reader".to_vec();
        let mut reader = HashingReader::new(&data[..], DigestAlgorithm::Sha256);
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        let (digest, count) = reader.finish();
        assert_eq!(count, data.len() as u64);
        assert_eq!(digest, digest_bytes(&data, DigestAlgorithm::Sha256));
    }
}
