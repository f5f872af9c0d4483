//! Streaming container reader
//!
//! Reads entry headers one at a time from any buffered byte stream. Payloads
//! are skipped or digested as they stream past, so a container is never held
//! in memory regardless of its size.

use super::format::{
    parse_header_line, EntryHeader, EntryKind, ENTRY_TERMINATOR, MAX_HEADER_LINE, VERSION_LINE,
};
use crate::digest::{digest_reader, Digest, DigestAlgorithm};
use crate::error::PreservationError;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use uuid::Uuid;

/// Result of re-verifying one entry's payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCheck {
    pub header: EntryHeader,
    /// Bytes actually present for the payload
    pub actual_length: u64,
    /// Digest recomputed over the payload with the header's algorithm
    pub computed_digest: Digest,
}

impl EntryCheck {
    /// Payload length and digest agree with the entry's own header
    pub fn is_intact(&self) -> bool {
        self.actual_length == self.header.content_length
            && self.computed_digest.matches(&self.header.block_digest)
    }
}

/// Sequential reader over a container byte stream
pub struct ContainerReader<R> {
    inner: R,
    /// Payload bytes of the current entry not yet consumed
    pending: Option<u64>,
    entries_read: u64,
}

impl ContainerReader<BufReader<File>> {
    /// Open a local container file
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, PreservationError> {
        let file = File::open(path.as_ref()).await?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: AsyncBufRead + Unpin> ContainerReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            pending: None,
            entries_read: 0,
        }
    }

    pub fn entries_read(&self) -> u64 {
        self.entries_read
    }

    /// Consume the reader, returning the underlying stream
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read the next entry header. Any unread payload of the previous entry
    /// is skipped first. Returns `None` at a clean end of stream.
    pub async fn next_header(&mut self) -> Result<Option<EntryHeader>, PreservationError> {
        if self.pending.is_some() {
            self.skip_payload().await?;
        }

        let first = match self.read_line().await? {
            None => return Ok(None),
            Some(line) => line,
        };
        if first != VERSION_LINE {
            return Err(PreservationError::Format(format!(
                "Expected '{}' at entry {}, found '{}'",
                VERSION_LINE, self.entries_read, first
            )));
        }

        let mut fields = Vec::new();
        loop {
            match self.read_line().await? {
                None => {
                    return Err(PreservationError::Format(
                        "Stream ended inside an entry header".to_string(),
                    ))
                }
                Some(line) if line.is_empty() => break,
                Some(line) => fields.push(parse_header_line(&line)?),
            }
        }

        let header = EntryHeader::from_fields(fields)?;
        self.pending = Some(header.content_length);
        self.entries_read += 1;
        Ok(Some(header))
    }

    /// Skip the current entry's payload
    pub async fn skip_payload(&mut self) -> Result<u64, PreservationError> {
        let length = self.take_pending()?;
        let mut payload = (&mut self.inner).take(length);
        let copied = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await?;
        self.finish_payload(length, copied).await?;
        Ok(copied)
    }

    /// Stream the current entry's payload through a digest
    pub async fn digest_payload(
        &mut self,
        algorithm: DigestAlgorithm,
    ) -> Result<(Digest, u64), PreservationError> {
        let length = self.take_pending()?;
        let payload = (&mut self.inner).take(length);
        let (digest, copied) = digest_reader(payload, algorithm).await?;
        self.finish_payload(length, copied).await?;
        Ok((digest, copied))
    }

    /// Read the current entry's payload into memory (small entries only)
    pub async fn read_payload(&mut self) -> Result<Vec<u8>, PreservationError> {
        let length = self.take_pending()?;
        let mut data = Vec::with_capacity(length.min(1024 * 1024) as usize);
        let copied = (&mut self.inner).take(length).read_to_end(&mut data).await? as u64;
        self.finish_payload(length, copied).await?;
        Ok(data)
    }

    /// Re-verify the current entry's payload against its header
    pub async fn check_payload(
        &mut self,
        header: &EntryHeader,
    ) -> Result<EntryCheck, PreservationError> {
        let (computed_digest, actual_length) =
            self.digest_payload(header.block_digest.algorithm).await?;
        Ok(EntryCheck {
            header: header.clone(),
            actual_length,
            computed_digest,
        })
    }

    /// Advance to the entry with the given identifier, leaving its payload
    /// unread. Returns `None` when the stream ends without it.
    pub async fn find_entry(&mut self, id: &Uuid) -> Result<Option<EntryHeader>, PreservationError> {
        while let Some(header) = self.next_header().await? {
            if header.id == *id {
                return Ok(Some(header));
            }
        }
        Ok(None)
    }

    /// Read every remaining entry, checking each payload
    pub async fn check_all(&mut self) -> Result<Vec<EntryCheck>, PreservationError> {
        let mut checks = Vec::new();
        while let Some(header) = self.next_header().await? {
            checks.push(self.check_payload(&header).await?);
        }
        Ok(checks)
    }

    /// Skip whatever is left of the stream
    pub async fn drain(&mut self) -> Result<(), PreservationError> {
        if self.pending.is_some() {
            self.skip_payload().await?;
        }
        tokio::io::copy(&mut self.inner, &mut tokio::io::sink()).await?;
        Ok(())
    }

    fn take_pending(&mut self) -> Result<u64, PreservationError> {
        self.pending
            .take()
            .ok_or_else(|| PreservationError::Format("No entry payload to read".to_string()))
    }

    async fn finish_payload(&mut self, expected: u64, copied: u64) -> Result<(), PreservationError> {
        if copied != expected {
            return Err(PreservationError::Format(format!(
                "Truncated payload: expected {} bytes, found {}",
                expected, copied
            )));
        }
        let mut terminator = [0u8; 4];
        self.inner.read_exact(&mut terminator).await.map_err(|e| {
            PreservationError::Format(format!("Missing entry terminator: {}", e))
        })?;
        if &terminator[..] != ENTRY_TERMINATOR {
            return Err(PreservationError::Format(
                "Entry payload is not followed by its terminator".to_string(),
            ));
        }
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>, PreservationError> {
        let mut buf = Vec::new();
        let n = (&mut self.inner)
            .take(MAX_HEADER_LINE)
            .read_until(b'\n', &mut buf)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            return Err(PreservationError::Format(
                "Header line is unterminated or too long".to_string(),
            ));
        }
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|e| PreservationError::Format(format!("Header is not UTF-8: {}", e)))
    }
}

/// Whether an entry is of a given kind and has the given id
pub fn is_entry(header: &EntryHeader, kind: EntryKind, id: &Uuid) -> bool {
    header.kind == kind && header.id == *id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerPacker, PackerSettings};
    use crate::record::Record;
    use tempfile::TempDir;

    async fn packed_container(dir: &Path) -> (std::path::PathBuf, Vec<Record>) {
        let packer = ContainerPacker::create(dir.join("containers"), "books", PackerSettings::default())
            .await
            .unwrap();
        let mut records = Vec::new();
        for (i, payload) in [&b"alpha"[..], &b"beta beta"[..], &b"gamma"[..]].iter().enumerate() {
            let path = dir.join(format!("{}.bin", i));
            tokio::fs::write(&path, payload).await.unwrap();
            let record = Record::new(Uuid::new_v4(), "photos", "books", path);
            packer.pack_record(&record, b"<mets/>").await.unwrap();
            records.push(record);
        }
        let handle = packer.close().await.unwrap();
        (handle.path, records)
    }

    #[tokio::test]
    async fn test_find_entry_skips_to_target() {
        let temp_dir = TempDir::new().unwrap();
        let (path, records) = packed_container(temp_dir.path()).await;

        let mut reader = ContainerReader::open(&path).await.unwrap();
        let header = reader.find_entry(&records[1].id).await.unwrap().unwrap();
        assert!(is_entry(&header, EntryKind::Content, &records[1].id));
        assert_eq!(reader.read_payload().await.unwrap(), b"beta beta");

        let next = reader.next_header().await.unwrap().unwrap();
        assert_eq!(next.kind, EntryKind::Metadata);
        assert_eq!(next.refers_to, Some(records[1].id));
    }

    #[tokio::test]
    async fn test_find_missing_entry_returns_none() {
        let temp_dir = TempDir::new().unwrap();
        let (path, _) = packed_container(temp_dir.path()).await;

        let mut reader = ContainerReader::open(&path).await.unwrap();
        assert!(reader.find_entry(&Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(reader.entries_read(), 7);
    }

    #[tokio::test]
    async fn test_tampered_payload_fails_check() {
        let temp_dir = TempDir::new().unwrap();
        let (path, records) = packed_container(temp_dir.path()).await;

        let mut bytes = tokio::fs::read(&path).await.unwrap();
        let pos = bytes.windows(5).position(|w| w == b"gamma").unwrap();
        bytes[pos] = b'G';

        let mut reader = ContainerReader::new(&bytes[..]);
        let header = reader.find_entry(&records[2].id).await.unwrap().unwrap();
        let check = reader.check_payload(&header).await.unwrap();
        assert_eq!(check.actual_length, 5);
        assert!(!check.is_intact());
    }

    #[tokio::test]
    async fn test_truncated_stream_is_format_error() {
        let temp_dir = TempDir::new().unwrap();
        let (path, _) = packed_container(temp_dir.path()).await;

        let bytes = tokio::fs::read(&path).await.unwrap();
        let truncated = &bytes[..bytes.len() - 10];
        let mut reader = ContainerReader::new(truncated);
        let err = reader.check_all().await.unwrap_err();
        assert!(matches!(err, PreservationError::Format(_)));
    }

    #[tokio::test]
    async fn test_not_a_container() {
        let mut reader = ContainerReader::new(&b"GIF89a\r\n\r\n"[..]);
        assert!(matches!(
            reader.next_header().await,
            Err(PreservationError::Format(_))
        ));
    }
}
