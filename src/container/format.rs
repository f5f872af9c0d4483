//! Container entry layout
//!
//! Containers follow the WARC 1.0 record layout:
//!
//! ```text
//! WARC/1.0\r\n
//! WARC-Type: resource\r\n
//! WARC-Record-ID: <urn:uuid:...>\r\n
//! WARC-Date: 2026-01-01T00:00:00Z\r\n
//! Content-Type: application/octet-stream\r\n
//! Content-Length: 1234\r\n
//! WARC-Block-Digest: sha1:<hex>\r\n
//! \r\n
//! <payload bytes>\r\n\r\n
//! ```
//!
//! A container starts with one `warcinfo` entry followed by `resource` /
//! `metadata` pairs. Metadata entries carry `WARC-Refers-To` pointing at the
//! resource entry written immediately before them.

use crate::digest::Digest;
use crate::error::PreservationError;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const VERSION_LINE: &str = "WARC/1.0";
pub const CRLF: &[u8] = b"\r\n";
/// Bytes following every payload
pub const ENTRY_TERMINATOR: &[u8] = b"\r\n\r\n";
/// Content type of transformed metadata entries
pub const METADATA_CONTENT_TYPE: &str = "text/xml";
/// Content type of the info entry payload
pub const INFO_CONTENT_TYPE: &str = "application/warc-fields";
/// Longest header line accepted when reading
pub const MAX_HEADER_LINE: u64 = 8 * 1024;

pub const HEADER_TYPE: &str = "WARC-Type";
pub const HEADER_RECORD_ID: &str = "WARC-Record-ID";
pub const HEADER_DATE: &str = "WARC-Date";
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
pub const HEADER_CONTENT_LENGTH: &str = "Content-Length";
pub const HEADER_BLOCK_DIGEST: &str = "WARC-Block-Digest";
pub const HEADER_REFERS_TO: &str = "WARC-Refers-To";
pub const HEADER_FILENAME: &str = "WARC-Filename";

/// Kind of container entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Info,
    Content,
    Metadata,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "warcinfo",
            Self::Content => "resource",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryKind {
    type Err = PreservationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warcinfo" => Ok(Self::Info),
            "resource" => Ok(Self::Content),
            "metadata" => Ok(Self::Metadata),
            other => Err(PreservationError::Format(format!("Unknown entry type '{}'", other))),
        }
    }
}

/// `<urn:uuid:...>` form used for entry identifiers
pub fn entry_uri(id: &Uuid) -> String {
    format!("<urn:uuid:{}>", id)
}

/// Parse an entry identifier written by [`entry_uri`]
pub fn parse_entry_uri(value: &str) -> Result<Uuid, PreservationError> {
    let inner = value
        .trim()
        .strip_prefix("<urn:uuid:")
        .and_then(|v| v.strip_suffix('>'))
        .ok_or_else(|| PreservationError::Format(format!("Malformed entry id '{}'", value)))?;
    Uuid::parse_str(inner)
        .map_err(|e| PreservationError::Format(format!("Malformed entry id '{}': {}", value, e)))
}

/// Header block of one entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    pub id: Uuid,
    pub date: DateTime<Utc>,
    pub content_type: String,
    pub content_length: u64,
    pub block_digest: Digest,
    /// Content entry this entry describes (metadata entries only)
    pub refers_to: Option<Uuid>,
    /// Container file name (info entry only)
    pub filename: Option<String>,
    /// Any further headers, in order
    pub extra: Vec<(String, String)>,
}

impl EntryHeader {
    pub fn new(
        kind: EntryKind,
        id: Uuid,
        content_type: impl Into<String>,
        content_length: u64,
        block_digest: Digest,
    ) -> Self {
        Self {
            kind,
            id,
            // Whole seconds keep every header the same width
            date: DateTime::from_timestamp(Utc::now().timestamp(), 0).unwrap_or_default(),
            content_type: content_type.into(),
            content_length,
            block_digest,
            refers_to: None,
            filename: None,
            extra: Vec::new(),
        }
    }

    pub fn refers_to(mut self, id: Uuid) -> Self {
        self.refers_to = Some(id);
        self
    }

    pub fn filename(mut self, name: impl Into<String>) -> Self {
        self.filename = Some(name.into());
        self
    }

    pub fn extra(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.push((name.into(), value.into()));
        self
    }

    /// Look up an extra header by name (case-insensitive)
    pub fn extra_value(&self, name: &str) -> Option<&str> {
        self.extra
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Encode the header block, including the blank separator line
    pub fn encode(&self) -> Vec<u8> {
        let mut out = String::with_capacity(256);
        out.push_str(VERSION_LINE);
        out.push_str("\r\n");
        push_header(&mut out, HEADER_TYPE, self.kind.as_str());
        push_header(&mut out, HEADER_RECORD_ID, &entry_uri(&self.id));
        push_header(
            &mut out,
            HEADER_DATE,
            &self.date.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
        push_header(&mut out, HEADER_CONTENT_TYPE, &self.content_type);
        push_header(&mut out, HEADER_CONTENT_LENGTH, &self.content_length.to_string());
        push_header(&mut out, HEADER_BLOCK_DIGEST, &self.block_digest.to_string());
        if let Some(target) = &self.refers_to {
            push_header(&mut out, HEADER_REFERS_TO, &entry_uri(target));
        }
        if let Some(name) = &self.filename {
            push_header(&mut out, HEADER_FILENAME, name);
        }
        for (name, value) in &self.extra {
            push_header(&mut out, name, value);
        }
        out.push_str("\r\n");
        out.into_bytes()
    }

    /// Total bytes this entry occupies in a container
    pub fn encoded_entry_len(&self) -> u64 {
        self.encode().len() as u64 + self.content_length + ENTRY_TERMINATOR.len() as u64
    }

    /// Build a header from parsed `name: value` lines
    pub fn from_fields(fields: Vec<(String, String)>) -> Result<Self, PreservationError> {
        let mut kind = None;
        let mut id = None;
        let mut date = None;
        let mut content_type = None;
        let mut content_length = None;
        let mut block_digest = None;
        let mut refers_to = None;
        let mut filename = None;
        let mut extra = Vec::new();

        for (name, value) in fields {
            match name.as_str() {
                HEADER_TYPE => kind = Some(value.parse::<EntryKind>()?),
                HEADER_RECORD_ID => id = Some(parse_entry_uri(&value)?),
                HEADER_DATE => {
                    date = Some(
                        DateTime::parse_from_rfc3339(&value)
                            .map_err(|e| {
                                PreservationError::Format(format!("Bad date '{}': {}", value, e))
                            })?
                            .with_timezone(&Utc),
                    )
                }
                HEADER_CONTENT_TYPE => content_type = Some(value),
                HEADER_CONTENT_LENGTH => {
                    content_length = Some(value.parse::<u64>().map_err(|e| {
                        PreservationError::Format(format!("Bad content length '{}': {}", value, e))
                    })?)
                }
                HEADER_BLOCK_DIGEST => block_digest = Some(value.parse::<Digest>()?),
                HEADER_REFERS_TO => refers_to = Some(parse_entry_uri(&value)?),
                HEADER_FILENAME => filename = Some(value),
                _ => extra.push((name, value)),
            }
        }

        let missing = |header: &str| PreservationError::Format(format!("Missing header {}", header));
        Ok(Self {
            kind: kind.ok_or_else(|| missing(HEADER_TYPE))?,
            id: id.ok_or_else(|| missing(HEADER_RECORD_ID))?,
            date: date.ok_or_else(|| missing(HEADER_DATE))?,
            content_type: content_type.ok_or_else(|| missing(HEADER_CONTENT_TYPE))?,
            content_length: content_length.ok_or_else(|| missing(HEADER_CONTENT_LENGTH))?,
            block_digest: block_digest.ok_or_else(|| missing(HEADER_BLOCK_DIGEST))?,
            refers_to,
            filename,
            extra,
        })
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// Split one header line into name and value
pub fn parse_header_line(line: &str) -> Result<(String, String), PreservationError> {
    let (name, value) = line
        .split_once(':')
        .ok_or_else(|| PreservationError::Format(format!("Malformed header line '{}'", line)))?;
    Ok((name.trim().to_string(), value.trim().to_string()))
}

/// `application/warc-fields` payload of the info entry
pub fn info_payload(agent: &str, container_name: &str) -> Vec<u8> {
    format!(
        "software: {}\r\nformat: WARC File Format 1.0\r\nconformsTo: http://bibnum.bnf.fr/WARC/WARC_ISO_28500_version1_latestdraft.pdf\r\ndescription: {}\r\n",
        agent, container_name
    )
    .into_bytes()
}
