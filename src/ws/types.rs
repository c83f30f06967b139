//! Wire types for the distribution and event reception services

use crate::codec::CodecError;
use crate::ws::soap::SoapVersion;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Distribution sequence number, the cursor unit of progress.
///
/// Always rendered as 15 zero-padded decimal digits on the wire and in storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nsu(u64);

impl Nsu {
    pub const ZERO: Nsu = Nsu(0);
    /// Largest value representable in 15 digits
    pub const MAX: u64 = 999_999_999_999_999;

    pub fn new(value: u64) -> Self {
        Self(value.min(Self::MAX))
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    /// Parse whatever the service put in an NSU field: non-digits are dropped and only the first
    /// 15 digits are kept. Empty input yields `None`.
    pub fn parse_lenient(raw: &str) -> Option<Self> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).take(15).collect();
        if digits.is_empty() {
            return None;
        }
        digits.parse().ok().map(Nsu)
    }
}

impl fmt::Display for Nsu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:015}", self.0)
    }
}

impl FromStr for Nsu {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 15 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("invalid NSU: {s:?}"));
        }
        s.parse().map(Nsu).map_err(|e| format!("invalid NSU {s:?}: {e}"))
    }
}

impl From<u64> for Nsu {
    fn from(value: u64) -> Self {
        Nsu::new(value)
    }
}

impl Serialize for Nsu {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Nsu {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// 44-digit access key of a fiscal document
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentKey(String);

impl DocumentKey {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        (raw.len() == 44 && raw.chars().all(|c| c.is_ascii_digit())).then(|| Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Two-digit code of the issuing jurisdiction (UF), e.g. `35` for São Paulo
    pub fn jurisdiction(&self) -> &str {
        &self.0[..2]
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DocumentKey::parse(&value).ok_or_else(|| format!("invalid document key: {value:?}"))
    }
}

impl From<DocumentKey> for String {
    fn from(key: DocumentKey) -> Self {
        key.0
    }
}

/// Payload shape of a distributed item, classified from its `schema` attribute
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchemaKind {
    /// Authorized invoice with protocol (`procNFe`)
    FullDocument,
    /// Invoice summary (`resNFe`)
    Summary,
    /// Event with protocol (`procEventoNFe`)
    Event,
    /// Event summary (`resEvento`)
    SummarizedEvent,
    /// Anything else the service may start sending
    Other(String),
}

impl SchemaKind {
    pub fn from_schema(schema: &str) -> Self {
        if schema.starts_with("procEvento") {
            SchemaKind::Event
        } else if schema.starts_with("procNFe") {
            SchemaKind::FullDocument
        } else if schema.starts_with("resNFe") {
            SchemaKind::Summary
        } else if schema.starts_with("resEvento") {
            SchemaKind::SummarizedEvent
        } else {
            let name = schema.split('_').next().unwrap_or(schema);
            SchemaKind::Other(name.to_string())
        }
    }

    /// Short label used in counters and storage paths
    pub fn label(&self) -> &str {
        match self {
            SchemaKind::FullDocument => "procNFe",
            SchemaKind::Summary => "resNFe",
            SchemaKind::Event => "procEventoNFe",
            SchemaKind::SummarizedEvent => "resEvento",
            SchemaKind::Other(name) => name,
        }
    }
}

/// One `docZip` item of a distribution response
#[derive(Debug, Clone)]
pub struct DistributedItem {
    pub nsu: Nsu,
    /// Raw schema attribute, e.g. `resNFe_v1.01.xsd`
    pub schema: String,
    pub kind: SchemaKind,
    /// Decoded XML, or the codec failure for this item only
    pub content: Result<Vec<u8>, CodecError>,
}

impl DistributedItem {
    /// Document key found in the decoded XML (`chNFe`), if any.
    pub fn document_key(&self) -> Option<DocumentKey> {
        let bytes = self.content.as_ref().ok()?;
        let text = std::str::from_utf8(bytes).ok()?;
        let doc = roxmltree::Document::parse(text).ok()?;
        doc.descendants()
            .find(|n| n.tag_name().name() == "chNFe")
            .and_then(|n| n.text())
            .and_then(DocumentKey::parse)
    }
}

/// Service-declared outcome of a distribution exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    /// 138
    DocumentsFound,
    /// 137
    NoDocuments,
    /// 108, 109
    Outage,
    /// 656
    Throttled,
    Other(u16),
}

impl ServiceStatus {
    pub fn from_code(code: u16) -> Self {
        match code {
            138 => ServiceStatus::DocumentsFound,
            137 => ServiceStatus::NoDocuments,
            108 | 109 => ServiceStatus::Outage,
            656 => ServiceStatus::Throttled,
            other => ServiceStatus::Other(other),
        }
    }
}

/// Parsed `retDistDFeInt` plus where it came from
#[derive(Debug, Clone)]
pub struct DistributionResponse {
    pub status_code: u16,
    pub status_reason: String,
    /// `ultNSU`: the cursor to send on the next pull
    pub cursor_after: Nsu,
    /// `maxNSU`: highest NSU currently available for this taxpayer
    pub max_cursor_after: Nsu,
    pub items: Vec<DistributedItem>,
    pub endpoint: String,
    pub soap_version: SoapVersion,
    pub elapsed: Duration,
}

/// Result of a single distribution exchange
pub type ExchangeResult = DistributionResponse;

impl DistributionResponse {
    pub fn status(&self) -> ServiceStatus {
        ServiceStatus::from_code(self.status_code)
    }

    /// Item counts per schema label
    pub fn counts_by_schema(&self) -> std::collections::BTreeMap<String, usize> {
        let mut counts = std::collections::BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.kind.label().to_string()).or_insert(0) += 1;
        }
        counts
    }
}

/// Outcome of a single endpoint/version attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Service answered with a non-200 HTTP status
    Status(u16),
    /// No HTTP answer (connect, TLS, timeout)
    Network(String),
}

/// One failed attempt of the transport matrix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub url: String,
    pub version: SoapVersion,
    pub operation: String,
    pub outcome: AttemptOutcome,
}

impl AttemptRecord {
    fn is_transient(&self) -> bool {
        match self.outcome {
            AttemptOutcome::Network(_) => true,
            AttemptOutcome::Status(status) => status >= 500,
        }
    }
}

impl fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            AttemptOutcome::Status(status) => write!(
                f,
                "{} {} [{}] -> HTTP {}",
                self.url, self.operation, self.version, status
            ),
            AttemptOutcome::Network(detail) => write!(
                f,
                "{} {} [{}] -> {}",
                self.url, self.operation, self.version, detail
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("All endpoint candidates failed ({} attempts)", attempts.len())]
    TransportFailure { attempts: Vec<AttemptRecord> },

    #[error("Network failure on every endpoint candidate ({} attempts)", attempts.len())]
    Network { attempts: Vec<AttemptRecord> },

    #[error("Unparsable response: {0}")]
    UnparsableResponse(String),

    #[error("Invalid request or configuration: {0}")]
    Config(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

impl ProtocolError {
    /// Classify an exhausted attempt log. Only connection-level failures and 5xx answers on every
    /// candidate count as transient; any 4xx makes the failure terminal for this cycle.
    pub fn from_attempts(attempts: Vec<AttemptRecord>) -> Self {
        if !attempts.is_empty() && attempts.iter().all(AttemptRecord::is_transient) {
            ProtocolError::Network { attempts }
        } else {
            ProtocolError::TransportFailure { attempts }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProtocolError::Network { .. })
    }

    /// Short machine-readable kind for summaries
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::TransportFailure { .. } => "transport_failure",
            ProtocolError::Network { .. } => "network",
            ProtocolError::UnparsableResponse(_) => "unparsable_response",
            ProtocolError::Config(_) => "config",
            ProtocolError::Http(_) => "http",
        }
    }
}
