//! Recipient manifestation events: construction, XML signature and submission.

pub mod event;
pub mod signer;
pub mod submitter;

use crate::certificate::CertificateError;
use crate::ws::ProtocolError;
use thiserror::Error;

pub use event::{EventType, ManifestationEvent};
pub use signer::EventSigner;
pub use submitter::{EventSubmitter, ManifestationRequest, SubmissionResult};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Invalid document key: {0}")]
    InvalidKey(String),

    #[error("Invalid tax id: {0}")]
    InvalidTaxId(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Certificate(#[from] CertificateError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
