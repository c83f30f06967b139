//! Manifestation submission over the event reception endpoints.

use crate::manifest::event::batch_envelope;
use crate::manifest::{EventSigner, EventType, ManifestError, ManifestationEvent};
use crate::sync::XmlStorage;
use crate::utils::only_digits;
use crate::ws::soap::{NS_EVENT_WS, SoapVersion, descendant_text};
use crate::ws::transport::{SoapAttempt, SoapCall, SoapTransport};
use crate::ws::{AttemptRecord, DocumentKey, EndpointResolver, OperationKind};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Operation names seen across event reception deployments, in the order they are tried
pub const OPERATION_VARIANTS: [&str; 4] = [
	"nfeRecepcaoEvento",
	"nfeRecepcaoEvento4",
	"NFeRecepcaoEvento",
	"NFeRecepcaoEvento4",
];

/// `cOrgao` of the national authority
const NATIONAL_ORGAN: &str = "91";

/// What to manifest
#[derive(Debug, Clone)]
pub struct ManifestationRequest {
	pub tax_id: String,
	pub key: DocumentKey,
	pub event_type: EventType,
	pub sequence: u8,
	pub justification: Option<String>,
}

/// Outcome of a submission that reached an endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionResult {
	pub http_status: u16,
	pub status_code: Option<u16>,
	pub status_reason: Option<String>,
	pub protocol: Option<String>,
	pub endpoint: String,
	pub operation: String,
	pub soap_version: SoapVersion,
	#[serde(skip)]
	pub response_xml: String,
	#[serde(skip)]
	pub failed_attempts: Vec<AttemptRecord>,
	/// Set when the 200 answer carried no readable status
	pub parse_error: Option<String>,
	pub artifact_reference: Option<String>,
	pub warnings: Vec<String>,
}

impl SubmissionResult {
	/// 135 (registered) and 136 (registered, not linked) are the accepting answers; 573 means the
	/// same event was already registered.
	pub fn is_accepted(&self) -> bool {
		matches!(self.status_code, Some(135 | 136 | 573))
	}
}

/// Builds, signs and sends manifestation events.
pub struct EventSubmitter {
	transport: Arc<dyn SoapTransport>,
	resolver: Arc<EndpointResolver>,
	storage: Option<Arc<dyn XmlStorage>>,
}

impl EventSubmitter {
	pub fn new(transport: Arc<dyn SoapTransport>, resolver: Arc<EndpointResolver>) -> Self {
		Self {
			transport,
			resolver,
			storage: None,
		}
	}

	/// Store every response through `storage`.
	pub fn with_storage(mut self, storage: Arc<dyn XmlStorage>) -> Self {
		self.storage = Some(storage);
		self
	}

	/// Submit one manifestation event.
	///
	/// The event is signed once per distinct `cOrgao` among the candidate hosts and the signed batch
	/// is reused across operation names and SOAP versions of those hosts.
	///
	/// # Errors
	/// `InvalidTaxId` for a malformed tax id, `Signing` when signing fails, `Protocol` when no attempt
	/// got an HTTP 200.
	pub async fn submit(
		&self,
		request: &ManifestationRequest,
		signer: &EventSigner,
	) -> Result<SubmissionResult, ManifestError> {
		let tax_id = only_digits(&request.tax_id);
		if tax_id.len() != 14 && tax_id.len() != 11 {
			return Err(ManifestError::InvalidTaxId(format!(
				"tax id must have 11 or 14 digits, got {}",
				tax_id.len()
			)));
		}

		let jurisdiction = request.key.jurisdiction();
		let candidates = self
			.resolver
			.candidates(OperationKind::EventReception, Some(jurisdiction));
		let batch_id = chrono::Utc::now().timestamp();

		let mut payloads: HashMap<&str, Arc<String>> = HashMap::new();
		let mut attempts = Vec::new();
		for candidate in &candidates {
			let organ = if candidate.national {
				NATIONAL_ORGAN
			} else {
				jurisdiction
			};
			let payload = match payloads.get(organ) {
				Some(payload) => payload.clone(),
				None => {
					let event = ManifestationEvent::new(
						self.resolver.environment(),
						&tax_id,
						request.key.clone(),
						request.event_type,
						request.sequence,
						organ,
					)
					.with_justification(request.justification.as_deref());
					let payload = Arc::new(batch_envelope(batch_id, &signer.sign(&event)?));
					debug!("Signed event {} for cOrgao {}", event.id(), organ);
					payloads.insert(organ, payload.clone());
					payload
				}
			};

			for operation in OPERATION_VARIANTS {
				for version in &candidate.versions {
					attempts.push(SoapAttempt {
						url: candidate.url.clone(),
						version: *version,
						operation: operation.to_string(),
						service_ns: NS_EVENT_WS,
						payload: payload.clone(),
					});
				}
			}
		}

		info!(
			key = %request.key,
			event = %request.event_type,
			seq = request.sequence,
			"Submitting manifestation over {} attempts",
			attempts.len()
		);

		let started = Instant::now();
		let success = self.transport.send(&SoapCall { attempts }).await?;
		let parsed = parse_event_response(&success.body);

		let mut result = SubmissionResult {
			http_status: 200,
			status_code: None,
			status_reason: None,
			protocol: None,
			endpoint: success.url,
			operation: success.operation,
			soap_version: success.version,
			response_xml: success.body,
			failed_attempts: success.failed_attempts,
			parse_error: None,
			artifact_reference: None,
			warnings: Vec::new(),
		};
		match parsed {
			Ok(status) => {
				result.status_code = Some(status.code);
				result.status_reason = status.reason;
				result.protocol = status.protocol;
			}
			Err(e) => {
				warn!("Event response without status: {}", e);
				result.parse_error = Some(e);
			}
		}

		if let Some(storage) = &self.storage {
			let name = format!(
				"evento_{}_{}_{}",
				request.key, request.event_type, request.sequence
			);
			match storage
				.save_xml(&tax_id, &name, "evento", result.response_xml.as_bytes())
				.await
			{
				Ok(reference) => result.artifact_reference = Some(reference),
				Err(e) => {
					warn!("Could not store event response {}: {}", name, e);
					result.warnings.push(format!("artifact not stored: {e}"));
				}
			}
		}

		info!(
			endpoint = %result.endpoint,
			operation = %result.operation,
			soap = %result.soap_version,
			"Manifestation answered with {:?} {:?} in {:?}",
			result.status_code,
			result.status_reason,
			started.elapsed()
		);
		Ok(result)
	}
}

struct EventStatus {
	code: u16,
	reason: Option<String>,
	protocol: Option<String>,
}

/// Read the event status, preferring `retEvento/infEvento` over the batch-level status.
fn parse_event_response(body: &str) -> Result<EventStatus, String> {
	let doc = roxmltree::Document::parse(body).map_err(|e| format!("response is not XML: {e}"))?;

	let inf_evento = doc
		.descendants()
		.filter(|n| n.tag_name().name() == "retEvento")
		.find_map(|ret| {
			ret.children()
				.find(|n| n.is_element() && n.tag_name().name() == "infEvento")
		})
		.filter(|inf| descendant_text(*inf, "cStat").is_some());

	let scope = inf_evento.unwrap_or_else(|| doc.root());
	let code = descendant_text(scope, "cStat").ok_or_else(|| "no cStat in response".to_string())?;
	let code = code
		.parse()
		.map_err(|_| format!("cStat is not numeric: {code}"))?;

	Ok(EventStatus {
		code,
		reason: descendant_text(scope, "xMotivo"),
		protocol: descendant_text(scope, "nProt"),
	})
}
