//! Protocol transport: runs a SOAP call over an ordered endpoint/version matrix.
//!
//! Two strategies implement [`SoapTransport`]: [`ManualTransport`] builds envelopes by hand and walks
//! the candidate matrix, [`WsdlTransport`] first tries the binding address advertised by the service
//! WSDL and then falls through to the manual matrix. Raw HTTP goes through the [`HttpExchange`] seam so
//! the whole policy can be exercised without a network.

use crate::certificate::IdentityMaterial;
use crate::config::DfeConfig;
use crate::ws::soap::{self, SoapVersion};
use crate::ws::types::{AttemptOutcome, AttemptRecord, ProtocolError};
use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

const NS_WSDL_SOAP11: &str = "http://schemas.xmlsoap.org/wsdl/soap/";
const NS_WSDL_SOAP12: &str = "http://schemas.xmlsoap.org/wsdl/soap12/";

/// Raw HTTP answer
#[derive(Debug, Clone)]
pub struct HttpReply {
	pub status: u16,
	pub body: String,
}

/// Connection-level failure (no HTTP answer at all)
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ExchangeError(pub String);

/// Minimal HTTP surface the transport needs
#[async_trait]
pub trait HttpExchange: Send + Sync {
	async fn post(
		&self,
		url: &str,
		headers: &[(&'static str, String)],
		body: String,
	) -> Result<HttpReply, ExchangeError>;

	async fn get(&self, url: &str) -> Result<HttpReply, ExchangeError>;
}

/// Mutual-TLS HTTP client bound to one identity.
///
/// Holds a copy of the key material inside the TLS stack, so it shares the identity's lifecycle:
/// build one per cycle or call and drop it afterwards.
pub struct ReqwestExchange {
	client: Client,
}

impl ReqwestExchange {
	/// Create a client presenting `identity` and trusting the configured extra CA bundle.
	pub fn new(identity: &IdentityMaterial, config: &DfeConfig) -> Result<Self, ProtocolError> {
		let tls_identity = Identity::from_pkcs8_pem(
			identity.cert_chain_pem().as_bytes(),
			identity.private_key_pem().as_bytes(),
		)?;

		let mut builder = Client::builder()
			.timeout(config.http_timeout)
			.identity(tls_identity);

		if let Some(path) = &config.ca_bundle {
			let bundle = std::fs::read(path).map_err(|e| {
				ProtocolError::Config(format!("cannot read CA bundle {}: {e}", path.display()))
			})?;
			let blocks = pem::parse_many(&bundle)
				.map_err(|e| ProtocolError::Config(format!("invalid CA bundle: {e}")))?;
			for block in blocks.iter().filter(|b| b.tag() == "CERTIFICATE") {
				builder = builder.add_root_certificate(Certificate::from_der(block.contents())?);
			}
			debug!("Loaded {} extra root certificates", blocks.len());
		}

		Ok(Self {
			client: builder.build()?,
		})
	}
}

#[async_trait]
impl HttpExchange for ReqwestExchange {
	async fn post(
		&self,
		url: &str,
		headers: &[(&'static str, String)],
		body: String,
	) -> Result<HttpReply, ExchangeError> {
		let mut request = self.client.post(url).body(body);
		for (name, value) in headers {
			request = request.header(*name, value);
		}
		let response = request
			.send()
			.await
			.map_err(|e| ExchangeError(e.to_string()))?;
		let status = response.status().as_u16();
		let body = response
			.text()
			.await
			.map_err(|e| ExchangeError(e.to_string()))?;
		Ok(HttpReply { status, body })
	}

	async fn get(&self, url: &str) -> Result<HttpReply, ExchangeError> {
		let response = self
			.client
			.get(url)
			.send()
			.await
			.map_err(|e| ExchangeError(e.to_string()))?;
		let status = response.status().as_u16();
		let body = response
			.text()
			.await
			.map_err(|e| ExchangeError(e.to_string()))?;
		Ok(HttpReply { status, body })
	}
}

/// One cell of the attempt matrix
#[derive(Debug, Clone)]
pub struct SoapAttempt {
	pub url: String,
	pub version: SoapVersion,
	pub operation: String,
	pub service_ns: &'static str,
	/// Payload document placed in `nfeDadosMsg`; shared between attempts that send the same body
	pub payload: Arc<String>,
}

/// An ordered attempt matrix for one logical call
#[derive(Debug, Clone, Default)]
pub struct SoapCall {
	pub attempts: Vec<SoapAttempt>,
}

impl SoapCall {
	/// Matrix of `urls` x `versions` for a single operation and payload.
	pub fn over<'a>(
		candidates: impl IntoIterator<Item = (&'a str, &'a [SoapVersion])>,
		service_ns: &'static str,
		operation: &str,
		payload: String,
	) -> Self {
		let payload = Arc::new(payload);
		let attempts = candidates
			.into_iter()
			.flat_map(|(url, versions)| {
				let payload = payload.clone();
				versions.iter().map(move |version| SoapAttempt {
					url: url.to_string(),
					version: *version,
					operation: operation.to_string(),
					service_ns,
					payload: payload.clone(),
				})
			})
			.collect();
		Self { attempts }
	}
}

/// First HTTP 200 of a call
#[derive(Debug, Clone)]
pub struct SoapSuccess {
	pub url: String,
	pub version: SoapVersion,
	pub operation: String,
	pub body: String,
	/// Attempts that failed before this one, in order
	pub failed_attempts: Vec<AttemptRecord>,
}

/// Strategy executing a SOAP call
#[async_trait]
pub trait SoapTransport: Send + Sync {
	/// Execute `call`, stopping at the first HTTP 200.
	///
	/// # Errors
	/// `ProtocolError::Network` or `ProtocolError::TransportFailure` (classified from the attempt
	/// log) when every attempt fails.
	async fn send(&self, call: &SoapCall) -> Result<SoapSuccess, ProtocolError>;
}

/// Hand-built envelopes over the full candidate matrix
#[derive(Clone)]
pub struct ManualTransport {
	http: Arc<dyn HttpExchange>,
}

impl ManualTransport {
	pub fn new(http: Arc<dyn HttpExchange>) -> Self {
		Self { http }
	}

	/// Run one attempt; `Ok(body)` on HTTP 200, the failure record otherwise.
	async fn try_attempt(&self, attempt: &SoapAttempt) -> Result<String, AttemptRecord> {
		let envelope = soap::build_envelope(
			attempt.version,
			attempt.service_ns,
			&attempt.operation,
			&attempt.payload,
		);
		let headers = soap::headers(attempt.version, attempt.service_ns, &attempt.operation);

		let outcome = match self.http.post(&attempt.url, &headers, envelope).await {
			Ok(reply) if reply.status == 200 => return Ok(reply.body),
			Ok(reply) => {
				warn!(
					url = %attempt.url,
					soap = %attempt.version,
					operation = %attempt.operation,
					"HTTP {}",
					reply.status
				);
				debug!("Response body: {}", truncate_body(&reply.body));
				AttemptOutcome::Status(reply.status)
			}
			Err(e) => {
				warn!(
					url = %attempt.url,
					soap = %attempt.version,
					operation = %attempt.operation,
					"Request failed: {}",
					e
				);
				AttemptOutcome::Network(e.to_string())
			}
		};

		Err(AttemptRecord {
			url: attempt.url.clone(),
			version: attempt.version,
			operation: attempt.operation.clone(),
			outcome,
		})
	}

	async fn run(
		&self,
		attempts: &[SoapAttempt],
		mut failed: Vec<AttemptRecord>,
	) -> Result<SoapSuccess, ProtocolError> {
		for attempt in attempts {
			match self.try_attempt(attempt).await {
				Ok(body) => {
					debug!(
						"SOAP {} {} accepted by {} after {} failed attempts",
						attempt.version,
						attempt.operation,
						attempt.url,
						failed.len()
					);
					return Ok(SoapSuccess {
						url: attempt.url.clone(),
						version: attempt.version,
						operation: attempt.operation.clone(),
						body,
						failed_attempts: failed,
					});
				}
				Err(record) => failed.push(record),
			}
		}

		Err(ProtocolError::from_attempts(failed))
	}
}

#[async_trait]
impl SoapTransport for ManualTransport {
	async fn send(&self, call: &SoapCall) -> Result<SoapSuccess, ProtocolError> {
		self.run(&call.attempts, Vec::new()).await
	}
}

/// Binding advertised by a service WSDL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsdlBinding {
	pub address: String,
	pub version: SoapVersion,
}

/// WSDL-introspected binding first, manual matrix as fallback.
///
/// Introspection runs once per transport; a failed introspection is remembered and the transport
/// behaves exactly like [`ManualTransport`].
pub struct WsdlTransport {
	manual: ManualTransport,
	http: Arc<dyn HttpExchange>,
	wsdl_url: Option<String>,
	local_path: Option<PathBuf>,
	binding: OnceCell<Option<WsdlBinding>>,
}

impl WsdlTransport {
	pub fn new(
		http: Arc<dyn HttpExchange>,
		wsdl_url: Option<String>,
		local_path: Option<PathBuf>,
	) -> Self {
		Self {
			manual: ManualTransport::new(http.clone()),
			http,
			wsdl_url,
			local_path,
			binding: OnceCell::new(),
		}
	}

	async fn binding(&self) -> Option<&WsdlBinding> {
		self.binding
			.get_or_init(|| async { self.introspect().await })
			.await
			.as_ref()
	}

	async fn introspect(&self) -> Option<WsdlBinding> {
		if let Some(url) = &self.wsdl_url {
			match self.http.get(url).await {
				Ok(reply) if reply.status == 200 => match parse_wsdl_binding(&reply.body) {
					Some(binding) => return Some(binding),
					None => warn!("WSDL at {} advertises no SOAP address", url),
				},
				Ok(reply) => warn!("Failed to load remote WSDL {}: HTTP {}", url, reply.status),
				Err(e) => warn!("Failed to load remote WSDL {}: {}", url, e),
			}
		}

		if let Some(path) = &self.local_path {
			match tokio::fs::read_to_string(path).await {
				Ok(text) => {
					if let Some(binding) = parse_wsdl_binding(&text) {
						info!("Using local WSDL {}", path.display());
						return Some(binding);
					}
					warn!("Local WSDL {} advertises no SOAP address", path.display());
				}
				Err(e) => warn!("Failed to read local WSDL {}: {}", path.display(), e),
			}
		}

		info!("WSDL introspection unavailable, using manual envelopes");
		None
	}
}

#[async_trait]
impl SoapTransport for WsdlTransport {
	async fn send(&self, call: &SoapCall) -> Result<SoapSuccess, ProtocolError> {
		let Some(binding) = self.binding().await else {
			return self.manual.send(call).await;
		};
		let Some(template) = call.attempts.first() else {
			return Err(ProtocolError::from_attempts(Vec::new()));
		};

		let bound = SoapAttempt {
			url: binding.address.clone(),
			version: binding.version,
			..template.clone()
		};
		let mut failed = Vec::new();
		match self.manual.try_attempt(&bound).await {
			Ok(body) => {
				return Ok(SoapSuccess {
					url: bound.url,
					version: bound.version,
					operation: bound.operation,
					body,
					failed_attempts: failed,
				});
			}
			Err(record) => failed.push(record),
		}

		let remaining: Vec<SoapAttempt> = call
			.attempts
			.iter()
			.filter(|a| !(a.url == bound.url && a.version == bound.version))
			.cloned()
			.collect();
		self.manual.run(&remaining, failed).await
	}
}

/// First SOAP address advertised by a WSDL document.
pub fn parse_wsdl_binding(wsdl: &str) -> Option<WsdlBinding> {
	let doc = roxmltree::Document::parse(wsdl).ok()?;
	doc.descendants()
		.filter(|n| n.tag_name().name() == "address")
		.find_map(|n| {
			let version = match n.tag_name().namespace() {
				Some(NS_WSDL_SOAP12) => SoapVersion::V12,
				Some(NS_WSDL_SOAP11) => SoapVersion::V11,
				_ => return None,
			};
			let address = n.attribute("location")?.trim();
			(!address.is_empty()).then(|| WsdlBinding {
				address: address.to_string(),
				version,
			})
		})
}

/// Pick the distribution transport strategy from configuration.
pub fn select_transport(config: &DfeConfig, http: Arc<dyn HttpExchange>) -> Arc<dyn SoapTransport> {
	if config.use_wsdl {
		Arc::new(WsdlTransport::new(
			http,
			config.wsdl_url().map(str::to_string),
			config.wsdl_local_path.clone(),
		))
	} else {
		Arc::new(ManualTransport::new(http))
	}
}

fn truncate_body(body: &str) -> String {
	crate::utils::truncate_chars(body, 300)
}

#[cfg(test)]
pub(crate) mod tests {
	use super::*;
	use std::collections::VecDeque;
	use std::sync::Mutex;

	/// Scripted HTTP double: replies are consumed in order, every request is recorded.
	#[derive(Default)]
	pub(crate) struct ScriptedHttp {
		pub replies: Mutex<VecDeque<Result<HttpReply, ExchangeError>>>,
		pub requests: Mutex<Vec<(String, Vec<(&'static str, String)>, String)>>,
		pub gets: Mutex<Vec<String>>,
		pub wsdl: Option<String>,
	}

	impl ScriptedHttp {
		pub(crate) fn with_replies(
			replies: impl IntoIterator<Item = Result<HttpReply, ExchangeError>>,
		) -> Self {
			Self {
				replies: Mutex::new(replies.into_iter().collect()),
				..Self::default()
			}
		}

		pub(crate) fn urls(&self) -> Vec<String> {
			self.requests
				.lock()
				.unwrap()
				.iter()
				.map(|(u, _, _)| u.clone())
				.collect()
		}
	}

	pub(crate) fn status(code: u16) -> Result<HttpReply, ExchangeError> {
		Ok(HttpReply {
			status: code,
			body: String::new(),
		})
	}

	pub(crate) fn ok(body: &str) -> Result<HttpReply, ExchangeError> {
		Ok(HttpReply {
			status: 200,
			body: body.to_string(),
		})
	}

	#[async_trait]
	impl HttpExchange for ScriptedHttp {
		async fn post(
			&self,
			url: &str,
			headers: &[(&'static str, String)],
			body: String,
		) -> Result<HttpReply, ExchangeError> {
			self.requests
				.lock()
				.unwrap()
				.push((url.to_string(), headers.to_vec(), body));
			self.replies
				.lock()
				.unwrap()
				.pop_front()
				.unwrap_or_else(|| Err(ExchangeError("no scripted reply".into())))
		}

		async fn get(&self, url: &str) -> Result<HttpReply, ExchangeError> {
			self.gets.lock().unwrap().push(url.to_string());
			match &self.wsdl {
				Some(wsdl) => ok(wsdl),
				None => status(404),
			}
		}
	}

	fn call() -> SoapCall {
		let versions = [SoapVersion::V11, SoapVersion::V12];
		SoapCall::over(
			["https://a", "https://b", "https://c"]
				.into_iter()
				.map(|u| (u, &versions[..])),
			soap::NS_DIST_WS,
			soap::OP_DISTRIBUTION,
			"<distDFeInt/>".into(),
		)
	}

	#[tokio::test]
	async fn first_http_200_wins_and_prior_failures_are_logged() {
		let http = Arc::new(ScriptedHttp::with_replies([
			status(404),
			Err(ExchangeError("connection refused".into())),
			status(500),
			status(404),
			status(404),
			ok("<ok/>"),
			ok("<never/>"),
		]));
		let transport = ManualTransport::new(http.clone());

		let success = transport.send(&call()).await.unwrap();

		assert_eq!(success.url, "https://c");
		assert_eq!(success.version, SoapVersion::V12);
		assert_eq!(success.body, "<ok/>");
		assert_eq!(success.failed_attempts.len(), 5);
		assert_eq!(
			success.failed_attempts[1].outcome,
			AttemptOutcome::Network("connection refused".into())
		);
		assert_eq!(http.urls().len(), 6);
	}

	#[tokio::test]
	async fn exhausted_matrix_reports_every_attempt() {
		let http = Arc::new(ScriptedHttp::with_replies((0..6).map(|_| status(404))));
		let err = ManualTransport::new(http).send(&call()).await.unwrap_err();

		match err {
			ProtocolError::TransportFailure { attempts } => {
				assert_eq!(attempts.len(), 6);
				assert_eq!(attempts[0].url, "https://a");
				assert_eq!(attempts[0].version, SoapVersion::V11);
				assert_eq!(attempts[5].url, "https://c");
				assert_eq!(attempts[5].version, SoapVersion::V12);
			}
			other => panic!("unexpected error: {other:?}"),
		}
	}

	#[tokio::test]
	async fn network_only_failures_are_transient() {
		let http = Arc::new(ScriptedHttp::with_replies(
			(0..6).map(|_| Err(ExchangeError("timeout".into()))),
		));
		let err = ManualTransport::new(http).send(&call()).await.unwrap_err();
		assert!(err.is_transient());
	}

	const WSDL: &str = r#"<definitions xmlns="http://schemas.xmlsoap.org/wsdl/" xmlns:soap12="http://schemas.xmlsoap.org/wsdl/soap12/">
		<service name="NFeDistribuicaoDFe"><port name="p"><soap12:address location="https://b"/></port></service>
	</definitions>"#;

	#[test]
	fn wsdl_binding_is_parsed() {
		let binding = parse_wsdl_binding(WSDL).unwrap();
		assert_eq!(binding.address, "https://b");
		assert_eq!(binding.version, SoapVersion::V12);
		assert!(parse_wsdl_binding("<definitions/>").is_none());
	}

	#[tokio::test]
	async fn wsdl_binding_is_tried_before_the_matrix() {
		let http = Arc::new(ScriptedHttp {
			wsdl: Some(WSDL.into()),
			..ScriptedHttp::with_replies([status(500), status(404), ok("<ok/>")])
		});
		let transport = WsdlTransport::new(http.clone(), Some("https://wsdl?wsdl".into()), None);

		let success = transport.send(&call()).await.unwrap();

		assert_eq!(http.urls(), vec!["https://b", "https://a", "https://a"]);
		assert_eq!(success.url, "https://a");
		assert_eq!(success.version, SoapVersion::V12);
		assert_eq!(success.failed_attempts.len(), 2);
	}

	#[tokio::test]
	async fn failed_introspection_falls_through_to_manual() {
		let http = Arc::new(ScriptedHttp::with_replies([ok("<ok/>")]));
		let transport = WsdlTransport::new(
			http.clone(),
			Some("https://wsdl?wsdl".into()),
			Some(PathBuf::from("/nonexistent/dist.wsdl")),
		);

		let success = transport.send(&call()).await.unwrap();
		assert_eq!(success.url, "https://a");
		assert_eq!(http.gets.lock().unwrap().len(), 1);

		// introspection is not repeated
		http.replies.lock().unwrap().push_back(ok("<ok/>"));
		transport.send(&call()).await.unwrap();
		assert_eq!(http.gets.lock().unwrap().len(), 1);
	}

	#[tokio::test]
	async fn local_wsdl_is_used_when_remote_fails() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("dist.wsdl");
		std::fs::write(&path, WSDL).unwrap();

		let http = Arc::new(ScriptedHttp::with_replies([ok("<ok/>")]));
		let transport = WsdlTransport::new(http.clone(), None, Some(path));

		let success = transport.send(&call()).await.unwrap();
		assert_eq!(success.url, "https://b");
		assert_eq!(success.version, SoapVersion::V12);
	}
}
