//! Caller-facing facade.
//!
//! Wires the protocol stack for one identity per call, checks that the certificate belongs to the
//! company, and keeps at most one sync cycle per company in flight.

use crate::certificate::{self, CertificateError, IdentityMaterial, TaxIdKind};
use crate::config::DfeConfig;
use crate::manifest::{
	EventSigner, EventSubmitter, ManifestError, ManifestationRequest, SubmissionResult,
};
use crate::sync::{
	CertificateStore, CompanyId, DocumentRepository, ManifestationOutcome, RepositoryError,
	SyncOrchestrator, SyncSummary, XmlStorage,
};
use crate::utils::only_digits;
use crate::ws::{
	DistributionClient, DocumentKey, EndpointResolver, ExchangeResult, HttpExchange,
	ManualTransport, Nsu, ProtocolError, ReqwestExchange, select_transport,
};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SyncError {
	#[error("A cycle is already running for company {0}")]
	CycleInProgress(CompanyId),

	#[error("Certificate {certificate} does not belong to tax id {company}")]
	CertificateMismatch { company: String, certificate: String },

	#[error("Individual (CPF) certificates cannot sign manifestations")]
	IndividualCertificate,

	#[error(transparent)]
	Certificate(#[from] CertificateError),

	#[error(transparent)]
	Protocol(#[from] ProtocolError),

	#[error(transparent)]
	Manifest(#[from] ManifestError),

	#[error(transparent)]
	Repository(#[from] RepositoryError),
}

/// Builds the HTTP client presenting an identity
pub trait Connector: Send + Sync {
	fn connect(&self, identity: &IdentityMaterial) -> Result<Arc<dyn HttpExchange>, ProtocolError>;
}

/// Mutual-TLS connector backed by reqwest
pub struct TlsConnector {
	config: Arc<DfeConfig>,
}

impl TlsConnector {
	pub fn new(config: Arc<DfeConfig>) -> Self {
		Self { config }
	}
}

impl Connector for TlsConnector {
	fn connect(&self, identity: &IdentityMaterial) -> Result<Arc<dyn HttpExchange>, ProtocolError> {
		Ok(Arc::new(ReqwestExchange::new(identity, &self.config)?))
	}
}

pub struct DfeService {
	config: Arc<DfeConfig>,
	resolver: Arc<EndpointResolver>,
	connector: Arc<dyn Connector>,
	repository: Arc<dyn DocumentRepository>,
	storage: Arc<dyn XmlStorage>,
	certificates: Option<Arc<dyn CertificateStore>>,
	running: Mutex<HashSet<CompanyId>>,
}

impl DfeService {
	pub fn new(
		config: Arc<DfeConfig>,
		repository: Arc<dyn DocumentRepository>,
		storage: Arc<dyn XmlStorage>,
	) -> Self {
		Self {
			resolver: Arc::new(EndpointResolver::new(&config)),
			connector: Arc::new(TlsConnector::new(config.clone())),
			config,
			repository,
			storage,
			certificates: None,
			running: Mutex::new(HashSet::new()),
		}
	}

	/// Replace the TLS connector (tests, proxies).
	pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
		self.connector = connector;
		self
	}

	pub fn with_certificate_store(mut self, store: Arc<dyn CertificateStore>) -> Self {
		self.certificates = Some(store);
		self
	}

	/// Run one sync cycle for a company.
	///
	/// # Errors
	/// `CycleInProgress` when another cycle of the same company is running, `CertificateMismatch`
	/// when the identity belongs to someone else. Failures inside the cycle are reported in the
	/// returned summary instead.
	pub async fn run(
		&self,
		company_id: CompanyId,
		tax_id: &str,
		identity: &IdentityMaterial,
	) -> Result<SyncSummary, SyncError> {
		let _guard = self.acquire(company_id)?;
		check_identity(tax_id, identity, false)?;

		let http = self.connector.connect(identity)?;
		let client = DistributionClient::new(
			select_transport(&self.config, http),
			self.resolver.clone(),
		);
		let orchestrator = SyncOrchestrator::new(
			Arc::new(client),
			self.repository.clone(),
			self.storage.clone(),
			&self.config,
		);

		info!(
			company_id,
			certificate = identity.fingerprint(),
			"Starting sync cycle"
		);
		Ok(orchestrator.run(company_id, tax_id).await)
	}

	/// Run a cycle with the company's stored certificate, unless its cursor is cooling down.
	///
	/// # Returns
	/// `None` when the cursor's `resume_after` lies in the future.
	pub async fn run_for_company(
		&self,
		company_id: CompanyId,
		tax_id: &str,
	) -> Result<Option<SyncSummary>, SyncError> {
		if let Some(cursor) = self.repository.load_cursor(company_id).await? {
			if !cursor.is_due(Utc::now()) {
				debug!(
					"Company {} cooling down until {:?}",
					company_id, cursor.resume_after
				);
				return Ok(None);
			}
		}

		let identity = self.load_identity(company_id).await?;
		self.run(company_id, tax_id, &identity).await.map(Some)
	}

	/// Decrypt the stored bundle of a company.
	pub async fn load_identity(&self, company_id: CompanyId) -> Result<IdentityMaterial, SyncError> {
		let store = self
			.certificates
			.as_ref()
			.ok_or_else(|| RepositoryError::NotFound("no certificate store configured".into()))?;
		let bundle = store.load_bundle(company_id).await?;
		Ok(certificate::resolve(&bundle.bytes, &bundle.passphrase)?)
	}

	/// Single cursor exchange without loop or persistence.
	pub async fn pull_cursor(
		&self,
		tax_id: &str,
		cursor: Nsu,
		identity: &IdentityMaterial,
	) -> Result<ExchangeResult, SyncError> {
		Ok(self.client(identity)?.pull_cursor(tax_id, cursor).await?)
	}

	pub async fn pull_by_nsu(
		&self,
		tax_id: &str,
		nsu: Nsu,
		identity: &IdentityMaterial,
	) -> Result<ExchangeResult, SyncError> {
		Ok(self.client(identity)?.pull_nsu(tax_id, nsu).await?)
	}

	pub async fn pull_by_key(
		&self,
		tax_id: &str,
		key: &DocumentKey,
		identity: &IdentityMaterial,
	) -> Result<ExchangeResult, SyncError> {
		Ok(self.client(identity)?.pull_key(tax_id, key).await?)
	}

	/// Sign and submit a manifestation, then attach the outcome to the latest stored document with
	/// the same key.
	///
	/// # Errors
	/// `IndividualCertificate` for CPF certificates, `CertificateMismatch` for a foreign one,
	/// `Manifest` when signing fails or no endpoint answered.
	pub async fn submit_manifestation(
		&self,
		company_id: CompanyId,
		request: &ManifestationRequest,
		identity: &IdentityMaterial,
	) -> Result<SubmissionResult, SyncError> {
		check_identity(&request.tax_id, identity, true)?;

		let signer = EventSigner::from_identity(identity)?;
		let http = self.connector.connect(identity)?;
		let submitter = EventSubmitter::new(
			Arc::new(ManualTransport::new(http)),
			self.resolver.clone(),
		)
		.with_storage(self.storage.clone());

		let mut result = submitter.submit(request, &signer).await?;

		let outcome = ManifestationOutcome {
			event_type: request.event_type.code().to_string(),
			status_code: result.status_code,
			status_reason: result.status_reason.clone(),
			protocol: result.protocol.clone(),
			artifact_reference: result.artifact_reference.clone(),
			recorded_at: Utc::now(),
		};
		let attached = async {
			match self
				.repository
				.find_latest_document_by_key(company_id, &request.key)
				.await?
			{
				Some(document) => {
					self.repository
						.attach_manifestation_outcome(&document.id, outcome)
						.await?;
					Ok::<bool, RepositoryError>(true)
				}
				None => Ok(false),
			}
		}
		.await;

		match attached {
			Ok(true) => debug!("Outcome attached to document {}", request.key),
			Ok(false) => debug!("No stored document for key {}", request.key),
			Err(e) => {
				warn!("Could not attach manifestation outcome: {}", e);
				result.warnings.push(format!("outcome not attached: {e}"));
			}
		}
		Ok(result)
	}

	fn client(&self, identity: &IdentityMaterial) -> Result<DistributionClient, SyncError> {
		let http = self.connector.connect(identity)?;
		Ok(DistributionClient::new(
			select_transport(&self.config, http),
			self.resolver.clone(),
		))
	}

	fn acquire(&self, company_id: CompanyId) -> Result<CycleGuard<'_>, SyncError> {
		let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
		if !running.insert(company_id) {
			return Err(SyncError::CycleInProgress(company_id));
		}
		Ok(CycleGuard {
			running: &self.running,
			company_id,
		})
	}
}

/// Releases the company slot on drop
struct CycleGuard<'a> {
	running: &'a Mutex<HashSet<CompanyId>>,
	company_id: CompanyId,
}

impl Drop for CycleGuard<'_> {
	fn drop(&mut self) {
		self.running
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.remove(&self.company_id);
	}
}

/// Make sure the certificate was issued to the company.
///
/// A corporate certificate must share the 8-digit root with the company tax id; an individual one
/// must match it exactly and may not sign manifestations. Certificates without a recognizable tax
/// id pass.
fn check_identity(
	tax_id: &str,
	identity: &IdentityMaterial,
	for_manifestation: bool,
) -> Result<(), SyncError> {
	let Some(bound) = certificate::identity_from_der(&identity.leaf_der()?)? else {
		debug!("Certificate carries no tax id, skipping ownership check");
		return Ok(());
	};

	let company = only_digits(tax_id);
	let matches = match bound.kind {
		TaxIdKind::Cpf if for_manifestation => return Err(SyncError::IndividualCertificate),
		TaxIdKind::Cpf => company == bound.digits,
		TaxIdKind::Cnpj => company.len() == 14 && bound.corporate_root() == company.get(..8),
	};

	if matches {
		Ok(())
	} else {
		Err(SyncError::CertificateMismatch {
			company,
			certificate: format!("{} {}", bound.kind.as_str(), bound.digits),
		})
	}
}
