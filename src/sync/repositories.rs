use crate::ws::{DocumentKey, Nsu, SchemaKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Company identifier used by the persistence collaborators
pub type CompanyId = i64;

#[derive(Debug, Error)]
pub enum RepositoryError {
	#[error("IO error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error("Not found: {0}")]
	NotFound(String),
}

/// Per-company distribution cursor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
	/// Input of the next cursor pull; never decreases
	pub last_acknowledged_nsu: Nsu,
	pub last_known_max_nsu: Nsu,
	pub updated_at: DateTime<Utc>,
	/// Earliest time the next cycle should run (throttle or idle cool-down)
	#[serde(default)]
	pub resume_after: Option<DateTime<Utc>>,
}

impl Cursor {
	/// Fresh cursor at NSU zero
	pub fn new(now: DateTime<Utc>) -> Self {
		Self {
			last_acknowledged_nsu: Nsu::ZERO,
			last_known_max_nsu: Nsu::ZERO,
			updated_at: now,
			resume_after: None,
		}
	}

	/// Whether a cycle may run at `now`
	pub fn is_due(&self, now: DateTime<Utc>) -> bool {
		self.resume_after.is_none_or(|at| now >= at)
	}

	/// Move the cursor forward; a lower acknowledged value is ignored.
	pub fn advance(&mut self, acknowledged: Nsu, max: Nsu, now: DateTime<Utc>) {
		self.last_acknowledged_nsu = self.last_acknowledged_nsu.max(acknowledged);
		self.last_known_max_nsu = max.max(self.last_acknowledged_nsu);
		self.updated_at = now;
	}
}

/// Identifier of a stored document, unique per (company, NSU)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId {
	pub company_id: CompanyId,
	pub nsu: Nsu,
}

/// A distributed document as handed to persistence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
	pub company_id: CompanyId,
	pub nsu: Nsu,
	/// Raw schema attribute
	pub schema: String,
	pub schema_kind: SchemaKind,
	pub document_key: Option<DocumentKey>,
	pub storage_reference: String,
	pub received_at: DateTime<Utc>,
}

/// Result of a manifestation, attached to the targeted document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestationOutcome {
	pub event_type: String,
	pub status_code: Option<u16>,
	pub status_reason: Option<String>,
	pub protocol: Option<String>,
	pub artifact_reference: Option<String>,
	pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
	pub id: DocumentId,
	pub record: DocumentRecord,
	pub manifestation: Option<ManifestationOutcome>,
}

/// Encrypted identity bundle as kept by the certificate store
pub struct CertificateBundle {
	pub bytes: Zeroizing<Vec<u8>>,
	pub passphrase: Zeroizing<String>,
}

/// Cursor and document persistence
#[async_trait::async_trait]
pub trait DocumentRepository: Send + Sync {
	async fn load_cursor(&self, company_id: CompanyId) -> Result<Option<Cursor>, RepositoryError>;
	async fn save_cursor(&self, company_id: CompanyId, cursor: &Cursor)
	-> Result<(), RepositoryError>;
	/// Store a document; storing the same (company, NSU) again returns the existing id.
	async fn save_document(&self, record: DocumentRecord) -> Result<DocumentId, RepositoryError>;
	async fn attach_manifestation_outcome(
		&self,
		id: &DocumentId,
		outcome: ManifestationOutcome,
	) -> Result<(), RepositoryError>;
	/// Highest-NSU document of the company carrying `key`.
	async fn find_latest_document_by_key(
		&self,
		company_id: CompanyId,
		key: &DocumentKey,
	) -> Result<Option<StoredDocument>, RepositoryError>;
}

/// Raw XML storage
#[async_trait::async_trait]
pub trait XmlStorage: Send + Sync {
	/// Store `bytes` and return a reference to them.
	///
	/// # Arguments
	/// * `tax_id` - Company tax id, used to partition storage.
	/// * `name` - Item name (the NSU for distributed documents).
	/// * `schema` - Schema of the payload.
	async fn save_xml(
		&self,
		tax_id: &str,
		name: &str,
		schema: &str,
		bytes: &[u8],
	) -> Result<String, RepositoryError>;
}

/// Source of encrypted identity bundles
#[async_trait::async_trait]
pub trait CertificateStore: Send + Sync {
	async fn load_bundle(&self, company_id: CompanyId)
	-> Result<CertificateBundle, RepositoryError>;
}

/// JSON-file implementation of DocumentRepository
pub struct FileDocumentRepository {
	data_dir: PathBuf,
	lock: Mutex<()>,
}

impl FileDocumentRepository {
	pub fn new(data_dir: PathBuf) -> Self {
		Self {
			data_dir,
			lock: Mutex::new(()),
		}
	}

	fn cursor_filename(&self, company_id: CompanyId) -> PathBuf {
		self.data_dir.join(format!("cursor_{company_id}.json"))
	}

	fn documents_filename(&self, company_id: CompanyId) -> PathBuf {
		self.data_dir.join(format!("documents_{company_id}.json"))
	}

	async fn read_documents(
		&self,
		company_id: CompanyId,
	) -> Result<Vec<StoredDocument>, RepositoryError> {
		match tokio::fs::read_to_string(self.documents_filename(company_id)).await {
			Ok(content) => Ok(serde_json::from_str(&content)?),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
			Err(e) => Err(e.into()),
		}
	}

	async fn write_documents(
		&self,
		company_id: CompanyId,
		documents: &[StoredDocument],
	) -> Result<(), RepositoryError> {
		write_json(&self.documents_filename(company_id), documents).await
	}
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), RepositoryError> {
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	let tmp = path.with_extension("json.tmp");
	tokio::fs::write(&tmp, serde_json::to_vec_pretty(value)?).await?;
	tokio::fs::rename(&tmp, path).await?;
	Ok(())
}

#[async_trait::async_trait]
impl DocumentRepository for FileDocumentRepository {
	async fn load_cursor(&self, company_id: CompanyId) -> Result<Option<Cursor>, RepositoryError> {
		let _guard = self.lock.lock().await;
		match tokio::fs::read_to_string(self.cursor_filename(company_id)).await {
			Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
			Err(e) => Err(e.into()),
		}
	}

	async fn save_cursor(
		&self,
		company_id: CompanyId,
		cursor: &Cursor,
	) -> Result<(), RepositoryError> {
		let _guard = self.lock.lock().await;
		write_json(&self.cursor_filename(company_id), cursor).await?;
		debug!(
			"Saved cursor for company {} at NSU {}",
			company_id, cursor.last_acknowledged_nsu
		);
		Ok(())
	}

	async fn save_document(&self, record: DocumentRecord) -> Result<DocumentId, RepositoryError> {
		let _guard = self.lock.lock().await;
		let mut documents = self.read_documents(record.company_id).await?;
		let id = DocumentId {
			company_id: record.company_id,
			nsu: record.nsu,
		};
		if documents.iter().any(|d| d.id == id) {
			return Ok(id);
		}
		let company_id = record.company_id;
		documents.push(StoredDocument {
			id,
			record,
			manifestation: None,
		});
		self.write_documents(company_id, &documents).await?;
		Ok(id)
	}

	async fn attach_manifestation_outcome(
		&self,
		id: &DocumentId,
		outcome: ManifestationOutcome,
	) -> Result<(), RepositoryError> {
		let _guard = self.lock.lock().await;
		let mut documents = self.read_documents(id.company_id).await?;
		let document = documents
			.iter_mut()
			.find(|d| d.id == *id)
			.ok_or_else(|| RepositoryError::NotFound(format!("document {} of company {}", id.nsu, id.company_id)))?;
		document.manifestation = Some(outcome);
		self.write_documents(id.company_id, &documents).await
	}

	async fn find_latest_document_by_key(
		&self,
		company_id: CompanyId,
		key: &DocumentKey,
	) -> Result<Option<StoredDocument>, RepositoryError> {
		let _guard = self.lock.lock().await;
		let documents = self.read_documents(company_id).await?;
		Ok(documents
			.into_iter()
			.filter(|d| d.record.document_key.as_ref() == Some(key))
			.max_by_key(|d| d.id.nsu))
	}
}

/// Filesystem XML storage: `{base}/{tax_id}/{name}_{schema}.xml`
pub struct FileXmlStorage {
	base_path: PathBuf,
}

impl FileXmlStorage {
	pub fn new(base_path: PathBuf) -> Self {
		Self { base_path }
	}
}

#[async_trait::async_trait]
impl XmlStorage for FileXmlStorage {
	async fn save_xml(
		&self,
		tax_id: &str,
		name: &str,
		schema: &str,
		bytes: &[u8],
	) -> Result<String, RepositoryError> {
		let dir = self.base_path.join(sanitize(tax_id));
		tokio::fs::create_dir_all(&dir).await?;
		let path = dir.join(format!("{}_{}.xml", sanitize(name), sanitize(schema)));
		tokio::fs::write(&path, bytes).await?;
		Ok(path.to_string_lossy().into_owned())
	}
}

fn sanitize(part: &str) -> String {
	part.chars()
		.map(|c| {
			if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
				c
			} else {
				'_'
			}
		})
		.collect()
}

/// Certificate bundles on disk: `{data_dir}/certs/{company_id}.pfx` with the passphrase in
/// `{company_id}.pass`
pub struct FileCertificateStore {
	data_dir: PathBuf,
}

impl FileCertificateStore {
	pub fn new(data_dir: PathBuf) -> Self {
		Self { data_dir }
	}
}

#[async_trait::async_trait]
impl CertificateStore for FileCertificateStore {
	async fn load_bundle(
		&self,
		company_id: CompanyId,
	) -> Result<CertificateBundle, RepositoryError> {
		let dir = self.data_dir.join("certs");
		let pfx = dir.join(format!("{company_id}.pfx"));
		let pass = dir.join(format!("{company_id}.pass"));

		let bytes = match tokio::fs::read(&pfx).await {
			Ok(bytes) => Zeroizing::new(bytes),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(RepositoryError::NotFound(format!(
					"certificate for company {company_id}"
				)));
			}
			Err(e) => return Err(e.into()),
		};
		let raw = Zeroizing::new(tokio::fs::read_to_string(&pass).await?);
		let passphrase = Zeroizing::new(raw.trim_end_matches(['\r', '\n']).to_string());

		info!("Loaded certificate bundle for company {}", company_id);
		Ok(CertificateBundle { bytes, passphrase })
	}
}

/// In-memory DocumentRepository
#[derive(Default)]
pub struct MemoryDocumentRepository {
	cursors: std::sync::Mutex<HashMap<CompanyId, Cursor>>,
	documents: std::sync::Mutex<Vec<StoredDocument>>,
}

impl MemoryDocumentRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Snapshot of every stored document
	pub fn documents(&self) -> Vec<StoredDocument> {
		self.documents
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.clone()
	}
}

#[async_trait::async_trait]
impl DocumentRepository for MemoryDocumentRepository {
	async fn load_cursor(&self, company_id: CompanyId) -> Result<Option<Cursor>, RepositoryError> {
		Ok(self
			.cursors
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.get(&company_id)
			.cloned())
	}

	async fn save_cursor(
		&self,
		company_id: CompanyId,
		cursor: &Cursor,
	) -> Result<(), RepositoryError> {
		self.cursors
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.insert(company_id, cursor.clone());
		Ok(())
	}

	async fn save_document(&self, record: DocumentRecord) -> Result<DocumentId, RepositoryError> {
		let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
		let id = DocumentId {
			company_id: record.company_id,
			nsu: record.nsu,
		};
		if !documents.iter().any(|d| d.id == id) {
			documents.push(StoredDocument {
				id,
				record,
				manifestation: None,
			});
		}
		Ok(id)
	}

	async fn attach_manifestation_outcome(
		&self,
		id: &DocumentId,
		outcome: ManifestationOutcome,
	) -> Result<(), RepositoryError> {
		let mut documents = self.documents.lock().unwrap_or_else(|e| e.into_inner());
		let document = documents
			.iter_mut()
			.find(|d| d.id == *id)
			.ok_or_else(|| RepositoryError::NotFound(format!("document {}", id.nsu)))?;
		document.manifestation = Some(outcome);
		Ok(())
	}

	async fn find_latest_document_by_key(
		&self,
		company_id: CompanyId,
		key: &DocumentKey,
	) -> Result<Option<StoredDocument>, RepositoryError> {
		Ok(self
			.documents
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.iter()
			.filter(|d| d.id.company_id == company_id && d.record.document_key.as_ref() == Some(key))
			.max_by_key(|d| d.id.nsu)
			.cloned())
	}
}

/// In-memory XmlStorage keeping every saved blob
#[derive(Default)]
pub struct MemoryXmlStorage {
	files: std::sync::Mutex<Vec<(String, Vec<u8>)>>,
}

impl MemoryXmlStorage {
	pub fn new() -> Self {
		Self::default()
	}

	/// References of every saved blob, in save order
	pub fn references(&self) -> Vec<String> {
		self.files
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.iter()
			.map(|(r, _)| r.clone())
			.collect()
	}
}

#[async_trait::async_trait]
impl XmlStorage for MemoryXmlStorage {
	async fn save_xml(
		&self,
		tax_id: &str,
		name: &str,
		schema: &str,
		bytes: &[u8],
	) -> Result<String, RepositoryError> {
		let reference = format!("mem://{tax_id}/{name}_{schema}.xml");
		self.files
			.lock()
			.unwrap_or_else(|e| e.into_inner())
			.push((reference.clone(), bytes.to_vec()));
		Ok(reference)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use chrono::Duration;

	fn record(nsu: u64, key: Option<&str>) -> DocumentRecord {
		DocumentRecord {
			company_id: 7,
			nsu: Nsu::new(nsu),
			schema: "resNFe_v1.01.xsd".into(),
			schema_kind: SchemaKind::Summary,
			document_key: key.and_then(DocumentKey::parse),
			storage_reference: format!("ref-{nsu}"),
			received_at: Utc::now(),
		}
	}

	const KEY: &str = "35240112345678000195550010000000011000000010";

	#[test]
	fn cursor_advances_monotonically() {
		let now = Utc::now();
		let mut cursor = Cursor::new(now);
		cursor.advance(Nsu::new(10), Nsu::new(20), now);
		cursor.advance(Nsu::new(5), Nsu::new(20), now);
		assert_eq!(cursor.last_acknowledged_nsu, Nsu::new(10));
		assert_eq!(cursor.last_known_max_nsu, Nsu::new(20));
	}

	#[test]
	fn cursor_cool_down() {
		let now = Utc::now();
		let mut cursor = Cursor::new(now);
		assert!(cursor.is_due(now));
		cursor.resume_after = Some(now + Duration::seconds(3600));
		assert!(!cursor.is_due(now));
		assert!(cursor.is_due(now + Duration::seconds(3600)));
	}

	#[tokio::test]
	async fn file_repository_round_trip() {
		let dir = tempfile::tempdir().unwrap();
		let repo = FileDocumentRepository::new(dir.path().to_path_buf());

		assert!(repo.load_cursor(7).await.unwrap().is_none());
		let mut cursor = Cursor::new(Utc::now());
		cursor.advance(Nsu::new(104), Nsu::new(104), Utc::now());
		repo.save_cursor(7, &cursor).await.unwrap();
		assert_eq!(repo.load_cursor(7).await.unwrap(), Some(cursor));

		let first = repo.save_document(record(101, Some(KEY))).await.unwrap();
		let again = repo.save_document(record(101, None)).await.unwrap();
		assert_eq!(first, again);
		repo.save_document(record(103, Some(KEY))).await.unwrap();

		let latest = repo
			.find_latest_document_by_key(7, &DocumentKey::parse(KEY).unwrap())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(latest.id.nsu, Nsu::new(103));

		let outcome = ManifestationOutcome {
			event_type: "210210".into(),
			status_code: Some(135),
			status_reason: Some("Evento registrado".into()),
			protocol: None,
			artifact_reference: None,
			recorded_at: Utc::now(),
		};
		repo.attach_manifestation_outcome(&latest.id, outcome.clone())
			.await
			.unwrap();
		let latest = repo
			.find_latest_document_by_key(7, &DocumentKey::parse(KEY).unwrap())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(latest.manifestation, Some(outcome));

		let missing = DocumentId {
			company_id: 7,
			nsu: Nsu::new(999),
		};
		let err = repo
			.attach_manifestation_outcome(&missing, latest.manifestation.clone().unwrap())
			.await
			.unwrap_err();
		assert!(matches!(err, RepositoryError::NotFound(_)));
	}

	#[tokio::test]
	async fn file_storage_and_certificate_store() {
		let dir = tempfile::tempdir().unwrap();

		let storage = FileXmlStorage::new(dir.path().join("xml"));
		let reference = storage
			.save_xml("12345678000195", "000000000000101", "resNFe_v1.01.xsd", b"<x/>")
			.await
			.unwrap();
		assert!(reference.ends_with("000000000000101_resNFe_v1.01.xsd.xml"));
		assert_eq!(std::fs::read(&reference).unwrap(), b"<x/>");

		let store = FileCertificateStore::new(dir.path().to_path_buf());
		assert!(matches!(
			store.load_bundle(1).await,
			Err(RepositoryError::NotFound(_))
		));
		std::fs::create_dir_all(dir.path().join("certs")).unwrap();
		std::fs::write(dir.path().join("certs/1.pfx"), b"bundle").unwrap();
		std::fs::write(dir.path().join("certs/1.pass"), "secret\n").unwrap();
		let bundle = store.load_bundle(1).await.unwrap();
		assert_eq!(bundle.bytes.as_slice(), b"bundle");
		assert_eq!(bundle.passphrase.as_str(), "secret");
	}
}
