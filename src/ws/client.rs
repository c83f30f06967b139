//! Distribution client: cursor, targeted-NSU and targeted-key pulls.

use crate::codec;
use crate::config::Environment;
use crate::utils::only_digits;
use crate::ws::endpoints::{EndpointResolver, OperationKind};
use crate::ws::soap::{self, NS_DIST_WS, NS_NFE, OP_DISTRIBUTION, SoapVersion};
use crate::ws::transport::{SoapCall, SoapTransport};
use crate::ws::types::{
	DistributedItem, DistributionResponse, DocumentKey, ExchangeResult, Nsu, ProtocolError,
	SchemaKind,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Layout version of `distDFeInt`
const DIST_VERSION: &str = "1.01";

/// What a distribution request asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistQuery {
	/// Everything after the cursor (`distNSU/ultNSU`)
	Cursor(Nsu),
	/// One specific NSU (`consNSU/NSU`)
	Nsu(Nsu),
	/// One specific document (`consChNFe/chNFe`)
	Key(DocumentKey),
}

impl DistQuery {
	fn label(&self) -> &'static str {
		match self {
			DistQuery::Cursor(_) => "distNSU",
			DistQuery::Nsu(_) => "consNSU",
			DistQuery::Key(_) => "consChNFe",
		}
	}
}

/// Build the `distDFeInt` request document.
pub fn build_request(
	environment: Environment,
	tax_id: &str,
	query: &DistQuery,
) -> Result<String, ProtocolError> {
	let digits = only_digits(tax_id);
	let party = match digits.len() {
		14 => format!("<CNPJ>{digits}</CNPJ>"),
		11 => format!("<CPF>{digits}</CPF>"),
		_ => {
			return Err(ProtocolError::Config(format!(
				"tax id must have 11 or 14 digits, got {}",
				digits.len()
			)));
		}
	};
	let content = match query {
		DistQuery::Cursor(nsu) => format!("<distNSU><ultNSU>{nsu}</ultNSU></distNSU>"),
		DistQuery::Nsu(nsu) => format!("<consNSU><NSU>{nsu}</NSU></consNSU>"),
		DistQuery::Key(key) => format!("<consChNFe><chNFe>{key}</chNFe></consChNFe>"),
	};

	Ok(format!(
		r#"<distDFeInt xmlns="{NS_NFE}" versao="{DIST_VERSION}"><tpAmb>{}</tpAmb>{party}{content}</distDFeInt>"#,
		environment.code()
	))
}

/// Parse `retDistDFeInt` out of a SOAP response body.
///
/// `fallback_cursor` stands in for a missing `ultNSU`; a missing `maxNSU` falls back to the
/// resulting cursor. Items whose payload cannot be decoded are kept with their codec error.
pub fn parse_response(
	body: &str,
	fallback_cursor: Nsu,
	endpoint: &str,
	soap_version: SoapVersion,
	elapsed: Duration,
) -> Result<DistributionResponse, ProtocolError> {
	soap::with_result(body, NS_NFE, "retDistDFeInt", |ret| {
		let status_code = soap::descendant_text(ret, "cStat")
			.and_then(|s| s.parse::<u16>().ok())
			.ok_or_else(|| ProtocolError::UnparsableResponse("cStat missing".into()))?;
		let status_reason = soap::descendant_text(ret, "xMotivo").unwrap_or_default();
		let cursor_after = soap::descendant_text(ret, "ultNSU")
			.and_then(|s| Nsu::parse_lenient(&s))
			.unwrap_or(fallback_cursor);
		let max_cursor_after = soap::descendant_text(ret, "maxNSU")
			.and_then(|s| Nsu::parse_lenient(&s))
			.unwrap_or(cursor_after);

		let mut items = Vec::new();
		for doc_zip in ret
			.descendants()
			.filter(|n| n.is_element() && n.tag_name().name() == "docZip")
		{
			let Some(nsu) = doc_zip.attribute("NSU").and_then(Nsu::parse_lenient) else {
				warn!("docZip without NSU attribute skipped");
				continue;
			};
			let schema = doc_zip.attribute("schema").unwrap_or_default().to_string();
			let content = codec::decode(doc_zip.text().unwrap_or_default());
			if let Err(e) = &content {
				warn!(nsu = %nsu, schema = %schema, "{}", e);
			}
			items.push(DistributedItem {
				nsu,
				kind: SchemaKind::from_schema(&schema),
				schema,
				content,
			});
		}

		Ok(DistributionResponse {
			status_code,
			status_reason,
			cursor_after,
			max_cursor_after,
			items,
			endpoint: endpoint.to_string(),
			soap_version,
			elapsed,
		})
	})
}

/// Pick one item from a key pull: the schema starting with `prefer`, else the first full document,
/// summary or summarized event, else the first item.
pub fn select_preferred<'a>(
	items: &'a [DistributedItem],
	prefer: Option<&str>,
) -> Option<&'a DistributedItem> {
	if let Some(prefer) = prefer.filter(|p| !p.is_empty()) {
		if let Some(item) = items.iter().find(|i| i.schema.starts_with(prefer)) {
			return Some(item);
		}
	}
	["procNFe", "resNFe", "resEvento"]
		.iter()
		.find_map(|prefix| items.iter().find(|i| i.schema.starts_with(prefix)))
		.or_else(|| items.first())
}

/// Exchanges the pull loop depends on
#[async_trait]
pub trait DistributionGateway: Send + Sync {
	async fn pull_cursor(&self, tax_id: &str, cursor: Nsu) -> Result<ExchangeResult, ProtocolError>;
	async fn pull_nsu(&self, tax_id: &str, nsu: Nsu) -> Result<ExchangeResult, ProtocolError>;
}

/// Distribution service client
#[derive(Clone)]
pub struct DistributionClient {
	transport: Arc<dyn SoapTransport>,
	resolver: Arc<EndpointResolver>,
}

impl DistributionClient {
	pub fn new(transport: Arc<dyn SoapTransport>, resolver: Arc<EndpointResolver>) -> Self {
		Self {
			transport,
			resolver,
		}
	}

	/// Pull everything after `cursor`.
	pub async fn pull_cursor(
		&self,
		tax_id: &str,
		cursor: Nsu,
	) -> Result<ExchangeResult, ProtocolError> {
		self.exchange(tax_id, DistQuery::Cursor(cursor), cursor).await
	}

	/// Pull a single NSU, used to backfill gaps.
	pub async fn pull_nsu(&self, tax_id: &str, nsu: Nsu) -> Result<ExchangeResult, ProtocolError> {
		self.exchange(tax_id, DistQuery::Nsu(nsu), Nsu::ZERO).await
	}

	/// Pull the documents bound to a 44-digit key.
	pub async fn pull_key(
		&self,
		tax_id: &str,
		key: &DocumentKey,
	) -> Result<ExchangeResult, ProtocolError> {
		self.exchange(tax_id, DistQuery::Key(key.clone()), Nsu::ZERO)
			.await
	}

	async fn exchange(
		&self,
		tax_id: &str,
		query: DistQuery,
		fallback_cursor: Nsu,
	) -> Result<ExchangeResult, ProtocolError> {
		let started = Instant::now();
		let payload = build_request(self.resolver.environment(), tax_id, &query)?;
		let candidates = self.resolver.candidates(OperationKind::Distribution, None);
		let call = SoapCall::over(
			candidates
				.iter()
				.map(|c| (c.url.as_str(), c.versions.as_slice())),
			NS_DIST_WS,
			OP_DISTRIBUTION,
			payload,
		);

		let success = self.transport.send(&call).await?;
		let response = parse_response(
			&success.body,
			fallback_cursor,
			&success.url,
			success.version,
			started.elapsed(),
		)?;

		debug!(
			"{} cStat={} xMotivo={} ultNSU={} maxNSU={} docs={} t={:.2}s",
			query.label(),
			response.status_code,
			response.status_reason,
			response.cursor_after,
			response.max_cursor_after,
			response.items.len(),
			response.elapsed.as_secs_f64()
		);
		Ok(response)
	}
}

#[async_trait]
impl DistributionGateway for DistributionClient {
	async fn pull_cursor(&self, tax_id: &str, cursor: Nsu) -> Result<ExchangeResult, ProtocolError> {
		DistributionClient::pull_cursor(self, tax_id, cursor).await
	}

	async fn pull_nsu(&self, tax_id: &str, nsu: Nsu) -> Result<ExchangeResult, ProtocolError> {
		DistributionClient::pull_nsu(self, tax_id, nsu).await
	}
}
