//! Endpoint resolution for the distribution and event reception services.
//!
//! Candidate order encodes preference: the first entry is tried first and later entries are
//! fallbacks. Lists are deduplicated with order preserved.

use crate::config::{DfeConfig, Environment};
use crate::ws::soap::SoapVersion;

const DIST_PRODUCTION: [&str; 4] = [
	"https://www.nfe.fazenda.gov.br/ws/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://www.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://www1.nfe.fazenda.gov.br/ws/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://www1.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
];

const DIST_STAGING: [&str; 4] = [
	"https://hom.nfe.fazenda.gov.br/ws/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://hom.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://www1-hom.nfe.fazenda.gov.br/ws/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
	"https://www1-hom.nfe.fazenda.gov.br/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx",
];

const EVENT_PRODUCTION: [&str; 5] = [
	"https://www.nfe.fazenda.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
	"https://www.nfe.fazenda.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	"https://www.nfe.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	"https://www.nfe.fazenda.gov.br/ws/RecepcaoEvento/RecepcaoEvento.asmx",
	"https://www.nfe.fazenda.gov.br/RecepcaoEvento/RecepcaoEvento.asmx",
];

const EVENT_STAGING: [&str; 5] = [
	"https://hom.nfe.fazenda.gov.br/ws/recepcaoevento/recepcaoevento4.asmx",
	"https://hom.nfe.fazenda.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	"https://hom.nfe.fazenda.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	"https://hom.nfe.fazenda.gov.br/ws/RecepcaoEvento/RecepcaoEvento.asmx",
	"https://hom.nfe.fazenda.gov.br/RecepcaoEvento/RecepcaoEvento.asmx",
];

/// Jurisdiction-specific event hosts: (UF code, production, staging, SOAP 1.1 preferred)
const JURISDICTION_EVENT_HOSTS: &[(&str, [&str; 2], [&str; 2], bool)] = &[(
	"35",
	[
		"https://nfe.fazenda.sp.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
		"https://nfe.fazenda.sp.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	],
	[
		"https://homologacao.nfe.fazenda.sp.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
		"https://homologacao.nfe.fazenda.sp.gov.br/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx",
	],
	true,
)];

/// Host marker of the national authority
const NATIONAL_HOST: &str = "nfe.fazenda.gov.br";

/// Service an endpoint list is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
	/// Cursor, targeted-NSU and targeted-key pulls
	Distribution,
	/// Manifestation event submission
	EventReception,
}

/// One endpoint with the SOAP versions to try on it, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
	pub url: String,
	pub versions: Vec<SoapVersion>,
	/// Whether the host belongs to the national authority (decides `cOrgao` for events)
	pub national: bool,
}

const PREFER_11: [SoapVersion; 2] = [SoapVersion::V11, SoapVersion::V12];
const PREFER_12: [SoapVersion; 2] = [SoapVersion::V12, SoapVersion::V11];

/// Builds ordered endpoint candidate lists from configuration
#[derive(Debug, Clone)]
pub struct EndpointResolver {
	environment: Environment,
	dist_override: Option<String>,
	wsdl_url: Option<String>,
	event_override: Option<String>,
}

impl EndpointResolver {
	pub fn new(config: &DfeConfig) -> Self {
		Self {
			environment: config.environment,
			dist_override: config.dist_url_override().map(str::to_string),
			wsdl_url: if config.use_wsdl {
				config.wsdl_url().map(str::to_string)
			} else {
				None
			},
			event_override: config.event_url_override().map(str::to_string),
		}
	}

	pub fn environment(&self) -> Environment {
		self.environment
	}

	/// Ordered candidates for an operation.
	///
	/// # Arguments
	/// * `kind` - The service being called.
	/// * `jurisdiction` - Two-digit UF code (first digits of the document key), used for events only.
	pub fn candidates(&self, kind: OperationKind, jurisdiction: Option<&str>) -> Vec<Candidate> {
		match kind {
			OperationKind::Distribution => self.distribution_candidates(),
			OperationKind::EventReception => self.event_candidates(jurisdiction),
		}
	}

	fn distribution_candidates(&self) -> Vec<Candidate> {
		let mut urls: Vec<String> = Vec::new();

		if let Some(url) = &self.dist_override {
			urls.push(url.clone());
		}
		if let Some(wsdl) = &self.wsdl_url {
			let base = endpoint_from_wsdl(wsdl);
			if !base.is_empty() {
				if base.contains("/ws/") {
					let root = base.replace("/ws/", "/");
					urls.push(base);
					urls.push(root);
				} else {
					urls.push(base);
				}
			}
		}
		let national = match self.environment {
			Environment::Production => DIST_PRODUCTION,
			Environment::Staging => DIST_STAGING,
		};
		urls.extend(national.iter().map(|u| u.to_string()));

		dedup(urls)
			.into_iter()
			.map(|url| Candidate {
				national: is_national(&url),
				url,
				versions: PREFER_11.to_vec(),
			})
			.collect()
	}

	fn event_candidates(&self, jurisdiction: Option<&str>) -> Vec<Candidate> {
		let mut candidates = Vec::new();

		if let Some(uf) = jurisdiction {
			for (code, production, staging, prefer_11) in JURISDICTION_EVENT_HOSTS {
				if *code != uf {
					continue;
				}
				let hosts = match self.environment {
					Environment::Production => production,
					Environment::Staging => staging,
				};
				let versions = if *prefer_11 { PREFER_11 } else { PREFER_12 };
				candidates.extend(hosts.iter().map(|url| Candidate {
					url: url.to_string(),
					versions: versions.to_vec(),
					national: false,
				}));
			}
		}

		let mut fallback: Vec<String> = Vec::new();
		if let Some(url) = &self.event_override {
			fallback.push(url.clone());
		}
		let national = match self.environment {
			Environment::Production => EVENT_PRODUCTION,
			Environment::Staging => EVENT_STAGING,
		};
		fallback.extend(national.iter().map(|u| u.to_string()));
		candidates.extend(fallback.into_iter().map(|url| Candidate {
			national: is_national(&url),
			url,
			versions: PREFER_12.to_vec(),
		}));

		let mut seen = std::collections::HashSet::new();
		candidates.retain(|c| seen.insert(c.url.clone()));
		candidates
	}
}

/// Service address from a WSDL reference: the URL without its `?wsdl` query.
pub fn endpoint_from_wsdl(wsdl: &str) -> String {
	wsdl.split('?').next().unwrap_or_default().trim().to_string()
}

fn is_national(url: &str) -> bool {
	let lower = url.to_lowercase();
	lower
		.split("://")
		.nth(1)
		.and_then(|rest| rest.split('/').next())
		.map(|host| host == NATIONAL_HOST || host.ends_with(&format!(".{NATIONAL_HOST}")))
		.unwrap_or(false)
}

fn dedup(urls: Vec<String>) -> Vec<String> {
	let mut seen = std::collections::HashSet::new();
	urls.into_iter()
		.filter(|u| !u.is_empty() && seen.insert(u.clone()))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn config(environment: Environment) -> DfeConfig {
		DfeConfig {
			environment,
			..DfeConfig::default()
		}
	}

	#[test]
	fn distribution_order_is_override_wsdl_then_national() {
		let cfg = DfeConfig {
			dist_url_staging: Some("https://proxy.local/dist".into()),
			use_wsdl: true,
			wsdl_staging: Some(
				"https://hom.nfe.fazenda.gov.br/ws/NFeDistribuicaoDFe/NFeDistribuicaoDFe.asmx?WSDL".into(),
			),
			..config(Environment::Staging)
		};
		let urls: Vec<String> = EndpointResolver::new(&cfg)
			.candidates(OperationKind::Distribution, None)
			.into_iter()
			.map(|c| c.url)
			.collect();

		assert_eq!(
			urls,
			vec![
				"https://proxy.local/dist".to_string(),
				DIST_STAGING[0].to_string(),
				DIST_STAGING[1].to_string(),
				DIST_STAGING[2].to_string(),
				DIST_STAGING[3].to_string(),
			]
		);
	}

	#[test]
	fn wsdl_reference_ignored_when_disabled() {
		let cfg = DfeConfig {
			wsdl_production: Some("https://elsewhere.example/ws/dist.asmx?wsdl".into()),
			..config(Environment::Production)
		};
		let candidates =
			EndpointResolver::new(&cfg).candidates(OperationKind::Distribution, Some("35"));
		assert_eq!(candidates.len(), 4);
		assert_eq!(candidates[0].url, DIST_PRODUCTION[0]);
		assert_eq!(candidates[0].versions, vec![SoapVersion::V11, SoapVersion::V12]);
	}

	#[test]
	fn event_jurisdiction_hosts_come_first() {
		let resolver = EndpointResolver::new(&config(Environment::Production));
		let candidates = resolver.candidates(OperationKind::EventReception, Some("35"));

		assert!(candidates[0].url.contains("fazenda.sp.gov.br"));
		assert!(!candidates[0].national);
		assert_eq!(candidates[0].versions, vec![SoapVersion::V11, SoapVersion::V12]);

		let national = &candidates[2];
		assert!(national.national);
		assert_eq!(national.versions, vec![SoapVersion::V12, SoapVersion::V11]);
		// the default override duplicates a built-in national host
		assert_eq!(candidates.len(), 2 + 5);
	}

	#[test]
	fn other_jurisdictions_go_national() {
		let resolver = EndpointResolver::new(&config(Environment::Staging));
		let candidates = resolver.candidates(OperationKind::EventReception, Some("31"));
		assert!(candidates.iter().all(|c| c.national));
		assert_eq!(candidates[0].url, EVENT_STAGING[1]);
	}
}
