//! Engine configuration
//!
//! Loaded once from environment variables (a `.env` file is honoured by the binary) and shared
//! read-only between cycles through an `Arc`.

use std::path::PathBuf;
use std::time::Duration;

/// Authority environment the engine talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
	Production,
	Staging,
}

impl Environment {
	/// Parses the `NFE_AMBIENTE` setting; anything starting with `PROD` is production.
	pub fn from_setting(value: &str) -> Self {
		if value.trim().to_uppercase().starts_with("PROD") {
			Environment::Production
		} else {
			Environment::Staging
		}
	}

	/// The `tpAmb` code carried in every request.
	pub fn code(&self) -> &'static str {
		match self {
			Environment::Production => "1",
			Environment::Staging => "2",
		}
	}
}

/// Distribution and event reception settings
#[derive(Debug, Clone)]
pub struct DfeConfig {
	pub environment: Environment,
	/// Explicit distribution endpoint, tried before anything else
	pub dist_url_production: Option<String>,
	pub dist_url_staging: Option<String>,
	/// WSDL-backed client mode
	pub use_wsdl: bool,
	pub wsdl_production: Option<String>,
	pub wsdl_staging: Option<String>,
	/// Local copy of the distribution WSDL used when the remote one cannot be fetched
	pub wsdl_local_path: Option<PathBuf>,
	/// National event reception endpoint tried before the built-in host list
	pub event_url_production: Option<String>,
	pub event_url_staging: Option<String>,
	pub inter_call_delay: Duration,
	/// Retries after a transient network failure before the cycle gives up
	pub max_attempts: u32,
	pub backoff_base: Duration,
	pub backoff_cap: Duration,
	/// Extra root certificates (PEM bundle) trusted by the TLS client
	pub ca_bundle: Option<PathBuf>,
	pub http_timeout: Duration,
	/// Targeted NSU pulls allowed per cycle for gap backfill
	pub backfill_cap: usize,
	/// Hard bound on cursor pulls per cycle
	pub max_exchanges: u32,
	pub throttle_wait: Duration,
	pub idle_cooldown: Duration,
	pub storage_base_path: PathBuf,
	pub data_dir: PathBuf,
}

impl Default for DfeConfig {
	fn default() -> Self {
		Self {
			environment: Environment::Staging,
			dist_url_production: None,
			dist_url_staging: None,
			use_wsdl: false,
			wsdl_production: None,
			wsdl_staging: None,
			wsdl_local_path: None,
			event_url_production: Some(
				"https://www.nfe.fazenda.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx".into(),
			),
			event_url_staging: Some(
				"https://hom.nfe.fazenda.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx".into(),
			),
			inter_call_delay: Duration::from_millis(350),
			max_attempts: 4,
			backoff_base: Duration::from_secs(8),
			backoff_cap: Duration::from_secs(180),
			ca_bundle: None,
			http_timeout: Duration::from_secs(45),
			backfill_cap: 10,
			max_exchanges: 100,
			throttle_wait: Duration::from_secs(3600),
			idle_cooldown: Duration::from_secs(3600),
			storage_base_path: PathBuf::from("storage/xml"),
			data_dir: PathBuf::from("storage/state"),
		}
	}
}

impl DfeConfig {
	/// Load configuration from environment variables, falling back to defaults for anything
	/// missing or malformed.
	pub fn from_env() -> Self {
		let defaults = Self::default();

		Self {
			environment: Environment::from_setting(
				&std::env::var("NFE_AMBIENTE").unwrap_or_else(|_| "HOMOLOG".into()),
			),
			dist_url_production: non_empty("AN_DIST_URL_PRODUCAO"),
			dist_url_staging: non_empty("AN_DIST_URL_HOMOLOG"),
			use_wsdl: std::env::var("DFE_USE_WSDL")
				.ok()
				.map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
				.unwrap_or(defaults.use_wsdl),
			wsdl_production: non_empty("AN_WSDL_PRODUCAO"),
			wsdl_staging: non_empty("AN_WSDL_HOMOLOG"),
			wsdl_local_path: non_empty("AN_WSDL_LOCAL_PATH").map(PathBuf::from),
			event_url_production: non_empty("EV_URL_PRODUCAO").or(defaults.event_url_production),
			event_url_staging: non_empty("EV_URL_HOMOLOG").or(defaults.event_url_staging),
			inter_call_delay: parsed::<u64>("DFE_SLEEP_BETWEEN_CALLS_MS")
				.map(Duration::from_millis)
				.unwrap_or(defaults.inter_call_delay),
			max_attempts: parsed("DFE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
			backoff_base: parsed::<u64>("DFE_BACKOFF_BASE_SEC")
				.map(Duration::from_secs)
				.unwrap_or(defaults.backoff_base),
			backoff_cap: parsed::<u64>("DFE_BACKOFF_CAP_SEC")
				.map(Duration::from_secs)
				.unwrap_or(defaults.backoff_cap),
			ca_bundle: non_empty("DFE_CA_BUNDLE").map(PathBuf::from),
			http_timeout: parsed::<u64>("DFE_HTTP_TIMEOUT_SEC")
				.map(Duration::from_secs)
				.unwrap_or(defaults.http_timeout),
			backfill_cap: parsed("DFE_BACKFILL_CAP").unwrap_or(defaults.backfill_cap),
			max_exchanges: parsed("DFE_MAX_EXCHANGES").unwrap_or(defaults.max_exchanges),
			throttle_wait: parsed::<u64>("DFE_THROTTLE_WAIT_SEC")
				.map(Duration::from_secs)
				.unwrap_or(defaults.throttle_wait),
			idle_cooldown: parsed::<u64>("DFE_IDLE_COOLDOWN_SEC")
				.map(Duration::from_secs)
				.unwrap_or(defaults.idle_cooldown),
			storage_base_path: non_empty("STORAGE_BASE_PATH")
				.map(PathBuf::from)
				.unwrap_or(defaults.storage_base_path),
			data_dir: non_empty("DFE_DATA_DIR")
				.map(PathBuf::from)
				.unwrap_or(defaults.data_dir),
		}
	}

	/// Distribution endpoint override for the configured environment.
	pub fn dist_url_override(&self) -> Option<&str> {
		match self.environment {
			Environment::Production => self.dist_url_production.as_deref(),
			Environment::Staging => self.dist_url_staging.as_deref(),
		}
	}

	/// WSDL reference for the configured environment.
	pub fn wsdl_url(&self) -> Option<&str> {
		match self.environment {
			Environment::Production => self.wsdl_production.as_deref(),
			Environment::Staging => self.wsdl_staging.as_deref(),
		}
	}

	/// National event reception override for the configured environment.
	pub fn event_url_override(&self) -> Option<&str> {
		match self.environment {
			Environment::Production => self.event_url_production.as_deref(),
			Environment::Staging => self.event_url_staging.as_deref(),
		}
	}
}

fn non_empty(name: &str) -> Option<String> {
	std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
	std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn environment_setting_is_prefix_matched() {
		assert_eq!(Environment::from_setting("PRODUCAO"), Environment::Production);
		assert_eq!(Environment::from_setting("producao"), Environment::Production);
		assert_eq!(Environment::from_setting("HOMOLOG"), Environment::Staging);
		assert_eq!(Environment::from_setting(""), Environment::Staging);
		assert_eq!(Environment::Production.code(), "1");
		assert_eq!(Environment::Staging.code(), "2");
	}

	#[test]
	fn overrides_follow_the_environment() {
		let config = DfeConfig {
			environment: Environment::Production,
			dist_url_production: Some("https://prod.example/dist".into()),
			dist_url_staging: Some("https://hom.example/dist".into()),
			..DfeConfig::default()
		};
		assert_eq!(config.dist_url_override(), Some("https://prod.example/dist"));
		assert_eq!(
			config.event_url_override(),
			Some("https://www.nfe.fazenda.gov.br/ws/NFeRecepcaoEvento4/NFeRecepcaoEvento4.asmx")
		);
	}
}
