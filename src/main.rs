use dfe_sync::config::DfeConfig;
use dfe_sync::service::DfeService;
use dfe_sync::sync::{
	CompanyId, FileCertificateStore, FileDocumentRepository, FileXmlStorage,
};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() {
	dotenvy::dotenv().ok();

	let mut filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
	if let Ok(directive) = "dfe_sync=debug".parse() {
		filter = filter.add_directive(directive);
	}
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	let config = Arc::new(DfeConfig::from_env());
	info!(
		"Starting DF-e sync ({:?}, data in {})",
		config.environment,
		config.data_dir.display()
	);

	let Some(company_id) = std::env::var("DFE_COMPANY_ID")
		.ok()
		.and_then(|v| v.trim().parse::<CompanyId>().ok())
	else {
		error!("DFE_COMPANY_ID is not set or not a number");
		std::process::exit(2);
	};
	let Ok(tax_id) = std::env::var("DFE_COMPANY_TAX_ID") else {
		error!("DFE_COMPANY_TAX_ID is not set");
		std::process::exit(2);
	};

	let service = DfeService::new(
		config.clone(),
		Arc::new(FileDocumentRepository::new(config.data_dir.clone())),
		Arc::new(FileXmlStorage::new(config.storage_base_path.clone())),
	)
	.with_certificate_store(Arc::new(FileCertificateStore::new(config.data_dir.clone())));

	match service.run_for_company(company_id, &tax_id).await {
		Ok(Some(summary)) => {
			info!("Cycle finished: {}", summary.describe());
			for warning in &summary.warnings {
				warn!("{}", warning);
			}
			match serde_json::to_string(&summary) {
				Ok(json) => println!("{json}"),
				Err(e) => error!("Could not serialize summary: {}", e),
			}
			if !summary.ok {
				std::process::exit(1);
			}
		}
		Ok(None) => info!("Company {} is cooling down, nothing to do", company_id),
		Err(e) => {
			error!("Cycle for company {} failed: {}", company_id, e);
			std::process::exit(1);
		}
	}
}
