mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{FixedConnector, RoutedHttp, TAX_ID, dist_answer, http_ok, targeted_nsu};
use dfe_sync::config::DfeConfig;
use dfe_sync::service::DfeService;
use dfe_sync::sync::{
	Cursor, DocumentRepository, FileDocumentRepository, MemoryDocumentRepository,
	MemoryXmlStorage,
};
use dfe_sync::ws::Nsu;
use std::sync::Arc;
use std::time::Duration;

fn config() -> DfeConfig {
	DfeConfig {
		inter_call_delay: Duration::ZERO,
		..DfeConfig::default()
	}
}

async fn cursor_at(repository: &dyn DocumentRepository, company_id: i64, nsu: u64) {
	let mut cursor = Cursor::new(Utc::now());
	cursor.advance(Nsu::new(nsu), Nsu::new(nsu), Utc::now());
	repository.save_cursor(company_id, &cursor).await.unwrap();
}

#[tokio::test]
async fn batch_with_a_gap_is_backfilled() {
	let http = RoutedHttp::new(|_, body| {
		if let Some(nsu) = targeted_nsu(body) {
			return http_ok(dist_answer(138, nsu, 104, &[nsu]));
		}
		if body.contains("<ultNSU>000000000000100</ultNSU>") {
			http_ok(dist_answer(138, 104, 104, &[101, 103, 104]))
		} else {
			http_ok(dist_answer(137, 104, 104, &[]))
		}
	});
	let repository = Arc::new(MemoryDocumentRepository::new());
	let storage = Arc::new(MemoryXmlStorage::new());
	cursor_at(repository.as_ref(), 1, 100).await;

	let service = DfeService::new(Arc::new(config()), repository.clone(), storage.clone())
		.with_connector(Arc::new(FixedConnector(http.clone())));
	let summary = service
		.run(1, TAX_ID, &common::identity())
		.await
		.unwrap();

	assert!(summary.ok, "{summary:?}");
	assert_eq!(summary.processed_count, 4);
	assert_eq!(summary.backfilled, 1);
	assert_eq!(summary.gaps_remaining, 0);
	assert_eq!(summary.final_cursor, Nsu::new(104));
	assert_eq!(summary.per_schema_counts.get("resNFe"), Some(&4));

	let targeted: Vec<u64> = http.bodies().iter().filter_map(|b| targeted_nsu(b)).collect();
	assert_eq!(targeted, vec![102]);

	let mut nsus: Vec<u64> = repository
		.documents()
		.iter()
		.map(|d| d.record.nsu.value())
		.collect();
	nsus.sort_unstable();
	assert_eq!(nsus, vec![101, 102, 103, 104]);
	assert!(repository.documents().iter().all(|d| d.record.document_key.is_some()));
	assert_eq!(storage.references().len(), 4);

	let cursor = repository.load_cursor(1).await.unwrap().unwrap();
	assert_eq!(cursor.last_acknowledged_nsu, Nsu::new(104));
	// caught up: the next cycle waits for the idle cool-down
	assert!(!cursor.is_due(Utc::now()));
}

#[tokio::test]
async fn throttled_cycle_persists_the_returned_cursor() {
	let http = RoutedHttp::new(|_, _| http_ok(dist_answer(656, 120, 150, &[])));
	let repository = Arc::new(MemoryDocumentRepository::new());
	cursor_at(repository.as_ref(), 1, 100).await;

	let service = DfeService::new(
		Arc::new(config()),
		repository.clone(),
		Arc::new(MemoryXmlStorage::new()),
	)
	.with_connector(Arc::new(FixedConnector(http.clone())));
	let summary = service
		.run(1, TAX_ID, &common::identity())
		.await
		.unwrap();

	assert!(summary.stopped);
	assert_eq!(summary.stop_reason.as_deref(), Some("throttled"));
	assert_eq!(summary.resume_after_secs, Some(3600));
	assert_eq!(summary.exchanges, 1);
	assert_eq!(summary.processed_count, 0);
	assert_eq!(http.bodies().len(), 1);

	let cursor = repository.load_cursor(1).await.unwrap().unwrap();
	assert_eq!(cursor.last_acknowledged_nsu, Nsu::new(120));
	assert_eq!(cursor.last_known_max_nsu, Nsu::new(150));
	let resume = cursor.resume_after.unwrap();
	assert!(resume > Utc::now() + ChronoDuration::minutes(59));
}

#[tokio::test]
async fn outage_stops_without_failing() {
	let http = RoutedHttp::new(|_, _| http_ok(dist_answer(108, 0, 0, &[])));
	let dir = tempfile::tempdir().unwrap();
	let repository = Arc::new(FileDocumentRepository::new(dir.path().to_path_buf()));

	let service = DfeService::new(
		Arc::new(config()),
		repository.clone(),
		Arc::new(MemoryXmlStorage::new()),
	)
	.with_connector(Arc::new(FixedConnector(http)));
	let summary = service
		.run(3, TAX_ID, &common::identity())
		.await
		.unwrap();

	assert!(summary.ok);
	assert!(summary.stopped);
	assert_eq!(summary.stop_reason.as_deref(), Some("service_down"));
	assert_eq!(summary.final_cursor, Nsu::ZERO);
	assert!(repository.load_cursor(3).await.unwrap().is_some());
}

#[tokio::test]
async fn cooling_down_company_is_skipped() {
	let http = RoutedHttp::new(|_, _| http_ok(dist_answer(137, 0, 0, &[])));
	let repository = Arc::new(MemoryDocumentRepository::new());
	let mut cursor = Cursor::new(Utc::now());
	cursor.resume_after = Some(Utc::now() + ChronoDuration::hours(1));
	repository.save_cursor(9, &cursor).await.unwrap();

	let service = DfeService::new(
		Arc::new(config()),
		repository,
		Arc::new(MemoryXmlStorage::new()),
	)
	.with_connector(Arc::new(FixedConnector(http.clone())));

	assert!(service.run_for_company(9, TAX_ID).await.unwrap().is_none());
	assert!(http.bodies().is_empty());
}
