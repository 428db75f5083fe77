use std::sync::Arc;
use std::time::Duration;

use backfill_core::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use backfill_core::checkpoint::CheckpointStore;
use backfill_core::error::AppError;
use backfill_core::job::PipelineConfig;
use backfill_core::persister::PersisterConfig;
use backfill_core::pipeline::{EnrichmentPipeline, JobPlan, TracingReporter};
use backfill_core::predicate::Predicate;
use backfill_core::prompt::TemplatePrompt;
use backfill_core::testutil::{MockGenerator, make_ticket};
use backfill_core::validator::{ResponseContract, ResponseValidator};
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::integration::common::{seeded_store, setup_test_db};

fn plan() -> JobPlan<TemplatePrompt> {
    JobPlan {
        name: "tickets".into(),
        predicate: Predicate::missing("summary"),
        prompt: TemplatePrompt::new("Summarise ticket {{ticket_id}}: {{subject}}"),
        validator: ResponseValidator::new(ResponseContract {
            required_fields: vec!["summary".into()],
            ..Default::default()
        })
        .unwrap(),
    }
}

#[tokio::test]
async fn pipeline_backfills_postgres_documents() {
    let (pool, _container) = setup_test_db().await;
    let tickets: Vec<_> = (1..=5).map(|i| make_ticket(&format!("T{i}"), i)).collect();
    let seed: Vec<_> = tickets.iter().map(|(id, doc)| (id.as_str(), doc.clone())).collect();
    let store = seeded_store(&pool, "tickets", &seed).await;

    let dir = TempDir::new().unwrap();
    let generator = MockGenerator::new(r#"{"summary": "customer wants a refund"}"#).script(
        "T4",
        vec![Err(AppError::ServiceError {
            message: "bad request".into(),
            status_code: 400,
        })],
    );
    let checkpoint = CheckpointStore::open(dir.path().join("tickets.json"), 2);
    let config = PipelineConfig::default()
        .with_max_concurrent(2)
        .with_page_size(2)
        .with_retry_delay(Duration::from_millis(5))
        .with_inter_page_delay(Duration::ZERO)
        .with_manual_review_path(dir.path().join("review.json"))
        .with_persister(PersisterConfig::default().with_batch_size(3));

    let pipeline = EnrichmentPipeline::new(
        plan(),
        store.clone(),
        generator.clone(),
        checkpoint.clone(),
        CircuitBreaker::new("generation", CircuitBreakerConfig::default()),
        config,
    );
    let summary = pipeline
        .run(CancellationToken::new(), Arc::new(TracingReporter))
        .await
        .unwrap();

    assert_eq!(summary.candidates, 5);
    assert_eq!(summary.progress.persisted, 4);
    assert_eq!(summary.progress.failed, 1);
    assert_eq!(summary.manual_review, 1);

    for id in ["T1", "T2", "T3", "T5"] {
        let doc = store.get(id).await.unwrap().unwrap();
        assert_eq!(doc["summary"], json!("customer wants a refund"));
        assert_eq!(doc["ticket_id"], json!(id));
        assert!(checkpoint.is_processed(id));
    }
    assert!(checkpoint.is_failed("T4"));

    // Only the failed ticket still needs work, and the checkpoint skips it.
    let remaining = store
        .select_matching(&Predicate::missing("summary"), None, 10)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, "T4");

    let calls_before = generator.call_count();
    let rerun = EnrichmentPipeline::new(
        plan(),
        store.clone(),
        generator.clone(),
        CheckpointStore::open(dir.path().join("tickets.json"), 2),
        CircuitBreaker::new("generation", CircuitBreakerConfig::default()),
        PipelineConfig::default().with_inter_page_delay(Duration::ZERO),
    )
    .run(CancellationToken::new(), Arc::new(TracingReporter))
    .await
    .unwrap();
    assert_eq!(rerun.started, 0);
    assert_eq!(generator.call_count(), calls_before);
}
