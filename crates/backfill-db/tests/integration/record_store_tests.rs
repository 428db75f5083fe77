use backfill_core::models::{Fields, GenerationResult, UpdateBatch};
use backfill_core::predicate::{FieldCondition, Predicate};
use backfill_core::traits::RecordStore;
use backfill_db::{Database, PgRecordStore};
use serde_json::{Value, json};

use crate::integration::common::{seeded_store, setup_test_db};

fn fields(pairs: &[(&str, Value)]) -> Fields {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn conversations() -> Vec<(&'static str, Value)> {
    vec![
        ("c01", json!({"summary": "done", "messages": [{"text": "hi", "sentiment": "positive"}]})),
        ("c02", json!({"messages": [{"text": "hi", "sentiment": "neutral"}]})),
        ("c03", json!({"summary": null, "messages": []})),
        ("c04", json!({"summary": "", "messages": "not an array"})),
        ("c05", json!({"summary": "done", "messages": [{"text": "a"}, {"text": "b", "sentiment": "angry"}]})),
        ("c06", json!({"summary": [], "messages": [{"text": "x", "sentiment": ""}]})),
        ("c07", json!({"summary": {}, "meta": {"lang": "en"}})),
        ("c08", json!({"summary": "done", "meta": {"lang": ""}})),
        ("c09", json!({"summary": 0, "meta": {"lang": "it"}})),
    ]
}

async fn ids_matching(store: &PgRecordStore, predicate: &Predicate) -> Vec<String> {
    store
        .select_matching(predicate, None, 100)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect()
}

#[tokio::test]
async fn sql_predicates_agree_with_in_memory_matching() {
    let (pool, _container) = setup_test_db().await;
    let docs = conversations();
    let store = seeded_store(&pool, "conversations", &docs).await;

    let predicates = [
        Predicate::missing("summary"),
        Predicate::missing("meta.lang"),
        Predicate::new(vec![FieldCondition::ArrayElementMissing {
            array: "messages".into(),
            field: "sentiment".into(),
        }]),
        Predicate::missing("summary").or(FieldCondition::ArrayElementMissing {
            array: "messages".into(),
            field: "sentiment".into(),
        }),
        Predicate::default(),
    ];

    for predicate in &predicates {
        let expected: Vec<String> = docs
            .iter()
            .filter(|(_, doc)| predicate.matches(doc))
            .map(|(id, _)| id.to_string())
            .collect();

        assert_eq!(ids_matching(&store, predicate).await, expected, "{predicate:?}");
        assert_eq!(
            store.count_matching(predicate).await.unwrap(),
            expected.len() as u64,
            "{predicate:?}"
        );
    }
}

#[tokio::test]
async fn keyset_pages_cover_every_match_once() {
    let (pool, _container) = setup_test_db().await;
    let docs: Vec<(String, Value)> = (0..7)
        .map(|i| (format!("t{i:02}"), json!({"subject": format!("s{i}")})))
        .collect();
    let refs: Vec<(&str, Value)> = docs.iter().map(|(id, d)| (id.as_str(), d.clone())).collect();
    let store = seeded_store(&pool, "tickets", &refs).await;
    let predicate = Predicate::missing("summary");

    let mut seen = Vec::new();
    let mut after: Option<String> = None;
    loop {
        let page = store
            .select_matching(&predicate, after.as_deref(), 3)
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        assert!(page.len() <= 3);
        after = page.last().map(|r| r.id.clone());
        seen.extend(page.into_iter().map(|r| r.id));
    }

    let expected: Vec<String> = docs.into_iter().map(|(id, _)| id).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn bulk_update_merges_and_counts_only_existing_documents() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(
        &pool,
        "tickets",
        &[
            ("a", json!({"subject": "first", "status": "open"})),
            ("b", json!({"subject": "second"})),
        ],
    )
    .await;

    let batch = UpdateBatch::from_items(vec![
        GenerationResult::new("a", fields(&[("summary", json!("sum a")), ("urgency", json!(3))])),
        GenerationResult::new("b", fields(&[("summary", json!("sum b"))])),
        GenerationResult::new("ghost", fields(&[("summary", json!("nobody"))])),
    ]);

    let matched = store.bulk_update(&batch).await.unwrap();
    assert_eq!(matched, 2);

    let a = store.get("a").await.unwrap().unwrap();
    assert_eq!(
        a,
        json!({"subject": "first", "status": "open", "summary": "sum a", "urgency": 3})
    );
    assert_eq!(store.get("b").await.unwrap().unwrap()["summary"], json!("sum b"));
    assert!(store.get("ghost").await.unwrap().is_none());

    assert_eq!(store.count_matching(&Predicate::missing("summary")).await.unwrap(), 0);
    assert_eq!(store.bulk_update(&UpdateBatch::new(4)).await.unwrap(), 0);
}

#[tokio::test]
async fn update_one_reports_whether_a_document_matched() {
    let (pool, _container) = setup_test_db().await;
    let store = seeded_store(&pool, "tickets", &[("a", json!({"subject": "first"}))]).await;

    let summary = fields(&[("summary", json!("short"))]);
    assert!(store.update_one("a", &summary).await.unwrap());
    assert!(!store.update_one("missing", &summary).await.unwrap());
    assert_eq!(
        store.get("a").await.unwrap().unwrap(),
        json!({"subject": "first", "summary": "short"})
    );
}

#[tokio::test]
async fn collections_are_isolated() {
    let (pool, _container) = setup_test_db().await;
    let tickets = seeded_store(&pool, "tickets", &[("1", json!({"subject": "t"}))]).await;
    let calls = seeded_store(&pool, "calls", &[("1", json!({"subject": "c"}))]).await;

    assert!(tickets.update_one("1", &fields(&[("summary", json!("x"))])).await.unwrap());

    assert_eq!(tickets.count_matching(&Predicate::missing("summary")).await.unwrap(), 0);
    assert_eq!(calls.count_matching(&Predicate::missing("summary")).await.unwrap(), 1);
    assert_eq!(calls.get("1").await.unwrap().unwrap(), json!({"subject": "c"}));
}

#[tokio::test]
async fn database_vends_validated_stores() {
    let (pool, _container) = setup_test_db().await;
    seeded_store(&pool, "tickets", &[("1", json!({})), ("2", json!({}))]).await;
    let db = Database::from_pool(pool);

    db.ping().await.unwrap();
    let store = db.record_store("tickets").await.unwrap();
    assert_eq!(store.collection(), "tickets");
    assert_eq!(store.count_all().await.unwrap(), 2);

    assert!(db.record_store("tickets; DROP TABLE documents").await.is_err());
}
