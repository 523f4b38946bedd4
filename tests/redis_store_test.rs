use chrono::Duration;
use futures::future::join_all;

use essayflow::models::job::{BlobKind, DocumentFormat, EssaySettings, Job, JobInputs, SourceDocument};
use essayflow::models::state::{Event, Flow, JobStatus};
use essayflow::store::{JobStore, RedisJobStore, StoreError};

fn store() -> RedisJobStore {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    RedisJobStore::new(&url, 600).expect("Failed to open Redis")
}

fn job() -> Job {
    Job::new(
        Flow::Import,
        JobInputs {
            source: SourceDocument::Text {
                content: "x".repeat(80),
            },
            settings: EssaySettings::default(),
            reference_images: vec![],
            refinement_instructions: None,
        },
    )
}

/// Requires a running Redis reachable at REDIS_URL.
#[tokio::test]
#[ignore] // Run with: cargo test --test redis_store_test -- --ignored
async fn test_redis_compare_and_set() {
    let store = store();
    store.health_check().await.expect("Redis not reachable");

    let mut created = job();
    store.insert(&mut created).await.unwrap();
    assert!(matches!(
        store.insert(&mut created.clone()).await,
        Err(StoreError::Conflict(_))
    ));

    let mut first = store.get(created.id).await.unwrap().unwrap();
    let mut second = first.clone();
    first.apply(Event::Picked).unwrap();
    store.replace(&mut first).await.unwrap();

    second.message = "stale".to_string();
    assert!(matches!(
        store.replace(&mut second).await,
        Err(StoreError::Conflict(_))
    ));
    assert_eq!(
        store.get(created.id).await.unwrap().unwrap().status(),
        JobStatus::Extracting
    );
}

#[tokio::test]
#[ignore]
async fn test_redis_claims_are_exclusive() {
    let store = store();
    let mut created = job();
    store.insert(&mut created).await.unwrap();

    let claims = join_all((0..8).map(|i| {
        let store = &store;
        async move {
            store
                .claim_next(&format!("worker-{i}"), Duration::seconds(30))
                .await
                .unwrap()
        }
    }))
    .await;

    // other tests may leave jobs behind; only count claims on ours
    let ours: Vec<_> = claims
        .into_iter()
        .flatten()
        .filter(|(lease, _)| lease.job_id() == created.id)
        .collect();
    assert_eq!(ours.len(), 1);

    let (lease, mut claimed) = ours.into_iter().next().unwrap();
    claimed.apply(Event::Picked).unwrap();
    store.commit(&lease, &mut claimed).await.unwrap();
    assert!(store.get(created.id).await.unwrap().unwrap().claim.is_none());
}

#[tokio::test]
#[ignore]
async fn test_redis_blobs() {
    let store = store();
    let created = job();
    let kind = BlobKind::Artifact(DocumentFormat::Pdf);
    assert!(store.get_blob(created.id, kind).await.unwrap().is_none());
    store.put_blob(created.id, kind, b"%PDF").await.unwrap();
    assert_eq!(
        store.get_blob(created.id, kind).await.unwrap().as_deref(),
        Some(&b"%PDF"[..])
    );
}
