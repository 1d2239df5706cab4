//! Inventory provenance and change detection against a real Postgres:
//! idempotent upserts, revival on re-observation, and the run-over-run
//! new/candidate-stale lifecycle.

use sqlx::{PgPool, Row};

use vigil_core::changes::ChangeDetector;
use vigil_core::db::{InventoryRepo, TargetRepo};
use vigil_core::model::{
    ArtifactStatus, AssetArtifact, AssetKind, EdgeArtifact, Proto, RelType, ScanOutput,
    ServiceArtifact,
};
use vigil_core::pipeline::{build_http_targets, PipelineStage};
use vigil_core::scope::ScopePolicy;
use vigil_core::types::{RunId, TargetId};

const ALL_STAGES: &[PipelineStage] = &[
    PipelineStage::Subfinder,
    PipelineStage::DnsResolve,
    PipelineStage::Nmap,
    PipelineStage::Httpx,
    PipelineStage::Nuclei,
];

async fn seed_target(pool: &PgPool) -> TargetId {
    let repo = TargetRepo::new(pool.clone());
    let root = format!("{}.example.com", uuid::Uuid::now_v7().simple());
    let target = repo
        .create(&root, &root, &ScopePolicy::for_root(&root))
        .await
        .expect("seed target");
    target.id
}

async fn seed_run(pool: &PgPool, target_id: TargetId) -> RunId {
    let run_id = RunId::new();
    sqlx::query(
        "INSERT INTO runs (id, target_id, trigger, status) VALUES ($1, $2, 'manual', 'running')",
    )
    .bind(run_id.0)
    .bind(target_id.0)
    .execute(pool)
    .await
    .expect("seed run");
    run_id
}

fn subdomain(name: &str) -> AssetArtifact {
    AssetArtifact {
        kind: AssetKind::Subdomain,
        value: name.to_string(),
        normalized: name.to_string(),
    }
}

fn ip(addr: &str) -> AssetArtifact {
    AssetArtifact {
        kind: AssetKind::Ip,
        value: addr.to_string(),
        normalized: addr.to_string(),
    }
}

fn url(value: &str) -> AssetArtifact {
    AssetArtifact {
        kind: AssetKind::Url,
        value: value.to_string(),
        normalized: value.to_string(),
    }
}

/// Baseline observation set: two subdomains, one of which resolves to a host
/// with an open web port serving one URL.
fn first_run_output() -> ScanOutput {
    let mut output = ScanOutput::default();
    output.assets.push(subdomain("a.example.com"));
    output.assets.push(subdomain("b.example.com"));
    output.assets.push(ip("1.2.3.4"));
    output.assets.push(url("http://a.example.com/"));
    output.edges.push(EdgeArtifact {
        from: subdomain("a.example.com"),
        to: ip("1.2.3.4"),
        rel_type: RelType::ResolvesTo,
    });
    output.edges.push(EdgeArtifact {
        from: subdomain("a.example.com"),
        to: url("http://a.example.com/"),
        rel_type: RelType::Serves,
    });
    output.services.push(ServiceArtifact {
        host: ip("1.2.3.4"),
        port: 80,
        proto: Proto::Tcp,
        name: Some("http".to_string()),
        product: Some("nginx".to_string()),
        version: None,
    });
    output
}

async fn snapshot(pool: &PgPool, target_id: TargetId) -> Vec<(String, String, String, String)> {
    sqlx::query(
        r#"
        SELECT kind, normalized, status, COALESCE(last_seen_run_id::text, '') AS last_run
        FROM assets WHERE target_id = $1
        ORDER BY kind, normalized
        "#,
    )
    .bind(target_id.0)
    .fetch_all(pool)
    .await
    .expect("snapshot")
    .into_iter()
    .map(|row| {
        (
            row.get::<String, _>("kind"),
            row.get::<String, _>("normalized"),
            row.get::<String, _>("status"),
            row.get::<String, _>("last_run"),
        )
    })
    .collect()
}

#[sqlx::test]
async fn first_run_creates_inventory_with_matching_provenance(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    inventory
        .ingest_batch(target_id, run_id, &first_run_output())
        .await
        .expect("ingest");

    let assets: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets WHERE target_id = $1")
        .bind(target_id.0)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(assets, 4);

    let services: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM services WHERE target_id = $1")
        .bind(target_id.0)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(services, 1);

    let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edges WHERE target_id = $1")
        .bind(target_id.0)
        .fetch_one(&pool)
        .await
        .expect("count");
    assert_eq!(edges, 2);

    let provenance_ok: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM assets
        WHERE target_id = $1
          AND first_seen_run_id = $2
          AND last_seen_run_id = $2
          AND status = 'active'
          AND first_seen_at <= last_seen_at
        "#,
    )
    .bind(target_id.0)
    .bind(run_id.0)
    .fetch_one(&pool)
    .await
    .expect("provenance");
    assert_eq!(provenance_ok, 4, "first and last seen start equal");
}

#[sqlx::test]
async fn replaying_the_same_batch_is_idempotent(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    inventory
        .ingest_batch(target_id, run_id, &first_run_output())
        .await
        .expect("ingest");
    let before = snapshot(&pool, target_id).await;

    inventory
        .ingest_batch(target_id, run_id, &first_run_output())
        .await
        .expect("replay");
    let after = snapshot(&pool, target_id).await;

    assert_eq!(before, after, "replaying ingestion changes nothing");
}

#[sqlx::test]
async fn second_run_with_identical_observations_yields_zero_changes(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let detector = ChangeDetector::new(pool.clone());
    let target_id = seed_target(&pool).await;

    let run1 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run1, &first_run_output())
        .await
        .expect("run1");
    let summary1 = detector
        .detect(target_id, run1, ALL_STAGES, 3)
        .await
        .expect("diff 1");
    assert_eq!(summary1.new_assets, 4);
    assert_eq!(summary1.stale_assets, 0);

    let run2 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run2, &first_run_output())
        .await
        .expect("run2");
    let summary2 = detector
        .detect(target_id, run2, ALL_STAGES, 3)
        .await
        .expect("diff 2");

    assert_eq!(summary2.new_assets, 0);
    assert_eq!(summary2.new_services, 0);
    assert_eq!(summary2.new_edges, 0);
    assert_eq!(summary2.stale_assets, 0);
    assert_eq!(summary2.stale_services, 0);

    let advanced: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM assets WHERE target_id = $1 AND last_seen_run_id = $2",
    )
    .bind(target_id.0)
    .bind(run2.0)
    .fetch_one(&pool)
    .await
    .expect("count");
    assert_eq!(advanced, 4, "last_seen advances to run two");
}

#[sqlx::test]
async fn disappearance_marks_stale_and_enqueues_verification(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let detector = ChangeDetector::new(pool.clone());
    let target_id = seed_target(&pool).await;

    let run1 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run1, &first_run_output())
        .await
        .expect("run1");

    // Third run: b.example.com is gone, the service on
    // 1.2.3.4 is still open.
    let mut third = ScanOutput::default();
    third.assets.push(subdomain("a.example.com"));
    third.assets.push(ip("1.2.3.4"));
    third.assets.push(url("http://a.example.com/"));
    third.edges.push(EdgeArtifact {
        from: subdomain("a.example.com"),
        to: ip("1.2.3.4"),
        rel_type: RelType::ResolvesTo,
    });
    third.services.push(ServiceArtifact {
        host: ip("1.2.3.4"),
        port: 80,
        proto: Proto::Tcp,
        name: Some("http".to_string()),
        product: None,
        version: None,
    });

    let run3 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run3, &third)
        .await
        .expect("run3");
    let summary = detector
        .detect(target_id, run3, ALL_STAGES, 3)
        .await
        .expect("diff");

    assert_eq!(summary.stale_assets, 1, "only b.example.com went missing");
    assert_eq!(summary.stale_services, 0);

    let row = sqlx::query(
        "SELECT status, status_reason FROM assets WHERE target_id = $1 AND normalized = 'b.example.com'",
    )
    .bind(target_id.0)
    .fetch_one(&pool)
    .await
    .expect("stale row");
    assert_eq!(row.get::<String, _>("status"), "stale");
    assert_eq!(
        row.get::<String, _>("status_reason"),
        format!("not_seen_in_run:{run3}")
    );

    let verify_jobs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM jobs WHERE target_id = $1 AND kind = 'verify_asset' AND status = 'queued'",
    )
    .bind(target_id.0)
    .fetch_one(&pool)
    .await
    .expect("jobs");
    assert_eq!(verify_jobs, 1);
}

#[sqlx::test]
async fn skipped_nmap_stage_does_not_stale_services(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let detector = ChangeDetector::new(pool.clone());
    let target_id = seed_target(&pool).await;

    let run1 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run1, &first_run_output())
        .await
        .expect("run1");

    // A later run that never reached nmap: only subdomains observed.
    let mut partial = ScanOutput::default();
    partial.assets.push(subdomain("a.example.com"));
    partial.assets.push(subdomain("b.example.com"));
    let run2 = seed_run(&pool, target_id).await;
    inventory
        .ingest_batch(target_id, run2, &partial)
        .await
        .expect("run2");

    let summary = detector
        .detect(
            target_id,
            run2,
            &[PipelineStage::Subfinder, PipelineStage::DnsResolve],
            3,
        )
        .await
        .expect("diff");

    assert_eq!(summary.stale_services, 0, "nmap never ran this run");
    let service_status: String = sqlx::query_scalar(
        "SELECT status FROM services WHERE target_id = $1",
    )
    .bind(target_id.0)
    .fetch_one(&pool)
    .await
    .expect("service row");
    assert_eq!(service_status, "active");
}

#[sqlx::test]
async fn reobservation_revives_stale_artifacts(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let target_id = seed_target(&pool).await;
    let run1 = seed_run(&pool, target_id).await;

    let outcome = inventory
        .upsert_asset_seen(
            target_id,
            run1,
            AssetKind::Subdomain,
            "b.example.com",
            "b.example.com",
        )
        .await
        .expect("insert");
    assert!(outcome.created);

    inventory
        .set_asset_status(outcome.id, ArtifactStatus::Stale, Some("not_seen_in_run:x"), None)
        .await
        .expect("mark stale");

    let run2 = seed_run(&pool, target_id).await;
    let revived = inventory
        .upsert_asset_seen(
            target_id,
            run2,
            AssetKind::Subdomain,
            "b.example.com",
            "b.example.com",
        )
        .await
        .expect("revive");
    assert!(!revived.created);
    assert_eq!(revived.id, outcome.id);

    let row = sqlx::query(
        "SELECT status, status_reason, verified_at FROM assets WHERE id = $1",
    )
    .bind(outcome.id.0)
    .fetch_one(&pool)
    .await
    .expect("row");
    assert_eq!(row.get::<String, _>("status"), "active");
    assert!(row.get::<Option<String>, _>("status_reason").is_none());
    assert!(
        row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("verified_at")
            .is_some(),
        "revival records verification"
    );
}

#[sqlx::test]
async fn service_fingerprint_merge_keeps_known_fields(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let target_id = seed_target(&pool).await;
    let run1 = seed_run(&pool, target_id).await;

    let host = inventory
        .upsert_asset_seen(target_id, run1, AssetKind::Ip, "1.2.3.4", "1.2.3.4")
        .await
        .expect("host");
    inventory
        .upsert_service_seen(
            target_id,
            run1,
            host.id,
            443,
            Proto::Tcp,
            Some("https"),
            Some("nginx"),
            Some("1.25.3"),
        )
        .await
        .expect("first sighting");

    // A later scanner sees the port but fingerprints nothing.
    let run2 = seed_run(&pool, target_id).await;
    inventory
        .upsert_service_seen(target_id, run2, host.id, 443, Proto::Tcp, None, None, None)
        .await
        .expect("second sighting");

    let row = sqlx::query(
        "SELECT name, product, version, last_seen_run_id FROM services WHERE target_id = $1",
    )
    .bind(target_id.0)
    .fetch_one(&pool)
    .await
    .expect("row");
    assert_eq!(row.get::<Option<String>, _>("name").as_deref(), Some("https"));
    assert_eq!(row.get::<Option<String>, _>("product").as_deref(), Some("nginx"));
    assert_eq!(row.get::<Option<String>, _>("version").as_deref(), Some("1.25.3"));
    assert_eq!(row.get::<uuid::Uuid, _>("last_seen_run_id"), run2.0);
}

#[sqlx::test]
async fn web_candidates_feed_http_target_construction(pool: PgPool) {
    let inventory = InventoryRepo::new(pool.clone());
    let target_id = seed_target(&pool).await;
    let run_id = seed_run(&pool, target_id).await;

    inventory
        .ingest_batch(target_id, run_id, &first_run_output())
        .await
        .expect("ingest");

    let candidates = inventory
        .web_candidates(target_id, run_id)
        .await
        .expect("candidates");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].host, "1.2.3.4");
    assert_eq!(candidates[0].via_name.as_deref(), Some("a.example.com"));
    assert_eq!(candidates[0].port, 80);

    let targets = build_http_targets(&candidates, 10);
    assert_eq!(targets, vec!["http://a.example.com/"]);
}
