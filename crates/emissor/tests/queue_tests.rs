//! Queue and worker pool lifecycle.

mod common;

use common::{TestHarness, ESTABLISHMENT_ID};

use emissor::db::queue_repo::{self, JobStatus};
use emissor::document::DocKind;
use emissor::service::{EmissionOptions, EmissionResponse};

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_and_stops_workers() {
    let harness = TestHarness::new();
    let doc = harness
        .service
        .create_draft(DocKind::Cte, ESTABLISHMENT_ID, "{}")
        .unwrap();

    // Let one job complete first, proving the pool was alive.
    let response = harness
        .service
        .request_emission(
            &doc.id,
            EmissionOptions::wait_up_to(TestHarness::wait_window()),
        )
        .await
        .unwrap();
    assert!(matches!(response, EmissionResponse::Completed { .. }));

    harness.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn jobs_enqueued_after_shutdown_stay_pending() {
    let mut harness = TestHarness::new();
    harness.pool.shutdown();
    harness.pool.wait().await;

    let doc = harness
        .service
        .create_draft(DocKind::Cte, ESTABLISHMENT_ID, "{}")
        .unwrap();
    let response = harness
        .service
        .request_emission(&doc.id, EmissionOptions::asynchronous())
        .await
        .unwrap();
    let job_id = match response {
        EmissionResponse::Accepted(handle) => handle.job().id.clone(),
        EmissionResponse::Completed { .. } => panic!("No worker should be running"),
    };

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let job = queue_repo::find_by_id(&harness.db, &job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 0);
}
