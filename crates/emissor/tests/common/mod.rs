//! Test harness for isolated fiscal pipeline execution.
//!
//! `TestHarness` wires up a complete in-memory environment: database,
//! blob storage in a temp directory, an uploaded and bound certificate,
//! a scripted authority client, and a running worker pool with fast
//! retry settings.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use emissor::authority::{
    AuthorityClient, AuthorityError, AuthorityRequest, AuthorityStatus, CancelRequest,
    EventOutcome, SubmitOutcome,
};
use emissor::broadcast::FiscalBroadcaster;
use emissor::certificate::{CertificateManager, SigningMaterial};
use emissor::config::QueueConfig;
use emissor::db::{establishment_repo, Database};
use emissor::secrets::SecretStore;
use emissor::service::FiscalService;
use emissor::storage::BlobStorage;
use emissor::worker::{WorkerContext, WorkerPool, WorkerSettings};

/// One scripted reply for a `submit` call.
#[derive(Debug, Clone)]
pub enum ScriptedCall {
    /// Accepted with a protocol; emissions also get an access key.
    Accept,
    Reject { reason: String },
    Unavailable,
    /// Never answers within the worker's call deadline.
    Hang,
}

/// Authority double driven by a script of replies. When the script runs
/// dry, every call is accepted.
pub struct MockAuthority {
    script: Mutex<VecDeque<ScriptedCall>>,
    status: Mutex<AuthorityStatus>,
    submit_calls: AtomicUsize,
    status_calls: AtomicUsize,
    requests: Mutex<Vec<AuthorityRequest>>,
    /// Container bytes received alongside each submit/cancel call.
    containers: Mutex<Vec<Vec<u8>>>,
}

impl MockAuthority {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            status: Mutex::new(AuthorityStatus::Unknown),
            submit_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            containers: Mutex::new(Vec::new()),
        }
    }

    pub fn script(&self, calls: Vec<ScriptedCall>) {
        *self.script.lock().unwrap() = calls.into();
    }

    /// Sets what `query_status` reports, for salvage scenarios.
    pub fn set_status(&self, status: AuthorityStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<AuthorityRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Certificate containers received with signing calls, in call order.
    pub fn recorded_containers(&self) -> Vec<Vec<u8>> {
        self.containers.lock().unwrap().clone()
    }
}

impl MockAuthority {
    async fn play(&self) -> Result<SubmitOutcome, AuthorityError> {
        let call = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedCall::Accept);

        match call {
            ScriptedCall::Accept => {
                let n = self.submit_calls.load(Ordering::SeqCst);
                Ok(SubmitOutcome {
                    access_key: Some(format!("3526099999999900019957{:022}", n)),
                    outcome: EventOutcome::Accepted {
                        protocol: format!("135260000{:06}", n),
                        processed_at: "2026-08-29T12:00:00.000000Z".to_string(),
                    },
                })
            }
            ScriptedCall::Reject { reason } => Ok(SubmitOutcome {
                access_key: None,
                outcome: EventOutcome::Rejected { reason },
            }),
            ScriptedCall::Unavailable => Err(AuthorityError::Unavailable(
                "connection refused".to_string(),
            )),
            ScriptedCall::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AuthorityError::Unavailable("unreachable".to_string()))
            }
        }
    }
}

#[async_trait]
impl AuthorityClient for MockAuthority {
    async fn submit(
        &self,
        request: &AuthorityRequest,
        signing: &SigningMaterial,
    ) -> Result<SubmitOutcome, AuthorityError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        self.containers.lock().unwrap().push(signing.container.clone());
        self.play().await
    }

    async fn cancel(
        &self,
        _request: &CancelRequest,
        signing: &SigningMaterial,
    ) -> Result<SubmitOutcome, AuthorityError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.containers.lock().unwrap().push(signing.container.clone());
        self.play().await
    }

    async fn query_status(&self, _document_id: &str) -> Result<AuthorityStatus, AuthorityError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }
}

pub struct TestHarness {
    pub db: Database,
    pub service: FiscalService,
    pub broadcaster: FiscalBroadcaster,
    pub authority: Arc<MockAuthority>,
    pub certificates: Arc<CertificateManager>,
    pub pool: WorkerPool,
    temp_dir: TempDir,
}

pub const ESTABLISHMENT_ID: &str = "est-1";

/// Container bytes the harness uploads as the bound certificate.
pub const CONTAINER_BYTES: &[u8] = b"pkcs12 container bytes";

impl TestHarness {
    /// Full environment: certificate bound, two workers, three attempts.
    pub fn new() -> Self {
        Self::build(3, true)
    }

    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::build(max_attempts, true)
    }

    /// No certificate bound to the establishment; jobs must fail fast.
    pub fn without_certificate() -> Self {
        Self::build(3, false)
    }

    fn build(max_attempts: u32, bind_certificate: bool) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let db = Database::open_in_memory().expect("Failed to open database");
        establishment_repo::insert(&db, ESTABLISHMENT_ID, "11222333000181", "Transportes Teste")
            .expect("Failed to insert establishment");

        let storage = BlobStorage::new(temp_dir.path());
        let secrets = SecretStore::from_secret("harness-master-secret").unwrap();
        let certificates = Arc::new(CertificateManager::new(db.clone(), storage, secrets));

        if bind_certificate {
            let cert = certificates
                .upload("matriz.pfx", CONTAINER_BYTES, "senha123")
                .expect("Failed to upload certificate");
            certificates
                .bind(ESTABLISHMENT_ID, &cert.id)
                .expect("Failed to bind certificate");
        }

        let broadcaster = FiscalBroadcaster::default();
        let authority = Arc::new(MockAuthority::new());

        // Fast settings so retries and polls resolve within test time.
        let settings = WorkerSettings {
            poll_interval: Duration::from_millis(10),
            call_timeout: Duration::from_millis(200),
            stale_after: Duration::from_secs(120),
            backoff_base_secs: 0,
            backoff_cap_secs: 0,
            max_attempts,
        };

        let queue_config = QueueConfig {
            max_attempts,
            ..QueueConfig::default()
        };
        let service = FiscalService::new(db.clone(), broadcaster.clone(), &queue_config);

        let ctx = WorkerContext {
            db: db.clone(),
            certificates: Arc::clone(&certificates),
            authority: Arc::clone(&authority) as Arc<dyn AuthorityClient>,
            broadcaster: broadcaster.clone(),
            settings,
        };
        let pool = WorkerPool::start(ctx, 2);

        Self {
            db,
            service,
            broadcaster,
            authority,
            certificates,
            pool,
            temp_dir,
        }
    }

    /// Generous sync wait for tests: workers answer well inside this.
    pub fn wait_window() -> Duration {
        Duration::from_secs(10)
    }

    pub async fn stop(mut self) {
        self.pool.shutdown();
        self.pool.wait().await;
    }
}
