pub mod authority;
pub mod broadcast;
pub mod certificate;
pub mod config;
pub mod db;
pub mod document;
pub mod error;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod worker;

pub use authority::{AuthorityClient, AuthorityError, AuthorityStatus, EventOutcome, SubmitOutcome};
pub use broadcast::{
    EntitySubscription, FiscalBroadcaster, FiscalEvent, JobSubscription, SubscriptionEvent,
};
pub use certificate::{CertificateManager, SigningMaterial};
pub use config::{load_config, Config, QueueConfig};
pub use document::{DocKind, DocumentStatus};
pub use error::{
    CertificateError, ConfigError, EmissorError, Result, ServiceError, StorageError,
};
pub use secrets::{SecretError, SecretStore};
pub use service::{EmissionOptions, EmissionResponse, FiscalService, JobHandle};
pub use storage::BlobStorage;
pub use worker::{WorkerContext, WorkerPool, WorkerSettings};
