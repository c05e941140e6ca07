//! Realtime fiscal event broadcaster.
//!
//! Workers publish queue and document changes here; clients subscribe
//! instead of polling the database. One subscription tracks one job and
//! closes itself after delivering the job's terminal event.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::db::document_repo::DocumentRow;
use crate::db::queue_repo::JobRow;

/// A change pushed to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FiscalEvent {
    /// A queue job changed status.
    QueueUpdate { job: JobRow },
    /// A document changed status.
    EntityUpdate { document: DocumentRow },
}

impl FiscalEvent {
    /// The ID of the entity this event is about. For queue updates that is
    /// the job's document, so one subscription sees both streams.
    pub fn entity_id(&self) -> &str {
        match self {
            FiscalEvent::QueueUpdate { job } => &job.entity_id,
            FiscalEvent::EntityUpdate { document } => &document.id,
        }
    }
}

/// What a job subscription yields.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A non-terminal update for the watched job or its document.
    Update(FiscalEvent),
    /// The watched job reached a terminal status. Delivered exactly once;
    /// the subscription is closed afterwards.
    Finished(JobRow),
}

#[derive(Clone)]
pub struct FiscalBroadcaster {
    sender: Arc<broadcast::Sender<FiscalEvent>>,
}

impl FiscalBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Publishes an event to all subscribers. No receivers is fine.
    pub fn publish(&self, event: FiscalEvent) {
        let _ = self.sender.send(event);
    }

    pub fn publish_job(&self, job: &JobRow) {
        self.publish(FiscalEvent::QueueUpdate { job: job.clone() });
    }

    pub fn publish_document(&self, document: &DocumentRow) {
        self.publish(FiscalEvent::EntityUpdate {
            document: document.clone(),
        });
    }

    /// Subscribes to the raw firehose of all events.
    pub fn subscribe_raw(&self) -> broadcast::Receiver<FiscalEvent> {
        self.sender.subscribe()
    }

    /// Subscribes to one job's lifecycle. Subscribe before enqueueing to
    /// guarantee no event is missed.
    pub fn subscribe_job(&self, job_id: &str, entity_id: &str) -> JobSubscription {
        JobSubscription {
            receiver: self.sender.subscribe(),
            job_id: job_id.to_string(),
            entity_id: entity_id.to_string(),
            finished: false,
        }
    }

    /// Subscribes to every event concerning one entity, with no terminal
    /// semantics: stays open until dropped. Suits callers tracking a
    /// document past any single job (an async cancellation, say).
    pub fn subscribe_entity(&self, entity_id: &str) -> EntitySubscription {
        EntitySubscription {
            receiver: self.sender.subscribe(),
            entity_id: entity_id.to_string(),
        }
    }
}

/// An open-ended filtered view of one entity's events.
pub struct EntitySubscription {
    receiver: broadcast::Receiver<FiscalEvent>,
    entity_id: String,
}

impl EntitySubscription {
    /// Next event for the watched entity; `None` when the broadcaster is
    /// gone.
    pub async fn next(&mut self) -> Option<FiscalEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.entity_id() == self.entity_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Entity subscription for {} lagged, {} events skipped",
                        self.entity_id,
                        skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Default for FiscalBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A filtered view of the event stream for a single job and its document.
pub struct JobSubscription {
    receiver: broadcast::Receiver<FiscalEvent>,
    job_id: String,
    entity_id: String,
    finished: bool,
}

impl JobSubscription {
    /// Waits for the next event concerning the watched job or document.
    ///
    /// Returns `None` once the terminal event has been delivered or the
    /// broadcaster is gone. A lagged receiver skips dropped events and
    /// keeps listening; the terminal event still arrives as long as the
    /// channel capacity outlasts the burst.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if event.entity_id() != self.entity_id {
                        continue;
                    }
                    if let FiscalEvent::QueueUpdate { job } = &event {
                        if job.id == self.job_id && job.status.is_terminal() {
                            self.finished = true;
                            return Some(SubscriptionEvent::Finished(job.clone()));
                        }
                    }
                    return Some(SubscriptionEvent::Update(event));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscription for job {} lagged, {} events skipped",
                        self.job_id,
                        skipped
                    );
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Waits until the watched job finishes, discarding intermediate
    /// updates. `None` when the broadcaster shut down first.
    pub async fn finished(&mut self) -> Option<JobRow> {
        while let Some(event) = self.next().await {
            if let SubscriptionEvent::Finished(job) = event {
                return Some(job);
            }
        }
        None
    }
}
