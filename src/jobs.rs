use crate::{
    catalog::CatalogSource,
    engine::Reconciler,
    models::{ApiError, Summary},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info};
use uuid::Uuid;

/// Runs catalog sweeps one at a time in the background.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>>,
}

#[derive(Clone, Copy)]
struct Job {
    id: Uuid,
}

#[derive(Clone)]
struct JobRecord {
    state: JobState,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { summary: Summary },
    Failed { error: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
    pub updated_at: DateTime<Utc>,
}

impl JobQueue {
    pub fn spawn(
        catalog: Arc<dyn CatalogSource>,
        reconciler: Reconciler,
        capacity: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(capacity.max(1));
        let statuses: Arc<Mutex<HashMap<Uuid, JobRecord>>> = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                set_state(&statuses_bg, job.id, JobState::Running).await;
                let started = Instant::now();

                let state = match catalog.fetch_products().await {
                    Ok(products) => match reconciler.reconcile_catalog(products).await {
                        Ok(summary) => JobState::Completed { summary },
                        Err(err) => JobState::Failed {
                            error: err.to_string(),
                        },
                    },
                    Err(err) => JobState::Failed {
                        error: err.to_string(),
                    },
                };
                match &state {
                    JobState::Failed { error } => {
                        error!(target = "vsync.jobs", job_id = %job.id, error = %error, "sweep_failed")
                    }
                    _ => info!(
                        target = "vsync.jobs",
                        job_id = %job.id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "sweep_completed"
                    ),
                }
                set_state(&statuses_bg, job.id, state).await;
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_sweep(&self) -> Result<Uuid, ApiError> {
        let id = Uuid::new_v4();
        set_state(&self.statuses, id, JobState::Queued).await;
        if self.tx.try_send(Job { id }).is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(ApiError {
                error: "queue_unavailable".into(),
                detail: Some("sweep queue is full or the worker stopped".into()),
            });
        }
        info!(target = "vsync.jobs", job_id = %id, "sweep_queued");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|record| JobInfo {
            id: id.to_string(),
            state: record.state,
            updated_at: record.updated_at,
        })
    }
}

async fn set_state(statuses: &Mutex<HashMap<Uuid, JobRecord>>, id: Uuid, state: JobState) {
    statuses.lock().await.insert(
        id,
        JobRecord {
            state,
            updated_at: Utc::now(),
        },
    );
}
