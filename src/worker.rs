//! Background worker for long-running knowledge-base jobs.
//!
//! Jobs go through a bounded queue to a single task, so callers never block
//! on ingestion or vector queries and builds never run concurrently with
//! one another. Results come back over a oneshot channel per job.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::manager::{BuildReport, KnowledgeBaseManager};
use crate::retrieve::{ContextRetriever, RetrievedContext};

enum Job {
    Build {
        knowledge_base: Option<String>,
        reply: oneshot::Sender<Result<Vec<BuildReport>>>,
    },
    Retrieve {
        query: String,
        selected: Vec<String>,
        reply: oneshot::Sender<Result<RetrievedContext>>,
    },
}

/// Cloneable handle for submitting jobs.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<Job>,
}

pub struct Worker {
    manager: Arc<KnowledgeBaseManager>,
    retriever: Arc<ContextRetriever>,
    rx: mpsc::Receiver<Job>,
}

impl Worker {
    /// Spawn the worker task. It exits once every handle is dropped.
    pub fn spawn(
        manager: Arc<KnowledgeBaseManager>,
        retriever: Arc<ContextRetriever>,
        capacity: usize,
    ) -> (WorkerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Worker {
            manager,
            retriever,
            rx,
        };
        (WorkerHandle { tx }, tokio::spawn(worker.run()))
    }

    async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            match job {
                Job::Build {
                    knowledge_base,
                    reply,
                } => {
                    debug!(kb = ?knowledge_base, "build job started");
                    let result = self.manager.build(knowledge_base.as_deref()).await;
                    // The caller may have gone away.
                    let _ = reply.send(result);
                }
                Job::Retrieve {
                    query,
                    selected,
                    reply,
                } => {
                    let result = self.retriever.retrieve(&query, &selected).await;
                    let _ = reply.send(result);
                }
            }
        }
        info!("worker queue closed");
    }
}

impl WorkerHandle {
    pub async fn build(&self, knowledge_base: Option<String>) -> Result<Vec<BuildReport>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Build {
            knowledge_base,
            reply,
        })
        .await?;
        rx.await.map_err(|_| anyhow!("worker dropped the build job"))?
    }

    pub async fn retrieve(&self, query: String, selected: Vec<String>) -> Result<RetrievedContext> {
        let (reply, rx) = oneshot::channel();
        self.submit(Job::Retrieve {
            query,
            selected,
            reply,
        })
        .await?;
        rx.await
            .map_err(|_| anyhow!("worker dropped the retrieve job"))?
    }

    async fn submit(&self, job: Job) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| anyhow!("worker is not running"))
    }
}
