//! Execution events and their subscribers

use crate::core::ExecutionStatus;
use crate::runner::StreamKind;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Execution events
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PipelineStarted {
        execution_id: Uuid,
        pipeline_name: String,
        total_jobs: usize,
    },
    JobStarted {
        job_id: String,
        attempt: usize,
    },
    JobRetrying {
        job_id: String,
        attempt: usize,
        max_retries: usize,
        error: String,
    },
    StepStarted {
        job_id: String,
        step: String,
        index: usize,
    },
    StepOutput {
        job_id: String,
        stream: StreamKind,
        line: String,
    },
    StepCompleted {
        job_id: String,
        step: String,
        duration_ms: u64,
    },
    StepFailed {
        job_id: String,
        step: String,
        error: String,
    },
    StepSkipped {
        job_id: String,
        step: String,
    },
    CacheRestored {
        job_id: String,
        key: String,
        matched_key: String,
    },
    CacheMiss {
        job_id: String,
        keys: Vec<String>,
    },
    CacheSaved {
        job_id: String,
        key: String,
        size_bytes: u64,
    },
    ArtifactStored {
        job_id: String,
        path: PathBuf,
    },
    JobCompleted {
        job_id: String,
        duration_ms: u64,
    },
    JobFailed {
        job_id: String,
        error: String,
    },
    JobSkipped {
        job_id: String,
        reason: String,
    },
    PipelineCompleted {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
}

/// Event handler callback type
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// Fan-out of events to registered handlers
#[derive(Clone, Default)]
pub struct EventEmitter {
    handlers: Arc<RwLock<Vec<EventHandler>>>,
}

impl EventEmitter {
    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.push(Arc::new(handler));
        }
    }

    pub fn emit(&self, event: ExecutionEvent) {
        let handlers = match self.handlers.read() {
            Ok(h) => h.clone(),
            Err(_) => return,
        };
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("EventEmitter").field("handlers", &count).finish()
    }
}
