use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::Segment;
use crate::runtime::types::{ProcessingStage, TaskId, TaskStatus};

/// Event delivered to live subscribers of a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Connected {
        task_id: TaskId,
    },
    Progress {
        task_id: TaskId,
        status: TaskStatus,
        progress: f64,
        current_stage: Option<ProcessingStage>,
        message: String,
    },
    /// One finished segment, sent as soon as its quizzes exist.
    SegmentReady {
        task_id: TaskId,
        index: usize,
        segment: Segment,
    },
    Completed {
        task_id: TaskId,
        total_segments: usize,
        title: String,
        message: String,
    },
    Error {
        task_id: TaskId,
        error: String,
    },
}

impl TaskEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Connected { .. } => "connected",
            TaskEvent::Progress { .. } => "progress",
            TaskEvent::SegmentReady { .. } => "segment_ready",
            TaskEvent::Completed { .. } => "completed",
            TaskEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskEvent::Completed { .. } | TaskEvent::Error { .. })
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("subscriber buffer full")]
    Full,
    #[error("subscriber disconnected")]
    Closed,
}

/// One live subscriber connection.
///
/// `send` must not block: a sink that cannot accept an event right now
/// returns an error and that delivery is dropped.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &TaskEvent) -> Result<(), SinkError>;

    /// `true` once the underlying transport has gone away.
    fn is_closed(&self) -> bool {
        false
    }
}

impl EventSink for mpsc::Sender<TaskEvent> {
    fn send(&self, event: &TaskEvent) -> Result<(), SinkError> {
        self.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }

    fn is_closed(&self) -> bool {
        mpsc::Sender::is_closed(self)
    }
}

pub type SubscriberId = u64;

type Subscribers = HashMap<TaskId, Vec<(SubscriberId, Arc<dyn EventSink>)>>;

/// Per-task broadcast of [`TaskEvent`]s to live subscribers.
///
/// Delivery is fire-and-forget and at most once. The lock is only held to
/// snapshot or edit the subscriber lists, never while sending.
#[derive(Clone, Default)]
pub struct EventFanout {
    subscribers: Arc<RwLock<Subscribers>>,
    next_id: Arc<AtomicU64>,
}

impl std::fmt::Debug for EventFanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tasks = self
            .subscribers
            .read()
            .map(|s| s.len())
            .unwrap_or_default();
        write!(f, "EventFanout({tasks} tasks)")
    }
}

impl EventFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` for `task_id` and greet it with a `connected` event.
    pub fn subscribe(&self, task_id: &str, sink: Arc<dyn EventSink>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let _ = sink.send(&TaskEvent::Connected {
            task_id: task_id.to_owned(),
        });
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(task_id.to_owned())
            .or_default()
            .push((id, sink));
        debug!(task_id, subscriber = id, "subscriber attached");
        id
    }

    pub fn unsubscribe(&self, task_id: &str, subscriber: SubscriberId) {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(list) = guard.get_mut(task_id) {
            list.retain(|(id, _)| *id != subscriber);
            if list.is_empty() {
                guard.remove(task_id);
            }
        }
        debug!(task_id, subscriber, "subscriber detached");
    }

    /// Deliver `event` to every subscriber of `task_id`.
    pub fn publish(&self, task_id: &str, event: TaskEvent) {
        let sinks: Vec<(SubscriberId, Arc<dyn EventSink>)> = {
            let guard = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            match guard.get(task_id) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        self.deliver(task_id, &sinks, &event);
    }

    /// Deliver `event` to every subscriber of every task.
    pub fn broadcast(&self, event: TaskEvent) {
        let all: Vec<(TaskId, Vec<(SubscriberId, Arc<dyn EventSink>)>)> = {
            let guard = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (task_id, sinks) in all {
            self.deliver(&task_id, &sinks, &event);
        }
    }

    /// Forget every subscriber of a task.
    pub fn drop_task(&self, task_id: &str) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(task_id)
            .map_or(0, Vec::len)
    }

    fn deliver(
        &self,
        task_id: &str,
        sinks: &[(SubscriberId, Arc<dyn EventSink>)],
        event: &TaskEvent,
    ) {
        let mut closed = Vec::new();
        for (id, sink) in sinks {
            if let Err(e) = sink.send(event) {
                debug!(task_id, subscriber = id, kind = event.kind(), error = %e, "event dropped");
                if sink.is_closed() {
                    closed.push(*id);
                }
            }
        }
        for id in closed {
            self.unsubscribe(task_id, id);
        }
    }
}
