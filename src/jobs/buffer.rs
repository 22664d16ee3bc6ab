//! Per-job event log with live listener fan-out.
//!
//! Every event pushed for a job is appended to that job's log and handed to
//! the job's current listeners, synchronously and in registration order.
//! A client that reconnects replays the log and then listens again;
//! [`EventBuffer::replay_and_listen`] does both under one lock so nothing
//! falls into the gap.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hooks::{EventSink, LifecycleEvent};

/// One unit of a job's event stream, shaped like a server-sent event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedEvent {
    /// Sequence number within the job, starting at 1.
    pub id: u64,
    /// Event type tag, e.g. `"done"`.
    pub event: String,
    /// JSON-encoded payload.
    pub data: String,
}

impl BufferedEvent {
    /// Whether this event ends a job's stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event.as_str(), "done" | "error" | "cancelled")
    }

    /// Decode the payload.
    pub fn json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.data)
    }
}

/// Callback invoked for each new event. Must be cheap: it runs inline with `push`.
pub type Listener = Arc<dyn Fn(&BufferedEvent) + Send + Sync>;

#[derive(Default)]
struct JobLog {
    events: Vec<BufferedEvent>,
    listeners: Vec<(u64, Listener)>,
}

type Logs = Mutex<HashMap<Uuid, JobLog>>;

/// Handle for a registered listener.
pub struct ListenerHandle {
    job_id: Uuid,
    id: u64,
    logs: Weak<Logs>,
}

impl ListenerHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Detach the listener. A no-op if the job was cleaned up.
    pub fn unsubscribe(self) {
        if let Some(logs) = self.logs.upgrade() {
            let mut logs = logs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(log) = logs.get_mut(&self.job_id) {
                log.listeners.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

/// In-memory event buffer shared by the job executor and stream clients.
///
/// Logs are unbounded; a log lives until [`cleanup`](Self::cleanup).
#[derive(Clone, Default)]
pub struct EventBuffer {
    logs: Arc<Logs>,
    next_listener: Arc<AtomicU64>,
}

impl EventBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobLog>> {
        self.logs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an event and notify the job's listeners.
    ///
    /// Pushing to a cleaned-up job starts a fresh, listener-less log.
    pub fn push(
        &self,
        job_id: Uuid,
        event: impl Into<String>,
        data: &serde_json::Value,
    ) -> BufferedEvent {
        let (buffered, listeners) = {
            let mut logs = self.lock();
            let log = logs.entry(job_id).or_default();
            let buffered = BufferedEvent {
                id: log.events.len() as u64 + 1,
                event: event.into(),
                data: data.to_string(),
            };
            log.events.push(buffered.clone());
            let listeners: Vec<Listener> =
                log.listeners.iter().map(|(_, l)| Arc::clone(l)).collect();
            (buffered, listeners)
        };

        for listener in listeners {
            listener(&buffered);
        }
        buffered
    }

    /// Every event pushed for the job so far, in push order.
    pub fn replay(&self, job_id: Uuid) -> Vec<BufferedEvent> {
        self.lock()
            .get(&job_id)
            .map(|log| log.events.clone())
            .unwrap_or_default()
    }

    /// Receive events pushed after this call.
    pub fn add_listener(&self, job_id: Uuid, listener: Listener) -> ListenerHandle {
        let mut logs = self.lock();
        self.attach(&mut logs, job_id, listener)
    }

    /// Replay the log and attach `listener` atomically.
    ///
    /// The returned events plus everything the listener later receives is
    /// the complete stream, with no duplicates.
    pub fn replay_and_listen(
        &self,
        job_id: Uuid,
        listener: Listener,
    ) -> (Vec<BufferedEvent>, ListenerHandle) {
        let mut logs = self.lock();
        let replay = logs
            .get(&job_id)
            .map(|log| log.events.clone())
            .unwrap_or_default();
        let handle = self.attach(&mut logs, job_id, listener);
        (replay, handle)
    }

    fn attach(
        &self,
        logs: &mut HashMap<Uuid, JobLog>,
        job_id: Uuid,
        listener: Listener,
    ) -> ListenerHandle {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        logs.entry(job_id).or_default().listeners.push((id, listener));
        ListenerHandle {
            job_id,
            id,
            logs: Arc::downgrade(&self.logs),
        }
    }

    /// Whether a log exists for `job_id`.
    pub fn contains(&self, job_id: Uuid) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn has_listeners(&self, job_id: Uuid) -> bool {
        self.lock()
            .get(&job_id)
            .is_some_and(|log| !log.listeners.is_empty())
    }

    /// Drop the job's log and listeners.
    pub fn cleanup(&self, job_id: Uuid) {
        if self.lock().remove(&job_id).is_some() {
            tracing::debug!(job_id = %job_id, "Cleaned up job event buffer");
        }
    }

    /// Number of jobs with a live log.
    pub fn job_count(&self) -> usize {
        self.lock().len()
    }
}

/// Copies every lifecycle event it receives into one job's log, tagged
/// with the event's wire name.
pub(crate) struct BufferSink {
    buffer: EventBuffer,
    job_id: Uuid,
}

impl BufferSink {
    pub(crate) fn new(buffer: EventBuffer, job_id: Uuid) -> Self {
        Self { buffer, job_id }
    }
}

impl EventSink for BufferSink {
    fn deliver(&self, event: LifecycleEvent) {
        let kind = event.kind();
        match serde_json::to_value(&event) {
            Ok(data) => {
                self.buffer.push(self.job_id, kind.name(), &data);
            }
            Err(e) => {
                tracing::warn!(job_id = %self.job_id, event = %kind, error = %e, "Failed to buffer lifecycle event");
            }
        }
    }
}
