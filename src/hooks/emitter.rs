//! Typed pub/sub for lifecycle events.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::hooks::event::{EventKind, HookPayload, LifecycleEvent};

/// Which events reach subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HookLevel {
    /// Everything except trace events.
    #[default]
    Summary,
    /// Every event.
    Trace,
}

impl HookLevel {
    pub fn admits(self, kind: EventKind) -> bool {
        self == HookLevel::Trace || !kind.is_trace()
    }
}

impl FromStr for HookLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(HookLevel::Summary),
            "trace" => Ok(HookLevel::Trace),
            _ => Err(format!("invalid hook level '{s}', expected 'summary' or 'trace'")),
        }
    }
}

impl fmt::Display for HookLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookLevel::Summary => write!(f, "summary"),
            HookLevel::Trace => write!(f, "trace"),
        }
    }
}

/// Anything that accepts lifecycle events.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: LifecycleEvent);
}

impl<S: EventSink + ?Sized> EventSink for Arc<S> {
    fn deliver(&self, event: LifecycleEvent) {
        (**self).deliver(event)
    }
}

type Handler = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

struct HandlerEntry {
    id: u64,
    /// `None` for wildcard handlers.
    kind: Option<EventKind>,
    handler: Handler,
}

type HandlerList = RwLock<Vec<HandlerEntry>>;

/// Handle returned by a subscription. Dropping it keeps the handler registered.
pub struct HookSubscription {
    id: u64,
    handlers: Weak<HandlerList>,
}

impl HookSubscription {
    /// Remove the handler. A no-op if the emitter is gone.
    pub fn unsubscribe(self) {
        if let Some(handlers) = self.handlers.upgrade() {
            let mut handlers = handlers.write().unwrap_or_else(|e| e.into_inner());
            handlers.retain(|entry| entry.id != self.id);
        }
    }
}

/// Lifecycle event emitter.
///
/// Handlers run synchronously in registration order. A panicking handler
/// is logged and skipped; it never reaches the emitting code. Forward
/// sinks receive every emitted event regardless of this emitter's level,
/// which lets a per-request bus feed the process-wide emitter.
pub struct HookEmitter {
    level: HookLevel,
    handlers: Arc<HandlerList>,
    next_id: AtomicU64,
    forwards: Vec<Arc<dyn EventSink>>,
}

impl HookEmitter {
    pub fn new(level: HookLevel) -> Self {
        Self {
            level,
            handlers: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            forwards: Vec::new(),
        }
    }

    /// Forward every emitted event to `sink` as well.
    pub fn with_forward(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.forwards.push(sink);
        self
    }

    pub fn level(&self) -> HookLevel {
        self.level
    }

    /// Subscribe to one event type.
    pub fn on<T, F>(&self, handler: F) -> HookSubscription
    where
        T: HookPayload,
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(
            Some(T::KIND),
            Arc::new(move |event: &LifecycleEvent| {
                if let Some(payload) = T::from_event(event) {
                    handler(payload);
                }
            }),
        )
    }

    /// Subscribe to every event. The event serializes with its `type` tag.
    pub fn on_any<F>(&self, handler: F) -> HookSubscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.register(None, Arc::new(handler))
    }

    fn register(&self, kind: Option<EventKind>, handler: Handler) -> HookSubscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(HandlerEntry { id, kind, handler });
        HookSubscription {
            id,
            handlers: Arc::downgrade(&self.handlers),
        }
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn emit(&self, event: impl Into<LifecycleEvent>) {
        let event = event.into();
        let kind = event.kind();

        for forward in &self.forwards {
            forward.deliver(event.clone());
        }

        if !self.level.admits(kind) {
            return;
        }

        // Clone matching handlers and drop the guard before running them, so
        // a handler may subscribe or unsubscribe without deadlocking.
        let matching: Vec<Handler> = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .iter()
                .filter(|entry| entry.kind.is_none_or(|k| k == kind))
                .map(|entry| Arc::clone(&entry.handler))
                .collect()
        };

        for handler in matching {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(event = %kind, "Lifecycle hook handler panicked (ignored)");
            }
        }
    }
}

impl Default for HookEmitter {
    fn default() -> Self {
        Self::new(HookLevel::default())
    }
}

impl EventSink for HookEmitter {
    fn deliver(&self, event: LifecycleEvent) {
        self.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::event::{AgentStart, EventScope, JobCancelled, ToolExecute};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    fn tool_execute() -> ToolExecute {
        ToolExecute {
            timestamp: Utc::now(),
            scope: EventScope::agent("a"),
            tool: "shell".to_string(),
            input: serde_json::Value::Null,
            output: None,
            duration_ms: 1,
        }
    }

    fn agent_start() -> AgentStart {
        AgentStart {
            timestamp: Utc::now(),
            scope: EventScope::agent("a"),
            input: "hello".to_string(),
            model: None,
        }
    }

    #[test]
    fn test_summary_level_drops_trace_events() {
        let emitter = HookEmitter::new(HookLevel::Summary);
        let typed = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&typed);
        let w = Arc::clone(&wildcard);
        emitter.on::<ToolExecute, _>(move |_| {
            t.fetch_add(1, Ordering::SeqCst);
        });
        emitter.on_any(move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(tool_execute());
        assert_eq!(typed.load(Ordering::SeqCst), 0);
        assert_eq!(wildcard.load(Ordering::SeqCst), 0);

        emitter.emit(agent_start());
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trace_level_delivers_trace_events() {
        let emitter = HookEmitter::new(HookLevel::Trace);
        let typed = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&typed);
        let w = Arc::clone(&wildcard);
        emitter.on::<ToolExecute, _>(move |e| {
            assert_eq!(e.tool, "shell");
            t.fetch_add(1, Ordering::SeqCst);
        });
        emitter.on_any(move |_| {
            w.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(tool_execute());
        assert_eq!(typed.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_typed_handler_ignores_other_events() {
        let emitter = HookEmitter::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        emitter.on::<JobCancelled, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(agent_start());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wildcard_sees_type_tag() {
        let emitter = HookEmitter::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        emitter.on_any(move |event| {
            let value = serde_json::to_value(event).unwrap();
            s.lock().unwrap().push(value["type"].as_str().unwrap().to_string());
        });
        emitter.emit(agent_start());
        assert_eq!(*seen.lock().unwrap(), vec!["agent:start".to_string()]);
    }

    #[test]
    fn test_panicking_handler_is_isolated() {
        let emitter = HookEmitter::default();
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);
        emitter.on_any(|_| panic!("broken observer"));
        emitter.on_any(move |_| {
            a.fetch_add(1, Ordering::SeqCst);
        });

        emitter.emit(agent_start());
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_removes_handler() {
        let emitter = HookEmitter::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let sub = emitter.on::<AgentStart, _>(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(agent_start());
        sub.unsubscribe();
        emitter.emit(agent_start());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.handler_count(), 0);
    }

    #[test]
    fn test_forward_receives_events_before_level_filter() {
        let global = Arc::new(HookEmitter::new(HookLevel::Trace));
        let forwarded = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&forwarded);
        global.on_any(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });

        let bus = HookEmitter::new(HookLevel::Summary).with_forward(global.clone());
        bus.emit(tool_execute());
        assert_eq!(forwarded.load(Ordering::SeqCst), 1);
    }
}
