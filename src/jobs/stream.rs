//! Reconnectable job event streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::jobs::Job;
use crate::jobs::buffer::{BufferedEvent, EventBuffer, Listener, ListenerHandle};

/// What a client gets when it asks to stream a job.
pub enum JobStream {
    /// Buffered events so far, then live events until the terminal one.
    Live(EventStream),
    /// The job finished and its buffer is gone; here is the record instead.
    Snapshot(Job),
}

/// Replay followed by live events for one job.
///
/// Ends after yielding a terminal event (`done`, `error` or `cancelled`).
/// The buffer listener is detached when the stream is dropped, so a client
/// disconnect needs no explicit cleanup.
pub struct EventStream {
    job_id: Uuid,
    replay: VecDeque<BufferedEvent>,
    rx: mpsc::UnboundedReceiver<BufferedEvent>,
    handle: Option<ListenerHandle>,
    /// Cancelled if the stream is dropped before its terminal event.
    cancel_on_drop: Option<CancellationToken>,
    finished: bool,
}

impl EventStream {
    /// Replay `job_id`'s log and follow it.
    pub fn attach(buffer: &EventBuffer, job_id: Uuid) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener: Listener = Arc::new(move |event: &BufferedEvent| {
            // The receiver may already be gone; nothing to do then.
            let _ = tx.send(event.clone());
        });
        let (replay, handle) = buffer.replay_and_listen(job_id, listener);
        Self {
            job_id,
            replay: replay.into(),
            rx,
            handle: Some(handle),
            cancel_on_drop: None,
            finished: false,
        }
    }

    /// Cancel `token` if the client goes away before the stream ends.
    pub fn cancel_on_drop(mut self, token: CancellationToken) -> Self {
        self.cancel_on_drop = Some(token);
        self
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    fn finish(&mut self) {
        self.finished = true;
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
        }
    }
}

impl Stream for EventStream {
    type Item = BufferedEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        let next = match this.replay.pop_front() {
            Some(event) => Some(event),
            None => match this.rx.poll_recv(cx) {
                Poll::Ready(event) => event,
                Poll::Pending => return Poll::Pending,
            },
        };

        match next {
            Some(event) => {
                if event.is_terminal() {
                    this.finish();
                }
                Poll::Ready(Some(event))
            }
            None => {
                this.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.unsubscribe();
        }
        if !self.finished
            && let Some(token) = &self.cancel_on_drop
        {
            token.cancel();
        }
    }
}
