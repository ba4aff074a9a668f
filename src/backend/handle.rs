//! Live handle to one in-flight task.
//!
//! A backend creates a `(ExecutionHandle, HandleSink)` pair with [`channel`],
//! returns the handle to the caller, and moves the sink into the spawned
//! execution. Events flow through a bounded mpsc channel; the terminal result
//! lives in a watch slot that is written at most once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};

use super::types::{ErrorClassification, ExecutionError, ExecutionResult, OutputEvent};

/// Buffered events per task before the producer waits on the consumer.
///
/// Until the event stream is taken nobody drains the buffer, so events past
/// this point are dropped instead of blocking the producer.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Shared {
    task_id: String,
    settled: watch::Sender<Option<ExecutionResult>>,
    cancelled: watch::Sender<Option<String>>,
    events_taken: AtomicBool,
}

impl Shared {
    /// Write the terminal result if nothing has been written yet.
    fn settle(&self, result: ExecutionResult) -> bool {
        let mut candidate = Some(result);
        self.settled.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = candidate.take();
            true
        })
    }

    fn is_settled(&self) -> bool {
        self.settled.borrow().is_some()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.borrow().is_some()
    }

    /// Record the cancel reason and settle `Cancelled`. False if already cancelled.
    fn cancel(&self, reason: &str) -> bool {
        let first = self.cancelled.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason.to_string());
            true
        });
        if first && self.settle(ExecutionResult::cancelled(&self.task_id, reason)) {
            tracing::debug!(task_id = %self.task_id, reason, "Task cancelled before settling");
        }
        first
    }
}

/// Create a connected handle/sink pair for a task.
pub fn channel(task_id: impl Into<String>) -> (ExecutionHandle, HandleSink) {
    let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let (settled, _) = watch::channel(None);
    let (cancelled, _) = watch::channel(None);
    let shared = Arc::new(Shared {
        task_id: task_id.into(),
        settled,
        cancelled,
        events_taken: AtomicBool::new(false),
    });

    let handle = ExecutionHandle {
        shared: Arc::clone(&shared),
        events: Mutex::new(Some(events_rx)),
    };
    let sink = HandleSink {
        shared,
        tx: events_tx,
    };
    (handle, sink)
}

/// Caller side of a running task.
pub struct ExecutionHandle {
    shared: Arc<Shared>,
    events: Mutex<Option<mpsc::Receiver<OutputEvent>>>,
}

impl std::fmt::Debug for ExecutionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionHandle")
            .field("task_id", &self.shared.task_id)
            .field("settled", &self.shared.is_settled())
            .field("cancelled", &self.shared.is_cancelled())
            .finish()
    }
}

impl ExecutionHandle {
    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    /// Take the event stream. Only the first call gets it.
    pub fn events(&self) -> Option<EventStream> {
        let rx = self.events.lock().ok()?.take()?;
        self.shared.events_taken.store(true, Ordering::Release);
        Some(EventStream {
            rx,
            cancel: self.shared.cancelled.subscribe(),
            done: false,
        })
    }

    /// Wait for the terminal result. Every caller sees the same value.
    pub async fn result(&self) -> ExecutionResult {
        let mut rx = self.shared.settled.subscribe();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(result) = current {
                return result;
            }
            if rx.changed().await.is_err() {
                // The sender lives in `shared`, which we hold.
                return ExecutionResult::failed(
                    self.task_id(),
                    ExecutionError::new("result channel closed", ErrorClassification::Transient),
                );
            }
        }
    }

    /// The settled result, if there is one yet.
    pub fn try_result(&self) -> Option<ExecutionResult> {
        self.shared.settled.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }

    /// Request cancellation. Idempotent; a result settled earlier wins.
    pub fn cancel(&self, reason: &str) {
        if !self.shared.cancel(reason) {
            return;
        }
        // Nobody will read events that were never taken.
        if let Ok(mut events) = self.events.lock() {
            events.take();
        }
    }
}

/// Cancels a task without holding its handle. Held by backends for `stop`.
#[derive(Clone)]
pub struct Canceller {
    shared: Arc<Shared>,
}

impl Canceller {
    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    pub fn is_settled(&self) -> bool {
        self.shared.is_settled()
    }

    /// Same semantics as [`ExecutionHandle::cancel`].
    pub fn cancel(&self, reason: &str) -> bool {
        self.shared.cancel(reason)
    }
}

/// Producer side of a running task, owned by the backend's execution.
pub struct HandleSink {
    shared: Arc<Shared>,
    tx: mpsc::Sender<OutputEvent>,
}

impl HandleSink {
    pub fn task_id(&self) -> &str {
        &self.shared.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled() || self.tx.is_closed()
    }

    pub fn canceller(&self) -> Canceller {
        Canceller {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Resolves once the task is cancelled or the consumer went away.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.cancelled.subscribe();
        tokio::select! {
            _ = rx.wait_for(Option::is_some) => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Push an event. Returns false once nobody is listening any more.
    pub async fn emit(&self, event: OutputEvent) -> bool {
        if self.is_cancelled() || self.shared.is_settled() {
            return false;
        }
        if !self.shared.events_taken.load(Ordering::Acquire) {
            return self.offer(event);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    /// Settle the task and emit the terminal `Complete` event.
    ///
    /// Returns false when something else (usually a cancel) settled first.
    pub async fn finish(self, result: ExecutionResult) -> bool {
        if !self.shared.settle(result.clone()) {
            return false;
        }
        if self.shared.is_cancelled() {
            return true;
        }
        let complete = OutputEvent::Complete { result };
        if self.shared.events_taken.load(Ordering::Acquire) {
            tokio::select! {
                biased;
                _ = self.cancelled() => {}
                _ = self.tx.send(complete) => {}
            }
        } else {
            self.offer(complete);
        }
        true
    }

    /// Buffer without waiting. A full buffer drops the event.
    fn offer(&self, event: OutputEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::trace!(
                    task_id = %self.shared.task_id,
                    event_type = event.event_type(),
                    "Event buffer full and unread, dropping event"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

impl Drop for HandleSink {
    fn drop(&mut self) {
        // A producer that vanished without finishing must not strand the caller.
        let orphaned = ExecutionResult::failed(
            self.shared.task_id.clone(),
            ExecutionError::new(
                "Execution ended without producing a result",
                ErrorClassification::Transient,
            ),
        );
        if self.shared.settle(orphaned) {
            tracing::warn!(task_id = %self.shared.task_id, "Execution sink dropped unsettled");
        }
    }
}

/// Ordered, single-consumption stream of a task's events.
pub struct EventStream {
    rx: mpsc::Receiver<OutputEvent>,
    cancel: watch::Receiver<Option<String>>,
    done: bool,
}

impl EventStream {
    /// Next event, or `None` once the task completed or was cancelled.
    pub async fn next(&mut self) -> Option<OutputEvent> {
        if self.done {
            return None;
        }
        if self.cancel.borrow().is_some() {
            self.close();
            return None;
        }

        let mut cancel = self.cancel.clone();
        tokio::select! {
            biased;
            _ = cancel.wait_for(Option::is_some) => {
                self.close();
                None
            }
            event = self.rx.recv() => match event {
                Some(event) => {
                    if event.is_complete() {
                        self.close();
                    }
                    Some(event)
                }
                None => {
                    self.done = true;
                    None
                }
            },
        }
    }

    /// Like `next`, bounded by a deadline. `Err(())` on timeout.
    pub async fn next_within(&mut self, limit: Duration) -> Result<Option<OutputEvent>, ()> {
        tokio::time::timeout(limit, self.next()).await.map_err(|_| ())
    }

    /// Drain every remaining event.
    pub async fn collect_all(mut self) -> Vec<OutputEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    pub fn into_stream(self) -> impl Stream<Item = OutputEvent> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            stream.next().await.map(|event| (event, stream))
        })
    }

    fn close(&mut self) {
        self.done = true;
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::types::ExecutionStatus;
    use futures::StreamExt;

    #[tokio::test]
    async fn result_settles_once_and_is_shared() {
        let (handle, sink) = channel("t1");
        assert!(sink.emit(OutputEvent::text("hi")).await);
        assert!(sink.finish(ExecutionResult::completed("t1", "done")).await);

        let first = handle.result().await;
        let second = handle.result().await;
        assert_eq!(first, second);
        assert_eq!(first.summary, "done");
    }

    #[tokio::test]
    async fn events_end_with_exactly_one_complete() {
        let (handle, sink) = channel("t1");
        tokio::spawn(async move {
            sink.emit(OutputEvent::text("a")).await;
            sink.emit(OutputEvent::text("b")).await;
            sink.finish(ExecutionResult::completed("t1", "ok")).await;
        });

        let events = handle.events().unwrap().collect_all().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], OutputEvent::text("a"));
        assert_eq!(events[1], OutputEvent::text("b"));
        assert!(events[2].is_complete());
        assert_eq!(events.iter().filter(|e| e.is_complete()).count(), 1);
    }

    #[tokio::test]
    async fn events_are_single_consumption() {
        let (handle, _sink) = channel("t1");
        assert!(handle.events().is_some());
        assert!(handle.events().is_none());
    }

    #[tokio::test]
    async fn cancel_settles_cancelled_and_ends_stream() {
        let (handle, sink) = channel("t1");
        let mut events = handle.events().unwrap();

        handle.cancel("user");
        handle.cancel("again");

        assert!(events.next().await.is_none());
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.summary.contains("user"));

        // The producer observes cancellation and cannot overwrite the result.
        assert!(sink.is_cancelled());
        assert!(!sink.emit(OutputEvent::text("late")).await);
        assert!(!sink.finish(ExecutionResult::completed("t1", "late")).await);
        assert_eq!(handle.result().await.status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn late_cancel_does_not_change_settled_result() {
        let (handle, sink) = channel("t1");
        sink.finish(ExecutionResult::completed("t1", "finished")).await;

        handle.cancel("too late");
        assert_eq!(handle.result().await.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn dropped_sink_settles_failed() {
        let (handle, sink) = channel("t1");
        drop(sink);
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.classification(), Some(ErrorClassification::Transient));
    }

    #[tokio::test]
    async fn producer_wakes_when_cancelled() {
        let (handle, sink) = channel("t1");
        let waiter = tokio::spawn(async move {
            sink.cancelled().await;
            true
        });
        handle.cancel("stop");
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn result_settles_when_events_are_never_taken() {
        let (handle, sink) = channel("t1");
        let producer = tokio::spawn(async move {
            for i in 0..EVENT_CHANNEL_CAPACITY + 44 {
                assert!(sink.emit(OutputEvent::text(i.to_string())).await);
            }
            sink.finish(ExecutionResult::completed("t1", "done")).await
        });

        let result = tokio::time::timeout(Duration::from_secs(2), handle.result())
            .await
            .expect("result must settle without an event consumer");
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(producer.await.unwrap());

        // A late reader sees the buffered prefix, then the stream ends.
        let events = handle.events().unwrap().collect_all().await;
        assert_eq!(events.len(), EVENT_CHANNEL_CAPACITY);
        assert_eq!(events[0], OutputEvent::text("0"));
    }

    #[tokio::test]
    async fn taken_stream_applies_backpressure() {
        let (handle, sink) = channel("t1");
        let mut events = handle.events().unwrap();
        for i in 0..EVENT_CHANNEL_CAPACITY {
            assert!(sink.emit(OutputEvent::text(i.to_string())).await);
        }
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            sink.emit(OutputEvent::text("overflow")),
        )
        .await;
        assert!(blocked.is_err());
        assert_eq!(events.next().await, Some(OutputEvent::text("0")));
    }

    #[tokio::test]
    async fn canceller_settles_and_wakes_producer() {
        let (handle, sink) = channel("t1");
        let canceller = sink.canceller();
        let mut events = handle.events().unwrap();
        let waiter = tokio::spawn(async move { sink.cancelled().await });

        assert!(canceller.cancel("backend stopped"));
        assert!(!canceller.cancel("again"));
        waiter.await.unwrap();

        assert!(canceller.is_settled());
        assert!(events.next().await.is_none());
        let result = handle.result().await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.summary.contains("backend stopped"));
    }

    #[tokio::test]
    async fn into_stream_yields_in_order() {
        let (handle, sink) = channel("t1");
        tokio::spawn(async move {
            for i in 0..5 {
                sink.emit(OutputEvent::text(i.to_string())).await;
            }
            sink.finish(ExecutionResult::completed("t1", "ok")).await;
        });

        let texts: Vec<String> = handle
            .events()
            .unwrap()
            .into_stream()
            .filter_map(|e| async move {
                match e {
                    OutputEvent::Text { text } => Some(text),
                    _ => None,
                }
            })
            .collect()
            .await;
        assert_eq!(texts, vec!["0", "1", "2", "3", "4"]);
    }
}
