//! Push-style progress: a session's snapshots as a `Stream`.
//!
//! Wraps the session's watch channel. The stream yields the current state
//! first, then every later state a poller would observe, and ends after the
//! first terminal snapshot (or when the session is evicted). Intermediate
//! states published faster than the consumer reads are coalesced; the last
//! one always arrives.
//!
//! A transport layer (server-sent events, websocket, CLI bar) consumes this
//! directly; see [`sse_event`] for the event-stream framing.

use crate::progress::{ProgressStore, SessionId, SessionSnapshot};
use futures::stream::{self, StreamExt};
use std::pin::Pin;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::Stream;

/// A boxed stream of session snapshots.
pub type ProgressStream = Pin<Box<dyn Stream<Item = SessionSnapshot> + Send>>;

/// Stream `session` until it reaches a terminal state. `None` if the session
/// does not exist.
pub fn progress_stream(store: &ProgressStore, session: SessionId) -> Option<ProgressStream> {
    let rx = store.subscribe(session)?;
    // The store never sends after a terminal state, so stop before polling
    // the channel again rather than waiting on it.
    let stream = stream::unfold((WatchStream::new(rx), false), |(mut rx, finished)| async move {
        if finished {
            return None;
        }
        let snapshot = rx.next().await?;
        let finished = snapshot.status.is_terminal();
        Some((snapshot, (rx, finished)))
    });
    Some(Box::pin(stream))
}

/// Frame a snapshot as one server-sent event (`data: {json}\n\n`).
pub fn sse_event(snapshot: &SessionSnapshot) -> String {
    let payload = serde_json::json!({
        "session": snapshot.session,
        "status": snapshot.status,
        "progress": snapshot.progress(),
        "message": snapshot.message,
        "error": snapshot.error,
        "filename": snapshot.result.as_ref().map(|r| r.filename.clone()),
    });
    format!("data: {payload}\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{JobStage, JobStatus};
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test]
    async fn stream_ends_after_terminal_state() {
        let store = ProgressStore::new();
        let id = store.create();
        let mut stream = progress_stream(&store, id).unwrap();

        let first = stream.next().await.unwrap();
        assert_eq!(first.status, JobStatus::Pending);

        store.advance(id, JobStage::ReadingSource, 5, "OCR");
        let second = stream.next().await.unwrap();
        assert_eq!(second.percent, 5);

        store.fail(id, "no content");
        let last = stream.next().await.unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn finished_session_yields_once_then_ends() {
        let store = ProgressStore::new();
        let id = store.create();
        store.fail(id, "source unreadable");
        let stream = progress_stream(&store, id).unwrap();

        // The store keeps its sender, so a stream that waited for another
        // change would never end.
        let items: Vec<SessionSnapshot> =
            tokio::time::timeout(std::time::Duration::from_secs(5), stream.collect())
                .await
                .expect("stream ends after the terminal snapshot");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status, JobStatus::Failed);
    }

    #[test]
    fn stream_waits_for_changes_and_ends_without_waiting() {
        let store = ProgressStore::new();
        let id = store.create();
        let mut stream = tokio_test::task::spawn(progress_stream(&store, id).unwrap());

        assert!(assert_ready!(stream.poll_next()).is_some());
        assert_pending!(stream.poll_next());

        store.fail(id, "boom");
        assert!(stream.is_woken());
        let last = assert_ready!(stream.poll_next()).unwrap();
        assert_eq!(last.status, JobStatus::Failed);
        assert!(assert_ready!(stream.poll_next()).is_none());
    }

    #[tokio::test]
    async fn eviction_ends_stream() {
        let store = ProgressStore::new();
        let id = store.create();
        let mut stream = progress_stream(&store, id).unwrap();
        let _ = stream.next().await;
        store.evict(id);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn unknown_session_has_no_stream() {
        let store = ProgressStore::new();
        assert!(progress_stream(&store, SessionId::new()).is_none());
    }

    #[test]
    fn sse_frame_reports_failure_sentinel() {
        let store = ProgressStore::new();
        let id = store.create();
        store.fail(id, "boom");
        let frame = sse_event(&store.snapshot(id).unwrap());
        assert!(frame.starts_with("data: "));
        assert!(frame.contains("\"progress\":-1"));
        assert!(frame.ends_with("\n\n"));
    }
}
