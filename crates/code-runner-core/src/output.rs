//! Ordered output buffer with live broadcast to subscribers.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Capacity of the live update channel. Slow subscribers lag, the history does not.
const LIVE_CAPACITY: usize = 1024;

/// Stream a fragment arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentKind {
    Stdout,
    Error,
}

/// One chunk of output, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub kind: FragmentKind,
    pub text: String,
}

impl Fragment {
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Stdout,
            text: text.into(),
        }
    }

    #[must_use]
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: FragmentKind::Error,
            text: text.into(),
        }
    }
}

/// Change published to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputUpdate {
    Appended(Fragment),
    Cleared,
}

#[derive(Default)]
struct Inner {
    fragments: Vec<Fragment>,
    total_bytes: usize,
}

/// Output aggregator for a session.
///
/// Appends are never deduplicated or truncated; the full output of a run is
/// kept until [`OutputBuffer::clear`]. Reads always observe every append made
/// before them.
pub struct OutputBuffer {
    inner: RwLock<Inner>,
    sender: broadcast::Sender<OutputUpdate>,
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputBuffer {
    /// Create an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LIVE_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a fragment to the end of the buffer.
    pub fn append(&self, fragment: Fragment) {
        // Publish under the write lock so history and live updates never overlap.
        let mut inner = self.write();
        inner.total_bytes = inner.total_bytes.saturating_add(fragment.text.len());
        inner.fragments.push(fragment.clone());
        let _ = self.sender.send(OutputUpdate::Appended(fragment));
    }

    /// Append stdout text.
    pub fn push_stdout<S: Into<String>>(&self, s: S) {
        self.append(Fragment::stdout(s));
    }

    /// Append error text.
    pub fn push_error<S: Into<String>>(&self, s: S) {
        self.append(Fragment::error(s));
    }

    /// Drop every fragment.
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.fragments.clear();
        inner.total_bytes = 0;
        let _ = self.sender.send(OutputUpdate::Cleared);
    }

    /// Concatenation of every fragment, for display.
    #[must_use]
    pub fn snapshot(&self) -> String {
        let inner = self.read();
        let mut out = String::with_capacity(inner.total_bytes);
        for fragment in &inner.fragments {
            out.push_str(&fragment.text);
        }
        out
    }

    /// Concatenation of stdout fragments only.
    #[must_use]
    pub fn stdout(&self) -> String {
        self.read()
            .fragments
            .iter()
            .filter(|f| f.kind == FragmentKind::Stdout)
            .map(|f| f.text.as_str())
            .collect()
    }

    /// Copy of the fragments in arrival order.
    #[must_use]
    pub fn fragments(&self) -> Vec<Fragment> {
        self.read().fragments.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().fragments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().fragments.is_empty()
    }

    /// Total text size in bytes.
    #[must_use]
    pub fn total_bytes(&self) -> usize {
        self.read().total_bytes
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputUpdate> {
        self.sender.subscribe()
    }

    /// Stream that yields the current fragments first, then live updates.
    ///
    /// Updates a lagging subscriber missed are skipped.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, OutputUpdate> {
        // Writers publish under the write lock, so holding the read lock here
        // puts every append either in the history or in the live stream.
        let (history, rx) = {
            let inner = self.read();
            (inner.fragments.clone(), self.sender.subscribe())
        };

        let hist = futures::stream::iter(history.into_iter().map(OutputUpdate::Appended));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        hist.chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_snapshot_preserves_arrival_order() {
        let buffer = OutputBuffer::new();
        buffer.push_stdout("a");
        buffer.push_error("b");
        buffer.push_stdout("c");

        assert_eq!(buffer.snapshot(), "abc");
        assert_eq!(buffer.stdout(), "ac");
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total_bytes(), 3);
    }

    #[test]
    fn test_no_dedup() {
        let buffer = OutputBuffer::new();
        buffer.push_stdout("x");
        buffer.push_stdout("x");
        assert_eq!(buffer.snapshot(), "xx");
    }

    #[test]
    fn test_clear_resets() {
        let buffer = OutputBuffer::new();
        buffer.push_stdout("hello");
        buffer.clear();

        assert!(buffer.is_empty());
        assert_eq!(buffer.snapshot(), "");
        assert_eq!(buffer.total_bytes(), 0);
    }

    #[test]
    fn test_live_updates() {
        let buffer = OutputBuffer::new();
        let mut rx = buffer.subscribe();

        buffer.push_stdout("1");
        buffer.clear();

        assert_eq!(
            rx.try_recv().unwrap(),
            OutputUpdate::Appended(Fragment::stdout("1"))
        );
        assert_eq!(rx.try_recv().unwrap(), OutputUpdate::Cleared);
    }

    #[test]
    fn test_history_plus_stream_under_concurrent_appends() {
        for _ in 0..200 {
            let buffer = Arc::new(OutputBuffer::new());
            let writer = {
                let buffer = Arc::clone(&buffer);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        buffer.push_stdout(i.to_string());
                    }
                })
            };

            let stream = buffer.history_plus_stream();
            writer.join().unwrap();
            // Dropping the last handle closes the live side of the stream.
            drop(buffer);

            let seen: Vec<OutputUpdate> = futures::executor::block_on(stream.collect());
            let expected: Vec<OutputUpdate> = (0..50)
                .map(|i| OutputUpdate::Appended(Fragment::stdout(i.to_string())))
                .collect();
            assert_eq!(seen, expected);
        }
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let buffer = OutputBuffer::new();
        buffer.push_stdout("before");

        let mut stream = buffer.history_plus_stream();
        buffer.push_error("after");

        assert_eq!(
            stream.next().await,
            Some(OutputUpdate::Appended(Fragment::stdout("before")))
        );
        assert_eq!(
            stream.next().await,
            Some(OutputUpdate::Appended(Fragment::error("after")))
        );

        let mut next = tokio_test::task::spawn(stream.next());
        tokio_test::assert_pending!(next.poll());
    }
}
