//! Error channel: failure notices for observers that are not the caller.
//!
//! Conversions run in background tasks. The caller gets its `Result`, but a
//! UI banner or a log sink that never awaited the task would otherwise never
//! hear about the failure. Every process or postcondition failure is
//! therefore also published here, to any number of subscribers.
//!
//! Backed by a `tokio::sync::broadcast` channel: publishing never blocks and
//! never fails, a subscriber that falls behind loses the oldest notices.

use crate::error::{ConvertError, ErrorKind};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, warn};

/// One failure, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNotice {
    pub kind: ErrorKind,
    /// Source file of the failed conversion.
    pub source: PathBuf,
    /// Human-readable description, including the converter's diagnostic.
    pub message: String,
}

impl FailureNotice {
    pub fn from_error(source: impl Into<PathBuf>, err: &ConvertError) -> Self {
        Self {
            kind: err.kind(),
            source: source.into(),
            message: err.to_string(),
        }
    }
}

/// Cloneable publisher handle. All clones feed the same subscribers.
#[derive(Debug, Clone)]
pub struct ErrorChannel {
    tx: broadcast::Sender<FailureNotice>,
}

impl ErrorChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish a notice. Fire-and-forget: with no subscribers it is dropped.
    pub fn announce(&self, notice: FailureNotice) {
        match self.tx.send(notice) {
            Ok(n) => debug!(subscribers = n, "Failure announced"),
            Err(broadcast::error::SendError(notice)) => {
                debug!(source = %notice.source.display(), "Failure announced with no subscribers")
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FailureNotice> {
        self.tx.subscribe()
    }

    /// Subscribe as a stream. Notices lost to lag are skipped with a warning.
    pub fn stream(&self) -> impl Stream<Item = FailureNotice> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(notice) => Some(notice),
                Err(e) => {
                    warn!(error = %e, "Error channel subscriber lagged");
                    None
                }
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Spawn a subscriber that writes every notice to the log.
    ///
    /// The task ends once every [`ErrorChannel`] clone has been dropped.
    pub fn spawn_log_sink(&self) -> JoinHandle<()> {
        let stream = self.stream();
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(notice) = stream.next().await {
                error!(
                    kind = %notice.kind,
                    source = %notice.source.display(),
                    "{}",
                    notice.message
                );
            }
        })
    }
}

impl Default for ErrorChannel {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notice(name: &str) -> FailureNotice {
        FailureNotice::from_error(
            name,
            &ConvertError::Process {
                exit_code: Some(1),
                diagnostic: "bad header".into(),
            },
        )
    }

    #[tokio::test]
    async fn every_subscriber_receives_each_notice() {
        let channel = ErrorChannel::new(8);
        let mut a = channel.subscribe();
        let mut b = channel.subscribe();
        assert_eq!(channel.subscriber_count(), 2);

        channel.announce(notice("photo.ddx"));

        let got_a = a.recv().await.unwrap();
        let got_b = b.recv().await.unwrap();
        assert_eq!(got_a, got_b);
        assert_eq!(got_a.kind, ErrorKind::Process);
        assert!(got_a.message.contains("bad header"));
    }

    #[test]
    fn announce_without_subscribers_is_harmless() {
        let channel = ErrorChannel::default();
        channel.announce(notice("photo.ddx"));
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn stream_skips_lagged_notices() {
        let channel = ErrorChannel::new(2);
        let stream = channel.stream();
        for i in 0..5 {
            channel.announce(notice(&format!("{i}.ddx")));
        }
        drop(channel);

        let received: Vec<_> = stream.collect().await;
        assert_eq!(received.len(), 2);
        assert_eq!(received[1].source, PathBuf::from("4.ddx"));
    }

    #[tokio::test]
    async fn log_sink_ends_with_channel() {
        let channel = ErrorChannel::new(4);
        let sink = channel.spawn_log_sink();
        channel.announce(notice("photo.ddx"));
        drop(channel);
        sink.await.unwrap();
    }
}
