//! Notification sources
//!
//! - [`ChannelNotificationSource`]: in-process source fed through an mpsc sender
//! - [`JsonLinesNotificationSource`]: one JSON notification per line from a file or FIFO

use crate::{NotificationSource, TransportError, TransportResult};
use async_trait::async_trait;
use edgetunnel_proto::{notify_topic, TunnelNotification};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

/// Capacity of the channel between a source's reader and the subscriber
const NOTIFICATION_BUFFER: usize = 32;

/// Notification source backed by an in-process channel
///
/// Whoever holds the sender returned by [`ChannelNotificationSource::new`]
/// can push notifications. Only one subscription is possible.
#[derive(Debug)]
pub struct ChannelNotificationSource {
    receiver: Mutex<Option<mpsc::Receiver<TunnelNotification>>>,
}

impl ChannelNotificationSource {
    /// Create a new source and the sender feeding it
    pub fn new() -> (Self, mpsc::Sender<TunnelNotification>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        (
            Self {
                receiver: Mutex::new(Some(rx)),
            },
            tx,
        )
    }
}

#[async_trait]
impl NotificationSource for ChannelNotificationSource {
    async fn subscribe(
        &self,
        thing_name: &str,
    ) -> TransportResult<mpsc::Receiver<TunnelNotification>> {
        let receiver = self.receiver.lock().await.take().ok_or_else(|| {
            TransportError::SubscriptionFailed("channel source already subscribed".to_string())
        })?;

        tracing::info!(topic = %notify_topic(thing_name), "Subscribed to tunnel notifications");
        Ok(receiver)
    }
}

/// Notification source reading JSON documents, one per line
///
/// Works with regular files and named pipes. Lines that do not parse are
/// logged and skipped, end of file closes the subscription.
#[derive(Debug, Clone)]
pub struct JsonLinesNotificationSource {
    path: PathBuf,
}

impl JsonLinesNotificationSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl NotificationSource for JsonLinesNotificationSource {
    async fn subscribe(
        &self,
        thing_name: &str,
    ) -> TransportResult<mpsc::Receiver<TunnelNotification>> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            TransportError::SubscriptionFailed(format!(
                "failed to open {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let path = self.path.clone();
        let topic = notify_topic(thing_name);

        tracing::info!(topic = %topic, path = %path.display(), "Subscribed to tunnel notifications");

        tokio::spawn(async move {
            let mut lines = BufReader::new(file).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match TunnelNotification::from_json(line) {
                            Ok(notification) => {
                                if tx.send(notification).await.is_err() {
                                    tracing::debug!(topic = %topic, "Subscriber dropped, stopping reader");
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(topic = %topic, error = %e, "Skipping malformed notification");
                            }
                        }
                    }
                    Ok(None) => {
                        tracing::info!(topic = %topic, "Notification source reached end of input");
                        break;
                    }
                    Err(e) => {
                        tracing::error!(topic = %topic, error = %e, "Error reading notifications");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_channel_source_delivers_in_order() {
        let (source, tx) = ChannelNotificationSource::new();
        let mut rx = source.subscribe("thing").await.unwrap();

        for region in ["us-east-1", "eu-west-1"] {
            tx.send(TunnelNotification {
                region: Some(region.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        }

        assert_eq!(rx.recv().await.unwrap().region(), Some("us-east-1"));
        assert_eq!(rx.recv().await.unwrap().region(), Some("eu-west-1"));
    }

    #[tokio::test]
    async fn test_channel_source_single_subscription() {
        let (source, _tx) = ChannelNotificationSource::new();
        assert!(source.subscribe("thing").await.is_ok());

        let err = source.subscribe("thing").await.unwrap_err();
        assert!(matches!(err, TransportError::SubscriptionFailed(_)));
    }

    #[tokio::test]
    async fn test_json_lines_source_skips_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"clientMode":"destination","services":["SSH"],"clientAccessToken":"a","region":"us-east-1"}}"#
        )
        .unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"clientMode":"destination","services":["GW"],"clientAccessToken":"b","region":"us-east-1"}}"#
        )
        .unwrap();
        file.flush().unwrap();

        let source = JsonLinesNotificationSource::new(file.path());
        let mut rx = source.subscribe("thing").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().access_token(), Some("a"));
        assert_eq!(rx.recv().await.unwrap().access_token(), Some("b"));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_json_lines_source_missing_file() {
        let source = JsonLinesNotificationSource::new("/nonexistent/notifications.jsonl");
        let err = source.subscribe("thing").await.unwrap_err();
        assert!(matches!(err, TransportError::SubscriptionFailed(_)));
    }
}
