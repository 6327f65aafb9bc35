//! Per-connection write handle shared by the session and the event router.

use std::{pin::Pin, time::Duration};

use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::debug;

use crate::message::RelayMessage;

/// Relay-assigned identity of one accepted connection.
pub type ConnId = u64;

/// Outgoing frame sink of a connection, already erased to text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = SendError> + Send>>;

/// A frame could not be written; always fatal for the connection.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Serialized writer for one physical connection.
///
/// Both the connection's own dispatcher and routers running on other
/// connections' tasks write through [`Connection::send`]; the mutex keeps
/// frames from interleaving. Any failed write marks the connection closed,
/// which wakes its session loop so it can tear down.
pub struct Connection {
    id: ConnId,
    sink: Mutex<FrameSink>,
    write_timeout: Duration,
    closed: CancellationToken,
}

impl Connection {
    pub fn new(id: ConnId, sink: FrameSink, write_timeout: Duration) -> Self {
        Self {
            id,
            sink: Mutex::new(sink),
            write_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Write one text frame.
    pub async fn send(&self, frame: String) -> Result<(), SendError> {
        if self.closed.is_cancelled() {
            return Err(SendError::Closed);
        }
        let mut sink = self.sink.lock().await;
        let result = match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(self.write_timeout)),
        };
        if let Err(e) = &result {
            debug!(conn = self.id, error = %e, "write failed, closing connection");
            self.close();
        }
        result
    }

    pub async fn send_message(&self, msg: &RelayMessage) -> Result<(), SendError> {
        self.send(msg.to_json()).await
    }

    /// Mark the connection closed. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the connection has been marked closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{channel_connection, stalled_connection};
    use futures::StreamExt;
    use std::sync::Arc;

    #[tokio::test]
    async fn writes_frames_in_order() {
        let (conn, mut rx) = channel_connection(1);
        conn.send("a".into()).await.unwrap();
        conn.send_message(&RelayMessage::Notice("b".into()))
            .await
            .unwrap();
        assert_eq!(rx.next().await.unwrap(), "a");
        assert_eq!(rx.next().await.unwrap(), r#"["NOTICE","b"]"#);
    }

    #[tokio::test]
    async fn concurrent_writers_never_interleave() {
        let (conn, rx) = channel_connection(1);
        let conn = Arc::new(conn);
        let mut tasks = vec![];
        for i in 0..8 {
            let conn = Arc::clone(&conn);
            tasks.push(tokio::spawn(async move {
                for j in 0..25 {
                    conn.send(format!("{i}-{j}")).await.unwrap();
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        drop(conn);
        let frames: Vec<String> = rx.collect().await;
        assert_eq!(frames.len(), 200);
        for i in 0..8 {
            let own: Vec<_> = frames
                .iter()
                .filter(|f| f.starts_with(&format!("{i}-")))
                .cloned()
                .collect();
            let expected: Vec<_> = (0..25).map(|j| format!("{i}-{j}")).collect();
            assert_eq!(own, expected);
        }
    }

    #[tokio::test]
    async fn failed_write_closes_connection() {
        let (conn, rx) = channel_connection(1);
        drop(rx);
        assert!(matches!(
            conn.send("x".into()).await,
            Err(SendError::Transport(_))
        ));
        assert!(conn.is_closed());
        assert!(matches!(conn.send("y".into()).await, Err(SendError::Closed)));
        conn.closed().await;
    }

    #[tokio::test]
    async fn slow_peer_times_out() {
        let conn = stalled_connection(2, Duration::from_millis(50));
        assert!(matches!(
            conn.send("x".into()).await,
            Err(SendError::Timeout(_))
        ));
        assert!(conn.is_closed());
    }
}
