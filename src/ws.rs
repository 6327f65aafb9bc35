//! WebSocket session loop: one task per accepted connection.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{future, SinkExt, StreamExt};
use tracing::{debug, info};

use crate::{
    connection::{Connection, FrameSink, SendError},
    dispatch::{dispatch, Session},
    message::RelayMessage,
    registry::SubscriptionRegistry,
    relay::Relay,
};

/// Releases a connection's listeners however the session ends, including
/// unwinding.
struct Teardown {
    registry: Arc<SubscriptionRegistry>,
    conn: Arc<Connection>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.conn.close();
        let removed = self.registry.unregister_all(self.conn.id());
        info!(
            conn = self.conn.id(),
            removed,
            open = self.registry.connection_count(),
            "connection closed"
        );
    }
}

/// Drive one upgraded socket until the peer leaves or a write fails.
pub async fn run_session(relay: Arc<Relay>, socket: WebSocket) {
    let id = relay.next_conn_id();
    let (sink, mut stream) = socket.split();
    let sink: FrameSink = Box::pin(
        sink.with(|text: String| future::ready(Ok::<_, axum::Error>(Message::Text(text))))
            .sink_map_err(|e| SendError::Transport(e.to_string())),
    );
    let conn = Arc::new(Connection::new(id, sink, relay.options().write_timeout));
    let _teardown = Teardown {
        registry: Arc::clone(relay.registry()),
        conn: Arc::clone(&conn),
    };
    let mut session = Session::new(Arc::clone(&conn));
    info!(conn = id, "connection opened");

    let challenge = RelayMessage::Auth(session.challenge.clone());
    if let Err(e) = conn.send_message(&challenge).await {
        debug!(conn = id, error = %e, "could not send challenge");
        return;
    }

    loop {
        let frame = tokio::select! {
            _ = conn.closed() => break,
            frame = stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = dispatch(&relay, &mut session, &text).await {
                    debug!(conn = id, error = %e, "write failed");
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                let notice = RelayMessage::Notice("binary frames are not supported".into());
                if conn.send_message(&notice).await.is_err() {
                    break;
                }
            }
            Some(Ok(Message::Close(_))) | None => break,
            // ping/pong are answered by the transport
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(conn = id, error = %e, "read failed");
                break;
            }
        }
    }
}
