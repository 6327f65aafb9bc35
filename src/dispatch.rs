//! Routes classified client frames to the EVENT, REQ, CLOSE, AUTH and COUNT
//! flows.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    auth::{new_challenge, unix_now},
    connection::{Connection, SendError},
    event::Event,
    filter::Filter,
    handlers::{Exchange, FILTER_HANDLER},
    message::{ClientMessage, ParseError, RelayMessage},
    relay::Relay,
    router,
};

const CLOSE_OK: &str = "Subscription closed successfully.";
const CLOSE_MISSING: &str = "Error: Subscription ID not found or could not be closed.";

/// Per-connection protocol state.
pub struct Session {
    pub conn: Arc<Connection>,
    pub challenge: String,
    /// Set once by a successful AUTH and never cleared.
    pub pubkey: Option<String>,
}

impl Session {
    pub fn new(conn: Arc<Connection>) -> Self {
        Self {
            conn,
            challenge: new_challenge(),
            pubkey: None,
        }
    }
}

/// Handle one inbound text frame to completion.
///
/// Only a failed write is returned; protocol problems are answered on the
/// wire and leave the connection open.
pub async fn dispatch(relay: &Relay, session: &mut Session, text: &str) -> Result<(), SendError> {
    let msg = match ClientMessage::parse(text) {
        Ok(msg) => msg,
        Err(e) => return reply_parse_error(session, e).await,
    };
    match msg {
        ClientMessage::Event(ev) => on_event(relay, session, *ev).await,
        ClientMessage::Req {
            subscription_id,
            filters,
        } => on_req(relay, session, subscription_id, filters).await,
        ClientMessage::Close(subscription_id) => on_close(relay, session, subscription_id).await,
        ClientMessage::Auth(ev) => on_auth(relay, session, *ev).await,
        ClientMessage::Count {
            subscription_id,
            filters,
        } => on_count(relay, session, subscription_id, filters).await,
        ClientMessage::Unknown(tag) => {
            debug!(conn = session.conn.id(), tag, "ignoring unknown message");
            Ok(())
        }
    }
}

async fn reply_parse_error(session: &Session, err: ParseError) -> Result<(), SendError> {
    debug!(conn = session.conn.id(), error = %err, "unparseable frame");
    let reply = match &err {
        ParseError::Filter {
            subscription_id, ..
        } => RelayMessage::closed(subscription_id.as_str(), err.to_string()),
        ParseError::Envelope { tag: "AUTH", .. } => RelayMessage::ok("", false, err.to_string()),
        _ => RelayMessage::Notice(err.to_string()),
    };
    session.conn.send_message(&reply).await
}

/// Split a handler error into a fatal write failure or a reportable error.
fn recoverable(err: anyhow::Error) -> Result<anyhow::Error, SendError> {
    match err.downcast::<SendError>() {
        Ok(fatal) => Err(fatal),
        Err(other) => Ok(other),
    }
}

/// Verify, broadcast to live listeners, then run the kind handler.
///
/// Live delivery is not gated by AUTH: a kind that requires authentication
/// still reaches matching subscriptions, and only its handler refuses it.
async fn on_event(relay: &Relay, session: &Session, ev: Event) -> Result<(), SendError> {
    let conn = &session.conn;
    if relay.options().verify_sig {
        if let Err(e) = relay.verifier().verify(&ev) {
            debug!(conn = conn.id(), id = %ev.id, error = %e, "rejecting event");
            return conn
                .send_message(&RelayMessage::ok(&ev.id, false, format!("invalid: {e}")))
                .await;
        }
    }
    let Some(handler) = relay.handlers().lookup_kind(ev.kind) else {
        debug!(conn = conn.id(), kind = ev.kind, "no handler for kind, dropping event");
        return Ok(());
    };
    router::broadcast(relay.registry(), &ev).await;
    let ex = Exchange::for_event(&ev, conn, session.pubkey.as_deref());
    if let Err(e) = handler.handle(&ex).await {
        let e = recoverable(e)?;
        warn!(conn = conn.id(), id = %ev.id, kind = ev.kind, error = %e, "event handler failed");
        conn.send_message(&RelayMessage::ok(&ev.id, false, format!("error: {e}")))
            .await?;
    }
    Ok(())
}

async fn on_req(
    relay: &Relay,
    session: &Session,
    subscription_id: String,
    filters: Vec<Filter>,
) -> Result<(), SendError> {
    let conn = &session.conn;
    let registry = relay.registry();
    let limit = relay.options().max_subscriptions;
    if !registry.contains(conn.id(), &subscription_id)
        && registry.subscription_count(conn.id()) >= limit
    {
        debug!(conn = conn.id(), sub = %subscription_id, "subscription limit reached");
        let reason = format!("error: too many subscriptions (max {limit})");
        return conn
            .send_message(&RelayMessage::closed(subscription_id, reason))
            .await;
    }
    let cancel = registry.register(conn, &subscription_id, filters.clone());
    debug!(conn = conn.id(), sub = %subscription_id, "subscription registered");
    let Some(handler) = relay.handlers().lookup(FILTER_HANDLER) else {
        return conn.send_message(&RelayMessage::Eose(subscription_id)).await;
    };
    let ex = Exchange::for_request(
        &subscription_id,
        &filters,
        conn,
        session.pubkey.as_deref(),
        &cancel,
    );
    if let Err(e) = handler.handle(&ex).await {
        let e = recoverable(e)?;
        warn!(conn = conn.id(), sub = %subscription_id, error = %e, "replay failed");
        registry.unregister(conn.id(), &subscription_id);
        conn.send_message(&RelayMessage::closed(
            subscription_id,
            "error: could not load stored events",
        ))
        .await?;
    }
    Ok(())
}

async fn on_close(
    relay: &Relay,
    session: &Session,
    subscription_id: String,
) -> Result<(), SendError> {
    let removed = relay
        .registry()
        .unregister(session.conn.id(), &subscription_id);
    debug!(conn = session.conn.id(), sub = %subscription_id, removed, "close");
    let message = if removed { CLOSE_OK } else { CLOSE_MISSING };
    session
        .conn
        .send_message(&RelayMessage::closed(subscription_id, message))
        .await
}

async fn on_auth(relay: &Relay, session: &mut Session, ev: Event) -> Result<(), SendError> {
    let reply = match relay
        .authenticator()
        .validate(&ev, &session.challenge, unix_now())
    {
        Ok(()) => {
            if session.pubkey.is_none() {
                info!(conn = session.conn.id(), pubkey = %ev.pubkey, "authenticated");
                session.pubkey = Some(ev.pubkey.clone());
            }
            RelayMessage::ok(&ev.id, true, "")
        }
        Err(e) => {
            debug!(conn = session.conn.id(), error = %e, "auth rejected");
            RelayMessage::ok(&ev.id, false, e.to_string())
        }
    };
    session.conn.send_message(&reply).await
}

async fn on_count(
    relay: &Relay,
    session: &Session,
    subscription_id: String,
    filters: Vec<Filter>,
) -> Result<(), SendError> {
    let store = Arc::clone(relay.store());
    let counted = tokio::task::spawn_blocking(move || store.count(&filters))
        .await
        .map_err(anyhow::Error::from)
        .and_then(|res| res);
    let reply = match counted {
        Ok(count) => RelayMessage::Count {
            subscription_id,
            count,
        },
        Err(e) => {
            warn!(conn = session.conn.id(), sub = %subscription_id, error = %e, "count failed");
            RelayMessage::closed(subscription_id, "error: could not count events")
        }
    };
    session.conn.send_message(&reply).await
}
