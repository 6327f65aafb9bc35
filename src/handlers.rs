//! Pluggable per-kind business logic.
//!
//! Handlers are looked up by name: `kind/<n>` for published events and
//! [`FILTER_HANDLER`] for subscription replay. Each call gets an [`Exchange`]
//! giving read access to the inbound payload and a way to write replies.

use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    connection::{Connection, SendError},
    event::Event,
    filter::Filter,
    message::build_response,
    storage::EventStore,
};

/// Name of the handler that replays stored events for a `REQ`.
pub const FILTER_HANDLER: &str = "filter";

/// What the client sent.
#[derive(Debug, Clone, Copy)]
pub enum Payload<'a> {
    Event(&'a Event),
    Request {
        subscription_id: &'a str,
        filters: &'a [Filter],
    },
}

/// Capability object handed to a [`Handler`].
pub struct Exchange<'a> {
    payload: Payload<'a>,
    conn: &'a Connection,
    pubkey: Option<&'a str>,
    cancel: Option<&'a CancellationToken>,
}

impl<'a> Exchange<'a> {
    pub fn for_event(ev: &'a Event, conn: &'a Connection, pubkey: Option<&'a str>) -> Self {
        Self {
            payload: Payload::Event(ev),
            conn,
            pubkey,
            cancel: None,
        }
    }

    pub fn for_request(
        subscription_id: &'a str,
        filters: &'a [Filter],
        conn: &'a Connection,
        pubkey: Option<&'a str>,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            payload: Payload::Request {
                subscription_id,
                filters,
            },
            conn,
            pubkey,
            cancel: Some(cancel),
        }
    }

    /// Serialized inbound payload: the event object, or the `REQ` envelope.
    pub fn read(&self) -> Result<Vec<u8>> {
        let val = match self.payload {
            Payload::Event(ev) => serde_json::to_value(ev)?,
            Payload::Request {
                subscription_id,
                filters,
            } => {
                let mut arr = vec![json!("REQ"), json!(subscription_id)];
                arr.extend(filters.iter().map(Filter::to_value));
                Value::Array(arr)
            }
        };
        Ok(serde_json::to_vec(&val)?)
    }

    pub fn event(&self) -> Option<&'a Event> {
        match self.payload {
            Payload::Event(ev) => Some(ev),
            Payload::Request { .. } => None,
        }
    }

    pub fn request(&self) -> Option<(&'a str, &'a [Filter])> {
        match self.payload {
            Payload::Request {
                subscription_id,
                filters,
            } => Some((subscription_id, filters)),
            Payload::Event(_) => None,
        }
    }

    /// Pubkey proven through AUTH on this connection, if any.
    pub fn authenticated(&self) -> Option<&'a str> {
        self.pubkey
    }

    /// Whether the subscription being served has been closed or replaced.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(CancellationToken::is_cancelled) || self.conn.is_closed()
    }

    /// Send `[kind, params...]` to the client.
    ///
    /// Pairs that don't form a known frame are dropped with a debug log.
    pub async fn write(&self, kind: &str, params: Vec<Value>) -> Result<(), SendError> {
        match build_response(kind, &params) {
            Some(msg) => self.conn.send_message(&msg).await,
            None => {
                debug!(conn = self.conn.id(), kind, "handler produced no response");
                Ok(())
            }
        }
    }
}

/// Business logic for one kind of inbound message.
///
/// Returning an error whose root cause is a [`SendError`] ends the
/// connection; any other error is reported to the client.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ex: &Exchange<'_>) -> Result<()>;
}

/// Name -> handler lookup table.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default wiring: a [`StoreHandler`] for every accepted or privileged
    /// kind, plus a [`ReplayHandler`] under [`FILTER_HANDLER`].
    pub fn standard(store: Arc<dyn EventStore>, accepted: &[u32], privileged: &[u32]) -> Self {
        let mut reg = Self::new();
        for &kind in accepted.iter().chain(privileged) {
            let handler = StoreHandler {
                store: Arc::clone(&store),
                auth_required: privileged.contains(&kind),
            };
            reg.register_kind(kind, Arc::new(handler));
        }
        reg.register(FILTER_HANDLER, Arc::new(ReplayHandler { store }));
        reg
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn register_kind(&mut self, kind: u32, handler: Arc<dyn Handler>) {
        self.register(format!("kind/{kind}"), handler);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(name).cloned()
    }

    pub fn lookup_kind(&self, kind: u32) -> Option<Arc<dyn Handler>> {
        self.lookup(&format!("kind/{kind}"))
    }
}

/// Persists published events and answers with `OK`.
pub struct StoreHandler {
    store: Arc<dyn EventStore>,
    auth_required: bool,
}

#[async_trait]
impl Handler for StoreHandler {
    async fn handle(&self, ex: &Exchange<'_>) -> Result<()> {
        let ev = ex
            .event()
            .ok_or_else(|| anyhow!("store handler needs an event"))?;
        if self.auth_required && ex.authenticated().is_none() {
            ex.write(
                "OK",
                vec![
                    json!(ev.id),
                    json!(false),
                    json!(format!("auth-required: kind {} needs authentication", ev.kind)),
                ],
            )
            .await?;
            return Ok(());
        }
        let store = Arc::clone(&self.store);
        let owned = ev.clone();
        let stored = tokio::task::spawn_blocking(move || store.store(&owned))
            .await
            .map_err(anyhow::Error::from)
            .and_then(|res| res);
        let (accepted, message) = match stored {
            Ok(true) => (true, String::new()),
            Ok(false) => (true, "duplicate: already have this event".to_string()),
            Err(e) => {
                warn!(id = %ev.id, kind = ev.kind, error = %e, "failed to store event");
                (false, "error: could not store event".to_string())
            }
        };
        ex.write("OK", vec![json!(ev.id), json!(accepted), json!(message)])
            .await?;
        Ok(())
    }
}

/// Replays stored matches for a `REQ`, then sends `EOSE`.
pub struct ReplayHandler {
    store: Arc<dyn EventStore>,
}

#[async_trait]
impl Handler for ReplayHandler {
    async fn handle(&self, ex: &Exchange<'_>) -> Result<()> {
        let Some((subscription_id, filters)) = ex.request() else {
            bail!("replay handler needs a subscription request");
        };
        let store = Arc::clone(&self.store);
        let owned = filters.to_vec();
        let events = tokio::task::spawn_blocking(move || store.query(&owned)).await??;
        for ev in events {
            if ex.is_cancelled() {
                return Ok(());
            }
            ex.write("EVENT", vec![json!(subscription_id), serde_json::to_value(&ev)?])
                .await?;
        }
        if !ex.is_cancelled() {
            ex.write("EOSE", vec![json!(subscription_id)]).await?;
        }
        Ok(())
    }
}
