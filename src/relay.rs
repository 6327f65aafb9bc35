//! Shared relay state handed to every connection session.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
    auth::Authenticator,
    config::Settings,
    connection::ConnId,
    handlers::HandlerRegistry,
    registry::SubscriptionRegistry,
    storage::EventStore,
    verify::{Schnorr, SignatureVerifier},
};

/// NIP-11 relay information document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex pubkey of the relay operator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u32>,
    pub software: String,
    pub version: String,
}

impl Default for RelayInfo {
    fn default() -> Self {
        Self {
            name: None,
            description: None,
            pubkey: None,
            contact: None,
            supported_nips: vec![1, 11, 42, 45],
            software: env!("CARGO_PKG_NAME").into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// Tunables for the connection engine.
#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// This relay's public URL, matched against AUTH `relay` tags.
    pub relay_url: String,
    /// Verify ids and signatures of published events before broadcasting.
    pub verify_sig: bool,
    /// Allowed distance in seconds between an AUTH event and the relay clock.
    pub auth_max_skew: u64,
    /// Live subscriptions allowed per connection.
    pub max_subscriptions: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_message_bytes: usize,
    pub write_timeout: Duration,
    pub info: RelayInfo,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:9900".into(),
            verify_sig: true,
            auth_max_skew: 600,
            max_subscriptions: 20,
            max_message_bytes: 512 * 1024,
            write_timeout: Duration::from_secs(5),
            info: RelayInfo::default(),
        }
    }
}

impl RelayOptions {
    pub fn from_settings(cfg: &Settings) -> Self {
        Self {
            relay_url: cfg.relay_url.clone(),
            verify_sig: cfg.verify_sig,
            auth_max_skew: cfg.auth_max_skew,
            max_subscriptions: cfg.max_subscriptions,
            max_message_bytes: cfg.max_message_bytes,
            write_timeout: Duration::from_millis(cfg.write_timeout_ms),
            info: RelayInfo {
                name: cfg.relay_name.clone(),
                description: cfg.relay_description.clone(),
                pubkey: cfg.relay_pubkey.clone(),
                contact: cfg.relay_contact.clone(),
                ..RelayInfo::default()
            },
        }
    }
}

/// Everything a session needs: the subscription registry, collaborators and
/// options. One instance per server, shared behind an `Arc`.
pub struct Relay {
    registry: Arc<SubscriptionRegistry>,
    store: Arc<dyn EventStore>,
    handlers: HandlerRegistry,
    verifier: Arc<dyn SignatureVerifier>,
    authenticator: Authenticator,
    options: RelayOptions,
    next_id: AtomicU64,
}

impl Relay {
    pub fn new(
        options: RelayOptions,
        store: Arc<dyn EventStore>,
        handlers: HandlerRegistry,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        let authenticator = Authenticator::new(
            options.relay_url.clone(),
            options.auth_max_skew,
            Arc::clone(&verifier),
        );
        Self {
            registry: Arc::new(SubscriptionRegistry::new()),
            store,
            handlers,
            verifier,
            authenticator,
            options,
            next_id: AtomicU64::new(1),
        }
    }

    /// Relay wired with the standard handlers and Schnorr verification.
    pub fn from_settings(cfg: &Settings, store: Arc<dyn EventStore>) -> Self {
        let handlers = HandlerRegistry::standard(
            Arc::clone(&store),
            &cfg.accepted_kinds,
            &cfg.auth_required_kinds,
        );
        Self::new(
            RelayOptions::from_settings(cfg),
            store,
            handlers,
            Arc::new(Schnorr),
        )
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    pub fn verifier(&self) -> &dyn SignatureVerifier {
        self.verifier.as_ref()
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.authenticator
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    /// Allocate an identity for a newly accepted connection.
    pub fn next_conn_id(&self) -> ConnId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryStore;
    use std::path::PathBuf;

    fn settings() -> Settings {
        Settings {
            store_root: PathBuf::from("/tmp"),
            bind: "127.0.0.1:9900".into(),
            relay_url: "wss://relay.example.com".into(),
            verify_sig: false,
            accepted_kinds: vec![1],
            auth_required_kinds: vec![4],
            auth_max_skew: 60,
            max_subscriptions: 3,
            max_message_bytes: 1024,
            write_timeout_ms: 250,
            relay_name: Some("hornet".into()),
            relay_description: None,
            relay_pubkey: None,
            relay_contact: Some("ops@example.com".into()),
        }
    }

    #[test]
    fn builds_from_settings() {
        let relay = Relay::from_settings(&settings(), Arc::new(MemoryStore::default()));
        let opts = relay.options();
        assert_eq!(opts.relay_url, "wss://relay.example.com");
        assert!(!opts.verify_sig);
        assert_eq!(opts.max_subscriptions, 3);
        assert_eq!(opts.write_timeout, Duration::from_millis(250));
        assert_eq!(relay.authenticator().relay_url(), "wss://relay.example.com");
        assert!(relay.handlers().lookup_kind(1).is_some());
        assert!(relay.handlers().lookup_kind(4).is_some());
        assert!(relay.handlers().lookup_kind(7).is_none());
    }

    #[test]
    fn connection_ids_are_unique() {
        let relay = Relay::from_settings(&settings(), Arc::new(MemoryStore::default()));
        let a = relay.next_conn_id();
        let b = relay.next_conn_id();
        assert_ne!(a, b);
    }

    #[test]
    fn info_document_omits_unset_fields() {
        let info = RelayOptions::from_settings(&settings()).info;
        let val = serde_json::to_value(&info).unwrap();
        assert_eq!(val["name"], "hornet");
        assert_eq!(val["contact"], "ops@example.com");
        assert!(val.get("description").is_none());
        assert_eq!(val["supported_nips"], serde_json::json!([1, 11, 42, 45]));
        assert_eq!(val["software"], "hornet-relay");
    }
}
