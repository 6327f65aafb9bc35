//! Event id and signature verification.

use anyhow::{anyhow, Result};
use secp256k1::{schnorr::Signature, Message, Secp256k1, XOnlyPublicKey};

use crate::event::{event_hash, Event};

/// Checks that an event is authentic before the relay acts on it.
pub trait SignatureVerifier: Send + Sync {
    /// Return `Ok` when the event id and signature are valid.
    fn verify(&self, ev: &Event) -> Result<()>;
}

/// BIP-340 Schnorr verification over secp256k1, as used by NIP-01.
#[derive(Debug, Default, Clone, Copy)]
pub struct Schnorr;

impl SignatureVerifier for Schnorr {
    fn verify(&self, ev: &Event) -> Result<()> {
        let hash = event_hash(ev)?;
        let calc_id = hex::encode(hash);
        if calc_id != ev.id {
            return Err(anyhow!("id mismatch"));
        }
        let sig = Signature::from_slice(&hex::decode(&ev.sig)?)?;
        let pk = XOnlyPublicKey::from_slice(&hex::decode(&ev.pubkey)?)?;
        let secp = Secp256k1::verification_only();
        let msg = Message::from_digest_slice(&hash)?;
        secp.verify_schnorr(&sig, &msg, &pk)?;
        Ok(())
    }
}
