//! Second handshake stage: identity and session-key establishment.
//!
//! Two rounds. In the first, each side sends an [`AuthHello`] with its
//! long-lived identity key, a fresh nonce, and an ephemeral x25519 public
//! key. In the second, each side answers the hello it received with an
//! [`AuthConfirm`] whose signature binds its identity key to the remote's
//! nonce and its own session contribution. A valid confirm fixes the
//! peer's id from the remote identity key and both sides derive the same
//! symmetric session key from the Diffie-Hellman shared secret and the
//! two nonces. Any failure closes with reason `"auth failed"`.

use {
    crate::{
        error::NetworkError,
        handler::{HandlerCore, PeerHandler},
        message::{
            self, AuthConfirm, AuthHello, PROTO_CONTROL, SUB_AUTH_CONFIRM, SUB_AUTH_HELLO,
        },
        packet::Packet,
        peer::{Peer, PeerSink},
        types::PeerID,
    },
    async_trait::async_trait,
    log::{debug, warn},
    rand::{rngs::OsRng, RngCore},
    sha3::{Digest, Sha3_256},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    tessera_common::Wallet,
    tessera_monitoring::NetworkMetrics,
    x25519_dalek::{PublicKey, StaticSecret},
};

/// Per-connection handshake state, keyed by the peer's sequence number.
struct AuthContext {
    secret: StaticSecret,
    nonce: [u8; 32],
    sent_hello: bool,
    remote: Option<AuthHello>,
}

/// The authentication stage.
pub struct Authenticator {
    core: HandlerCore,
    wallet: Arc<Wallet>,
    contexts: Mutex<HashMap<u64, AuthContext>>,
    metrics: Arc<NetworkMetrics>,
}

impl Authenticator {
    pub fn new(wallet: Arc<Wallet>, metrics: Arc<NetworkMetrics>) -> Arc<Self> {
        let self_id = PeerID::from_public_key(&wallet.public_key());
        Arc::new(Self {
            core: HandlerCore::new(self_id),
            wallet,
            contexts: Mutex::new(HashMap::new()),
            metrics,
        })
    }

    pub fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn new_context(&self, seq: u64) -> AuthHello {
        let secret = StaticSecret::random_from_rng(OsRng);
        let mut nonce = [0u8; 32];
        OsRng.fill_bytes(&mut nonce);
        let hello = AuthHello {
            public_key: self.wallet.public_key(),
            nonce,
            session_key: PublicKey::from(&secret).to_bytes(),
        };
        self.contexts
            .lock()
            .expect("auth context lock poisoned")
            .insert(
                seq,
                AuthContext {
                    secret,
                    nonce,
                    sent_hello: false,
                    remote: None,
                },
            );
        hello
    }

    fn fail(&self, peer: &Arc<Peer>) {
        self.drop_context(peer.seq());
        self.metrics.handshake_failures.inc();
        peer.close("auth failed");
    }

    fn drop_context(&self, seq: u64) {
        self.contexts
            .lock()
            .expect("auth context lock poisoned")
            .remove(&seq);
    }

    async fn handle_hello(&self, pkt: &Packet, peer: Arc<Peer>) {
        let hello: AuthHello = match message::decode(&pkt.payload) {
            Ok(h) => h,
            Err(err) => {
                self.drop_context(peer.seq());
                peer.close_by_error(err);
                return;
            }
        };

        let (reply_hello, confirm) = {
            let mut contexts = self.contexts.lock().expect("auth context lock poisoned");
            let Some(mut ctx) = contexts.remove(&peer.seq()) else {
                drop(contexts);
                peer.close_by_error(NetworkError::ProtocolViolation(
                    "auth hello without context".into(),
                ));
                return;
            };
            if ctx.remote.is_some() {
                drop(contexts);
                peer.close_by_error(NetworkError::ProtocolViolation(
                    "duplicate auth hello".into(),
                ));
                return;
            }
            let own_session_key = PublicKey::from(&ctx.secret).to_bytes();
            let transcript = confirm_transcript(
                &hello.nonce,
                &own_session_key,
                &self.wallet.public_key(),
            );
            let confirm = AuthConfirm {
                signature: self.wallet.sign(&transcript),
                session_key: own_session_key,
            };
            let reply_hello = if ctx.sent_hello {
                None
            } else {
                ctx.sent_hello = true;
                Some(AuthHello {
                    public_key: self.wallet.public_key(),
                    nonce: ctx.nonce,
                    session_key: own_session_key,
                })
            };
            ctx.remote = Some(hello);
            contexts.insert(peer.seq(), ctx);
            (reply_hello, confirm)
        };

        if let Some(h) = reply_hello {
            if let Err(err) = self.core.send_message(SUB_AUTH_HELLO, &h, &peer).await {
                self.drop_context(peer.seq());
                peer.close_by_error(err);
                return;
            }
        }
        if let Err(err) = self
            .core
            .send_message(SUB_AUTH_CONFIRM, &confirm, &peer)
            .await
        {
            self.drop_context(peer.seq());
            peer.close_by_error(err);
        }
    }

    async fn handle_confirm(&self, pkt: &Packet, peer: Arc<Peer>) {
        let confirm: AuthConfirm = match message::decode(&pkt.payload) {
            Ok(c) => c,
            Err(err) => {
                self.drop_context(peer.seq());
                peer.close_by_error(err);
                return;
            }
        };

        let outcome = {
            let mut contexts = self.contexts.lock().expect("auth context lock poisoned");
            let Some(ctx) = contexts.remove(&peer.seq()) else {
                drop(contexts);
                peer.close_by_error(NetworkError::ProtocolViolation(
                    "auth confirm without context".into(),
                ));
                return;
            };
            drop(contexts);
            let Some(remote) = ctx.remote else {
                peer.close_by_error(NetworkError::ProtocolViolation(
                    "auth confirm before hello".into(),
                ));
                return;
            };
            let transcript =
                confirm_transcript(&ctx.nonce, &remote.session_key, &remote.public_key);
            let verified = confirm.session_key == remote.session_key
                && Wallet::verify(&remote.public_key, &transcript, &confirm.signature).is_ok();
            if !verified {
                None
            } else {
                let shared = ctx
                    .secret
                    .diffie_hellman(&PublicKey::from(remote.session_key));
                let session = derive_session_key(shared.as_bytes(), &ctx.nonce, &remote.nonce);
                Some((PeerID::from_public_key(&remote.public_key), session))
            }
        };

        match outcome {
            Some((id, session)) => {
                peer.set_id(id);
                peer.set_session_key(session);
                debug!("peer[{peer}] authenticated as {id}");
                self.core.next_on_peer(peer).await;
            }
            None => {
                warn!("peer[{peer}] failed authentication");
                self.fail(&peer);
            }
        }
    }
}

#[async_trait]
impl PeerSink for Authenticator {
    async fn on_packet(&self, pkt: Packet, peer: Arc<Peer>) {
        if pkt.protocol != PROTO_CONTROL {
            self.drop_context(peer.seq());
            peer.close_by_error(NetworkError::ProtocolViolation(format!(
                "non-control packet {:#06x} during authentication",
                pkt.protocol
            )));
            return;
        }
        match pkt.sub_protocol {
            SUB_AUTH_HELLO => self.handle_hello(&pkt, peer).await,
            SUB_AUTH_CONFIRM => self.handle_confirm(&pkt, peer).await,
            sub => {
                self.drop_context(peer.seq());
                peer.close_by_error(NetworkError::ProtocolViolation(format!(
                    "unexpected subprotocol {sub:#06x} during authentication"
                )));
            }
        }
    }

    async fn on_error(&self, err: NetworkError, peer: Arc<Peer>, _pkt: Option<Packet>) {
        debug!("peer[{peer}] authenticator error: {err}");
        self.drop_context(peer.seq());
        peer.close_by_error(err);
    }

    async fn on_close(&self, peer: Arc<Peer>) {
        self.drop_context(peer.seq());
    }
}

#[async_trait]
impl PeerHandler for Authenticator {
    async fn on_peer(&self, peer: Arc<Peer>) {
        let hello = self.new_context(peer.seq());
        if peer.is_incoming() {
            // Wait for the dialer to open the identity round.
            return;
        }
        {
            let mut contexts = self.contexts.lock().expect("auth context lock poisoned");
            if let Some(ctx) = contexts.get_mut(&peer.seq()) {
                ctx.sent_hello = true;
            }
        }
        if let Err(err) = self.core.send_message(SUB_AUTH_HELLO, &hello, &peer).await {
            self.drop_context(peer.seq());
            peer.close_by_error(err);
        }
    }
}

/// The byte string an [`AuthConfirm`] signature covers: the receiver's
/// nonce, then the signer's session contribution, then the signer's
/// identity key.
fn confirm_transcript(nonce: &[u8; 32], session_key: &[u8; 32], identity: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(nonce);
    hasher.update(session_key);
    hasher.update(identity);
    hasher.finalize().into()
}

/// Mix the Diffie-Hellman shared secret with both nonces (order-free) into
/// the symmetric session key.
fn derive_session_key(shared: &[u8; 32], a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha3_256::new();
    hasher.update(shared);
    hasher.update(lo);
    hasher.update(hi);
    hasher.finalize().into()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_is_symmetric() {
        let sa = StaticSecret::random_from_rng(OsRng);
        let sb = StaticSecret::random_from_rng(OsRng);
        let shared_a = sa.diffie_hellman(&PublicKey::from(&sb));
        let shared_b = sb.diffie_hellman(&PublicKey::from(&sa));
        let na = [1u8; 32];
        let nb = [2u8; 32];
        // Each side feeds its own nonce first; the ordering inside the
        // derivation must cancel that out.
        let ka = derive_session_key(shared_a.as_bytes(), &na, &nb);
        let kb = derive_session_key(shared_b.as_bytes(), &nb, &na);
        assert_eq!(ka, kb);
    }

    #[test]
    fn test_confirm_transcript_binds_all_inputs() {
        let base = confirm_transcript(&[1u8; 32], &[2u8; 32], &[3u8; 32]);
        assert_ne!(base, confirm_transcript(&[9u8; 32], &[2u8; 32], &[3u8; 32]));
        assert_ne!(base, confirm_transcript(&[1u8; 32], &[9u8; 32], &[3u8; 32]));
        assert_ne!(base, confirm_transcript(&[1u8; 32], &[2u8; 32], &[9u8; 32]));
    }

    #[test]
    fn test_signature_over_transcript_verifies() {
        let wallet = Wallet::generate();
        let transcript = confirm_transcript(&[1u8; 32], &[2u8; 32], &wallet.public_key());
        let sig = wallet.sign(&transcript);
        assert!(Wallet::verify(&wallet.public_key(), &transcript, &sig).is_ok());

        let other = Wallet::generate();
        assert!(Wallet::verify(&other.public_key(), &transcript, &sig).is_err());
    }
}
