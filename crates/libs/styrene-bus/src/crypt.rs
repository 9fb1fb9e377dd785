//! Body encryption boundary.
//!
//! The codec calls a [`BodyCipher`] at exactly two points: after the body
//! is marshaled and before the first byte is written, and after the header
//! is decoded and before the body is parsed. Key agreement happens
//! elsewhere; the cipher only reports whether a key is available.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use log::debug;
use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::error::BusError;
use crate::header::MessageType;

pub const SESSION_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
/// Bytes added to every body by [`SessionKeyCipher`].
pub const SESSION_CIPHER_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// What the cipher is told about the message it is protecting.
#[derive(Debug, Clone, Copy)]
pub struct CipherContext<'a> {
    /// Destination when encrypting, sender when decrypting.
    pub peer: &'a str,
    pub msg_type: MessageType,
    /// Signal without a destination; protected with the group key.
    pub broadcast: bool,
    /// Injected authentication version for peers whose capability is unknown.
    pub auth_version: Option<u32>,
    /// Header bytes that must not change between encrypt and decrypt.
    pub associated_data: &'a [u8],
}

pub trait BodyCipher: Send + Sync {
    /// Ciphertext length minus plaintext length.
    fn overhead(&self) -> usize;

    fn encrypt(&self, ctx: &CipherContext<'_>, body: &[u8]) -> Result<Vec<u8>, BusError>;

    fn decrypt(&self, ctx: &CipherContext<'_>, body: &[u8]) -> Result<Vec<u8>, BusError>;
}

type SessionKey = Zeroizing<[u8; SESSION_KEY_LEN]>;

/// AES-256-GCM with one session key per peer and an optional group key for
/// broadcast signals. Body layout is `nonce(12) || ciphertext || tag(16)`.
#[derive(Default)]
pub struct SessionKeyCipher {
    peers: RwLock<HashMap<String, SessionKey>>,
    pending: RwLock<HashSet<String>>,
    group: RwLock<Option<SessionKey>>,
}

impl SessionKeyCipher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_peer_key(&self, peer: &str, key: [u8; SESSION_KEY_LEN]) {
        self.pending.write().unwrap_or_else(|e| e.into_inner()).remove(peer);
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.to_owned(), Zeroizing::new(key));
    }

    /// Records that key agreement with `peer` has started but not finished.
    pub fn mark_pending(&self, peer: &str) {
        self.pending.write().unwrap_or_else(|e| e.into_inner()).insert(peer.to_owned());
    }

    pub fn remove_peer(&self, peer: &str) {
        self.peers.write().unwrap_or_else(|e| e.into_inner()).remove(peer);
        self.pending.write().unwrap_or_else(|e| e.into_inner()).remove(peer);
    }

    pub fn set_group_key(&self, key: [u8; SESSION_KEY_LEN]) {
        *self.group.write().unwrap_or_else(|e| e.into_inner()) = Some(Zeroizing::new(key));
    }

    fn key_for(&self, ctx: &CipherContext<'_>) -> Result<SessionKey, BusError> {
        if ctx.broadcast {
            debug!("crypt: group key for broadcast, auth version {:?}", ctx.auth_version);
            return self
                .group
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or_else(|| BusError::NotAuthorized("no group key".into()));
        }
        if let Some(key) = self.peers.read().unwrap_or_else(|e| e.into_inner()).get(ctx.peer) {
            return Ok(key.clone());
        }
        if self.pending.read().unwrap_or_else(|e| e.into_inner()).contains(ctx.peer) {
            return Err(BusError::AuthenticationPending(ctx.peer.to_owned()));
        }
        Err(BusError::NotAuthorized(format!("no session key for \"{}\"", ctx.peer)))
    }

    fn aead(key: &SessionKey) -> Result<Aes256Gcm, BusError> {
        Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| BusError::NotAuthorized("invalid session key length".into()))
    }
}

impl BodyCipher for SessionKeyCipher {
    fn overhead(&self) -> usize {
        SESSION_CIPHER_OVERHEAD
    }

    fn encrypt(&self, ctx: &CipherContext<'_>, body: &[u8]) -> Result<Vec<u8>, BusError> {
        let aead = Self::aead(&self.key_for(ctx)?)?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = aead
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: body, aad: ctx.associated_data })
            .map_err(|_| BusError::NotAuthorized("body encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ctx: &CipherContext<'_>, body: &[u8]) -> Result<Vec<u8>, BusError> {
        if body.len() < SESSION_CIPHER_OVERHEAD {
            return Err(BusError::DecryptionFailed);
        }
        let aead = Self::aead(&self.key_for(ctx)?)?;
        let (nonce, sealed) = body.split_at(NONCE_LEN);
        aead.decrypt(Nonce::from_slice(nonce), Payload { msg: sealed, aad: ctx.associated_data })
            .map_err(|_| BusError::DecryptionFailed)
    }
}
