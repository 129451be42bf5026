//! The encryption policy surface of the connection manager.
//!
//! Negotiation itself (the message stream encryption key exchange) is an
//! external primitive: the connection manager only chooses which modes a peer
//! may still be offered, invokes a [`Negotiator`], and records which mode a
//! session ended up using. Each failed negotiation or handshake narrows the
//! peer's allowed set, so reconnects walk down the tiers: RC4 full, then RC4
//! header, then plain text, as configuration permits.

use std::ops::{BitOr, BitOrAssign};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_util::codec::Encoder;

use crate::{
    conn::Connection,
    error::{Error, Result},
    peer::codec::{Handshake, HandshakeCodec},
    Sha1Hash,
};

/// A set of encryption modes, used both as client policy and as the
/// per-peer set that failed negotiations narrow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncryptionModes(u8);

impl EncryptionModes {
    /// No encryption: the standard handshake and messages in the clear.
    pub const PLAIN_TEXT: Self = Self(0b001);
    /// Encrypted headers only; piece payloads are sent in the clear.
    pub const RC4_HEADER: Self = Self(0b010);
    /// The whole stream is encrypted.
    pub const RC4_FULL: Self = Self(0b100);

    pub fn none() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Self::PLAIN_TEXT | Self::RC4_HEADER | Self::RC4_FULL
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if every mode in `other` is also in `self`.
    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersection(&self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns the set with every mode in `other` removed.
    pub fn remove(&self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns true if `self` is a strict subset of `other`.
    pub fn is_strict_subset_of(&self, other: Self) -> bool {
        *self != other && other.contains(*self)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & Self::all().0)
    }
}

impl BitOr for EncryptionModes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EncryptionModes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// A negotiated stream transform. Stream ciphers apply the same transform in
/// read order, so a session holds one instance per direction.
pub trait StreamCipher: Send {
    fn apply(&mut self, buf: &mut [u8]);
}

/// The identity cipher used by plain text sessions.
pub struct PlainText;

impl StreamCipher for PlainText {
    fn apply(&mut self, _buf: &mut [u8]) {}
}

/// The outcome of a successful negotiation: one cipher per direction and the
/// mode that was agreed on.
pub struct CipherPair {
    pub encryptor: Box<dyn StreamCipher>,
    pub decryptor: Box<dyn StreamCipher>,
    pub mode: EncryptionModes,
}

impl CipherPair {
    /// A pair of identity ciphers for plain text sessions.
    pub fn plain_text() -> Self {
        Self {
            encryptor: Box::new(PlainText),
            decryptor: Box::new(PlainText),
            mode: EncryptionModes::PLAIN_TEXT,
        }
    }
}

/// Negotiates encryption with a remote peer as the connection initiator.
///
/// The negotiator owns the entire pre-handshake exchange: on success the
/// prepared handshake has been sent through the agreed cipher and the
/// returned pair decrypts everything the remote sends from here on.
#[async_trait]
pub trait Negotiator: Send + Sync {
    async fn check_outgoing(
        &self,
        conn: &dyn Connection,
        allowed: EncryptionModes,
        settings: EncryptionModes,
        info_hash: &Sha1Hash,
        handshake: Handshake,
    ) -> Result<CipherPair>;
}

/// The bundled negotiator: plain text only.
///
/// RC4 negotiation requires the external message stream encryption primitive;
/// embedders that carry one plug it in through the [`Negotiator`] trait.
pub struct PlainTextNegotiator;

#[async_trait]
impl Negotiator for PlainTextNegotiator {
    async fn check_outgoing(
        &self,
        conn: &dyn Connection,
        allowed: EncryptionModes,
        settings: EncryptionModes,
        _info_hash: &Sha1Hash,
        handshake: Handshake,
    ) -> Result<CipherPair> {
        let effective = allowed.intersection(settings);
        if !effective.contains(EncryptionModes::PLAIN_TEXT) {
            return Err(Error::NegotiationFailed);
        }

        let mut buf = BytesMut::with_capacity(crate::peer::codec::HANDSHAKE_LEN);
        HandshakeCodec.encode(handshake, &mut buf)?;
        conn.send(&buf).await?;

        Ok(CipherPair::plain_text())
    }
}
