//! Write receipts and their hash chain.
//!
//! Every committed unit of work produces one [`WriteReceipt`]:
//!
//! ```text
//! chain_hash(0) = GENESIS
//! chain_hash(n) = SHA-256(payload_hash(n) ‖ chain_hash(n-1))
//! signature(n)  = Ed25519(RECEIPT_DOMAIN_PREFIX ‖ chain_hash(n))
//! ```
//!
//! [`verify_chain`] walks a window of receipts from a trusted anchor and
//! produces an [`IntegrityReport`].

use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use memoria_shared::{EventId, ReceiptId, UnitOfWorkId};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::canonical::{canonical_digest, sha256};
use crate::error::{Result, StorageError};
use crate::store::StoreContribution;

/// Domain separation for receipt signatures.
pub const RECEIPT_DOMAIN_PREFIX: &[u8] = b"memoria.receipt.v1:";

/// Seed material of the development signing key used when none is configured.
const DEVELOPMENT_KEY_MATERIAL: &[u8] = b"memoria.development.receipt-signing-key";

/// A 32-byte SHA-256 digest, hex encoded when displayed or persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256(#[serde(with = "hex_bytes")] pub [u8; 32]);

/// Chain hash preceding the first receipt.
pub const GENESIS_CHAIN_HASH: Hash256 = Hash256([0u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| StorageError::Signature(format!("invalid hash hex: {}", e)))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StorageError::Signature("hash must be 32 bytes".to_string()))?;
        Ok(Self(array))
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(d)?;
        let bytes = hex::decode(&raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

/// `SHA-256(payload_hash ‖ prev_chain_hash)`
pub fn compute_chain_hash(payload_hash: &Hash256, prev_chain_hash: &Hash256) -> Hash256 {
    let mut material = [0u8; 64];
    material[..32].copy_from_slice(&payload_hash.0);
    material[32..].copy_from_slice(&prev_chain_hash.0);
    Hash256(sha256(&material))
}

/// Integrity record of one commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReceipt {
    pub id: ReceiptId,
    /// Position in the chain, starting at 1
    pub sequence: i64,
    pub unit_of_work_id: UnitOfWorkId,
    pub stores_affected: Vec<String>,
    pub payload_hash: Hash256,
    /// Chain hash of the predecessor (genesis for the first receipt)
    pub prev_receipt_hash: Hash256,
    pub chain_hash: Hash256,
    /// Hex-encoded Ed25519 signature over the chain hash
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

impl WriteReceipt {
    /// Whether `chain_hash` follows from `payload_hash` and `prev_receipt_hash`.
    pub fn is_self_consistent(&self) -> bool {
        compute_chain_hash(&self.payload_hash, &self.prev_receipt_hash) == self.chain_hash
    }
}

/// Digest of one staged outbox event, as folded into a receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDigest {
    pub id: EventId,
    pub aggregate_id: String,
    pub event_type: String,
    pub sequence_number: i64,
    pub payload_sha256: String,
}

impl EventDigest {
    pub fn new(
        id: EventId,
        aggregate_id: &str,
        event_type: &str,
        sequence_number: i64,
        payload: &serde_json::Value,
    ) -> Result<Self> {
        Ok(Self {
            id,
            aggregate_id: aggregate_id.to_string(),
            event_type: event_type.to_string(),
            sequence_number,
            payload_sha256: hex::encode(canonical_digest(payload)?),
        })
    }
}

/// Everything a commit wrote, hashed into the receipt's `payload_hash`.
#[derive(Debug, Clone, Serialize)]
pub struct CommitPayload<'a> {
    pub unit_of_work_id: UnitOfWorkId,
    pub idempotency_key: Option<&'a str>,
    pub stores: &'a [StoreContribution],
    pub events: &'a [EventDigest],
}

impl CommitPayload<'_> {
    pub fn payload_hash(&self) -> Result<Hash256> {
        Ok(Hash256(canonical_digest(self)?))
    }
}

/// Signs and verifies receipt chain hashes.
pub trait ReceiptSigner: Send + Sync {
    /// Hex-encoded public key identifying the signer.
    fn key_id(&self) -> String;

    fn sign(&self, chain_hash: &Hash256) -> String;

    fn verify(&self, chain_hash: &Hash256, signature_hex: &str) -> bool;
}

/// Ed25519 receipt signer
#[derive(Clone)]
pub struct Ed25519ReceiptSigner {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Ed25519ReceiptSigner {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Build from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| StorageError::Signature(format!("invalid signing key hex: {}", e)))?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|_| StorageError::Signature("signing key must be 32 bytes".to_string()))?;
        Ok(Self::from_seed(seed))
    }

    /// Deterministic key for local development and tests. Not secret.
    pub fn development() -> Self {
        warn!("Using the development receipt signing key; configure MEMORIA_LEDGER_SIGNING_KEY");
        Self::from_seed(sha256(DEVELOPMENT_KEY_MATERIAL))
    }

    fn message(chain_hash: &Hash256) -> Vec<u8> {
        let mut message = Vec::with_capacity(RECEIPT_DOMAIN_PREFIX.len() + 32);
        message.extend_from_slice(RECEIPT_DOMAIN_PREFIX);
        message.extend_from_slice(&chain_hash.0);
        message
    }
}

impl fmt::Debug for Ed25519ReceiptSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519ReceiptSigner")
            .field("key_id", &self.key_id())
            .finish()
    }
}

impl ReceiptSigner for Ed25519ReceiptSigner {
    fn key_id(&self) -> String {
        hex::encode(self.verifying_key.as_bytes())
    }

    fn sign(&self, chain_hash: &Hash256) -> String {
        let signature = self.signing_key.sign(&Self::message(chain_hash));
        hex::encode(signature.to_bytes())
    }

    fn verify(&self, chain_hash: &Hash256, signature_hex: &str) -> bool {
        let Ok(bytes) = hex::decode(signature_hex) else {
            return false;
        };
        let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
            return false;
        };
        let signature = Signature::from_bytes(&bytes);
        self.verifying_key
            .verify(&Self::message(chain_hash), &signature)
            .is_ok()
    }
}

/// Last trusted point of the chain before a verification window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainAnchor {
    pub sequence: i64,
    pub chain_hash: Hash256,
}

impl ChainAnchor {
    pub fn genesis() -> Self {
        Self {
            sequence: 0,
            chain_hash: GENESIS_CHAIN_HASH,
        }
    }
}

/// How a link in the chain is broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// Stored chain hash does not follow from payload and predecessor hashes
    ChainMismatch,
    /// Predecessor hash does not match the previous receipt's chain hash
    PredecessorMismatch,
    /// Signature does not verify
    InvalidSignature,
    /// A sequence number is absent
    Missing,
    /// Stored hash columns could not be decoded
    Undecodable,
}

impl fmt::Display for BreakKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BreakKind::ChainMismatch => "chain hash mismatch",
            BreakKind::PredecessorMismatch => "predecessor hash mismatch",
            BreakKind::InvalidSignature => "invalid signature",
            BreakKind::Missing => "missing receipt",
            BreakKind::Undecodable => "undecodable receipt",
        };
        f.write_str(s)
    }
}

/// First broken link found by a verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub sequence: i64,
    pub receipt_id: Option<ReceiptId>,
    pub kind: BreakKind,
}

/// Result of verifying a window of the chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub verified: u64,
    pub corrupted: u64,
    pub missing: u64,
    pub first_broken: Option<BrokenLink>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.corrupted == 0 && self.missing == 0
    }

    /// Convert a broken report into [`StorageError::ReceiptChainBroken`].
    pub fn ensure_intact(&self) -> Result<()> {
        match &self.first_broken {
            Some(link) if !self.is_intact() => Err(StorageError::ReceiptChainBroken {
                sequence: link.sequence,
                receipt_id: link.receipt_id,
                reason: link.kind.to_string(),
            }),
            _ => Ok(()),
        }
    }

    fn record_break(&mut self, link: BrokenLink) {
        if self.first_broken.is_none() {
            self.first_broken = Some(link);
        }
    }
}

/// A stored receipt whose hash columns did not decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndecodableReceipt {
    pub sequence: i64,
    pub receipt_id: Option<ReceiptId>,
    pub reason: String,
}

/// One position of a verification window.
#[derive(Debug, Clone, Copy)]
pub enum ChainEntry<'a> {
    Decoded(&'a WriteReceipt),
    Undecodable(&'a UndecodableReceipt),
}

impl ChainEntry<'_> {
    fn sequence(&self) -> i64 {
        match self {
            ChainEntry::Decoded(receipt) => receipt.sequence,
            ChainEntry::Undecodable(entry) => entry.sequence,
        }
    }
}

/// Verify `receipts` (ascending by sequence) against `anchor`.
pub fn verify_chain(
    anchor: ChainAnchor,
    receipts: &[WriteReceipt],
    signer: &dyn ReceiptSigner,
) -> IntegrityReport {
    verify_entries(
        anchor.sequence,
        Some(anchor.chain_hash),
        receipts.iter().map(ChainEntry::Decoded),
        signer,
    )
}

/// Verify a window that may hold undecodable rows.
///
/// `anchor_hash` is `None` when the receipt before the window is itself
/// unreadable; the first receipt then skips its predecessor check. A gap in
/// sequence numbers counts every absent receipt as missing, and the entry
/// after a gap or an undecodable row is only checked for self-consistency
/// and signature.
pub fn verify_entries<'a>(
    anchor_sequence: i64,
    anchor_hash: Option<Hash256>,
    entries: impl IntoIterator<Item = ChainEntry<'a>>,
    signer: &dyn ReceiptSigner,
) -> IntegrityReport {
    let mut report = IntegrityReport::default();
    let mut expected_sequence = anchor_sequence + 1;
    let mut prev_chain_hash = anchor_hash;

    for entry in entries {
        let sequence = entry.sequence();
        let after_gap = sequence > expected_sequence;
        if after_gap {
            report.missing += (sequence - expected_sequence) as u64;
            report.record_break(BrokenLink {
                sequence: expected_sequence,
                receipt_id: None,
                kind: BreakKind::Missing,
            });
        }
        expected_sequence = sequence + 1;

        let receipt = match entry {
            ChainEntry::Decoded(receipt) => receipt,
            ChainEntry::Undecodable(undecodable) => {
                report.corrupted += 1;
                report.record_break(BrokenLink {
                    sequence,
                    receipt_id: undecodable.receipt_id,
                    kind: BreakKind::Undecodable,
                });
                prev_chain_hash = None;
                continue;
            }
        };

        let predecessor_broken = match prev_chain_hash {
            Some(prev) if !after_gap => receipt.prev_receipt_hash != prev,
            _ => false,
        };
        let failure = if !receipt.is_self_consistent() {
            Some(BreakKind::ChainMismatch)
        } else if predecessor_broken {
            Some(BreakKind::PredecessorMismatch)
        } else if !signer.verify(&receipt.chain_hash, &receipt.signature) {
            Some(BreakKind::InvalidSignature)
        } else {
            None
        };

        match failure {
            Some(kind) => {
                report.corrupted += 1;
                report.record_break(BrokenLink {
                    sequence,
                    receipt_id: Some(receipt.id),
                    kind,
                });
            }
            None => report.verified += 1,
        }

        prev_chain_hash = Some(receipt.chain_hash);
    }

    report
}
