//! Canonical serialization and envelope hashing (spec §4.1).
//!
//! `serde_json`'s default `Map` (we never enable the `preserve_order`
//! feature) is backed by a `BTreeMap`, so any `Value` built through normal
//! `Serialize` already has lexicographically-sorted object keys and
//! minimal number rendering. Canonicalization is therefore just "go
//! through `serde_json::Value` and serialize it back out" — no bespoke
//! recursive sorter is needed, and the round-trip law (I1) falls out of
//! `serde_json::Value`'s own `PartialEq`/`Serialize` consistency.

use blake2::{Blake2s256, Digest};

use crate::envelope::Envelope;
use crate::error::{Error, Result};

/// Canonical JSON bytes of `envelope`, with `signer`/`sig` always absent
/// (the unsigned projection), regardless of whether `envelope` is signed.
pub fn canonical_unsigned_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    let unsigned = envelope.unsigned_projection();
    canonical_bytes(&unsigned)
}

/// Canonical JSON bytes of `envelope` exactly as given (signer/sig included
/// if present). Used only to check round-trip/parse equality in tests —
/// the hash and signature always operate on the unsigned projection.
pub fn canonical_bytes(envelope: &Envelope) -> Result<Vec<u8>> {
    let value = serde_json::to_value(envelope).map_err(Error::Serde)?;
    serde_json::to_vec(&value).map_err(Error::Serde)
}

/// The envelope ID: BLAKE2s-256 of the canonical bytes of the unsigned
/// envelope, hex-encoded. This is the hash referenced by `rfq_id`,
/// `quote_id`, and `terms_hash`, and is also what gets signed.
pub fn envelope_id(envelope: &Envelope) -> Result<String> {
    let bytes = canonical_unsigned_bytes(envelope)?;
    Ok(hex::encode(hash_bytes(&bytes)))
}

/// Raw 32-byte BLAKE2s digest of arbitrary bytes.
pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{CancelBody, Envelope, EnvelopeBody};

    fn sample() -> Envelope {
        Envelope::new(
            1,
            "trade-1",
            EnvelopeBody::Cancel(CancelBody {
                reason: Some("timeout".into()),
            }),
            1_700_000_000_000,
            "nonce-xyz",
        )
    }

    #[test]
    fn round_trip_law_i1() {
        let env = sample();
        let bytes1 = canonical_bytes(&env).unwrap();
        let parsed: Envelope = serde_json::from_slice(&bytes1).unwrap();
        let bytes2 = canonical_bytes(&parsed).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn hash_ignores_signer_and_sig() {
        let mut env = sample();
        let id_before = envelope_id(&env).unwrap();

        env.signer = Some("aa".repeat(32));
        env.sig = Some("bb".repeat(64));
        let id_after = envelope_id(&env).unwrap();

        assert_eq!(id_before, id_after);
    }

    #[test]
    fn hash_changes_on_body_mutation() {
        let env = sample();
        let id1 = envelope_id(&env).unwrap();

        let mut env2 = sample();
        if let EnvelopeBody::Cancel(ref mut body) = env2.body {
            body.reason = Some("different".into());
        }
        let id2 = envelope_id(&env2).unwrap();

        assert_ne!(id1, id2);
    }

    #[test]
    fn keys_are_sorted_in_canonical_output() {
        let env = sample();
        let bytes = canonical_bytes(&env).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        // `body` sorts before `kind` sorts before `nonce` ... `v` (alphabetic).
        let body_pos = text.find("\"body\"").unwrap();
        let kind_pos = text.find("\"kind\"").unwrap();
        let v_pos = text.find("\"v\"").unwrap();
        assert!(body_pos < kind_pos);
        assert!(kind_pos < v_pos);
    }
}
