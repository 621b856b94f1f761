//! Envelope signer/verifier (spec §4.2).
//!
//! Signatures are Ed25519 over the canonical bytes of the *unsigned*
//! envelope. Every failure mode here — malformed hex, wrong-length
//! fields, bad signature — is data returned to the caller, never a
//! panic; per spec, verification failure must never be fatal to the
//! process.

use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};

use crate::canon::canonical_unsigned_bytes;
use crate::envelope::Envelope;
use crate::error::Result;

/// Outcome of verifying a signed envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyOutcome {
    Ok,
    BadSig { reason: String },
}

impl VerifyOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, VerifyOutcome::Ok)
    }
}

/// Attach `signer`/`sig` to `unsigned`, producing a signed envelope.
///
/// `unsigned` does not need `signer`/`sig` cleared beforehand — the
/// canonical bytes are always computed from the unsigned projection.
pub fn sign(unsigned: &Envelope, secret_key: &SigningKey) -> Result<Envelope> {
    let bytes = canonical_unsigned_bytes(unsigned)?;
    let signature: Signature = secret_key.sign(&bytes);

    let mut signed = unsigned.unsigned_projection();
    signed.signer = Some(hex::encode(secret_key.verifying_key().to_bytes()));
    signed.sig = Some(hex::encode(signature.to_bytes()));
    Ok(signed)
}

/// Verify a signed envelope's signature against its own `signer` field.
///
/// Returns `VerifyOutcome::BadSig` (never an `Err`) for any of: missing
/// `signer`/`sig`, malformed hex, wrong-length key/signature bytes, or an
/// actual cryptographic verification failure. Canonicalization failures
/// (which indicate a structurally broken envelope, not a signature
/// problem) are still surfaced as `Err`.
pub fn verify(signed: &Envelope) -> Result<VerifyOutcome> {
    let (signer_hex, sig_hex) = match (&signed.signer, &signed.sig) {
        (Some(s), Some(g)) => (s, g),
        _ => {
            return Ok(VerifyOutcome::BadSig {
                reason: "missing signer or sig".into(),
            });
        }
    };

    let signer_bytes = match hex::decode(signer_hex) {
        Ok(b) => b,
        Err(e) => {
            return Ok(VerifyOutcome::BadSig {
                reason: format!("malformed signer hex: {e}"),
            });
        }
    };
    let signer_array: [u8; 32] = match signer_bytes.try_into() {
        Ok(a) => a,
        Err(_) => {
            return Ok(VerifyOutcome::BadSig {
                reason: "signer must be 32 bytes".into(),
            });
        }
    };
    let verifying_key = match VerifyingKey::from_bytes(&signer_array) {
        Ok(k) => k,
        Err(e) => {
            return Ok(VerifyOutcome::BadSig {
                reason: format!("invalid signer public key: {e}"),
            });
        }
    };

    let sig_bytes = match hex::decode(sig_hex) {
        Ok(b) => b,
        Err(e) => {
            return Ok(VerifyOutcome::BadSig {
                reason: format!("malformed sig hex: {e}"),
            });
        }
    };
    let sig_array: [u8; 64] = match sig_bytes.try_into() {
        Ok(a) => a,
        Err(_) => {
            return Ok(VerifyOutcome::BadSig {
                reason: "sig must be 64 bytes".into(),
            });
        }
    };
    let signature = Signature::from_bytes(&sig_array);

    let bytes = canonical_unsigned_bytes(signed)?;
    match verifying_key.verify_strict(&bytes, &signature) {
        Ok(()) => Ok(VerifyOutcome::Ok),
        Err(e) => Ok(VerifyOutcome::BadSig {
            reason: format!("signature verification failed: {e}"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{AcceptBody, EnvelopeBody};
    use rand::rngs::OsRng;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn sample(terms_hash: &str) -> Envelope {
        Envelope::new(
            1,
            "trade-1",
            EnvelopeBody::Accept(AcceptBody {
                terms_hash: terms_hash.into(),
            }),
            1_700_000_000_000,
            "nonce-1",
        )
    }

    #[test]
    fn sign_then_verify_succeeds_i3() {
        let sk = keypair();
        let unsigned = sample("abc123");
        let signed = sign(&unsigned, &sk).unwrap();

        assert!(signed.is_signed());
        assert!(verify(&signed).unwrap().is_ok());
    }

    #[test]
    fn mutating_body_breaks_verification_i3() {
        let sk = keypair();
        let signed = sign(&sample("abc123"), &sk).unwrap();

        let mut tampered = signed;
        if let EnvelopeBody::Accept(ref mut body) = tampered.body {
            body.terms_hash = "tampered".into();
        }

        assert!(!verify(&tampered).unwrap().is_ok());
    }

    #[test]
    fn swapping_signer_breaks_verification_i3() {
        let sk1 = keypair();
        let sk2 = keypair();
        let signed_by_1 = sign(&sample("abc123"), &sk1).unwrap();

        let mut swapped = signed_by_1;
        swapped.signer = Some(hex::encode(sk2.verifying_key().to_bytes()));

        assert!(!verify(&swapped).unwrap().is_ok());
    }

    #[test]
    fn envelope_id_matches_hash_of_unsigned_i2() {
        let sk = keypair();
        let unsigned = sample("abc123");
        let signed = sign(&unsigned, &sk).unwrap();

        let id_from_signed = crate::canon::envelope_id(&signed).unwrap();
        let id_from_unsigned = crate::canon::envelope_id(&unsigned).unwrap();
        assert_eq!(id_from_signed, id_from_unsigned);
    }

    #[test]
    fn malformed_hex_is_bad_sig_not_error() {
        let mut signed = sign(&sample("abc123"), &keypair()).unwrap();
        signed.sig = Some("not-hex!!".into());
        let outcome = verify(&signed).unwrap();
        assert!(!outcome.is_ok());
    }
}
