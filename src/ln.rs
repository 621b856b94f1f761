//! Lightning node interface (spec §6, consumed).
//!
//! Invoice creation, payment, and decoding only — channel management,
//! routing, and on-chain Lightning funding sit behind the node and are
//! out of scope.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CreateInvoiceResult {
    pub payment_request: String,
    /// Hex-encoded SHA-256 payment hash.
    pub payment_hash: String,
    pub expires_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayOutcome {
    Succeeded,
    Pending,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct PayResult {
    pub outcome: PayOutcome,
    /// Hex-encoded preimage, present only when `outcome == Succeeded`.
    pub preimage: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DecodedInvoice {
    pub payment_hash: String,
    pub amount_msat: Option<u64>,
    pub expires_at: i64,
    pub description: Option<String>,
}

/// The Lightning operations the settlement core consumes (spec §6).
#[async_trait]
pub trait LnClient: Send + Sync {
    async fn create_invoice(
        &self,
        amount_msat: u64,
        description: &str,
        expiry_sec: i64,
    ) -> Result<CreateInvoiceResult>;

    async fn pay(&self, payment_request: &str) -> Result<PayResult>;

    async fn decode(&self, payment_request: &str) -> Result<DecodedInvoice>;
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use sha2::{Digest, Sha256};

    /// Deterministic fake LN node. `create_invoice` derives a payment hash
    /// from a caller-supplied preimage so tests can script the exact
    /// preimage that later flows through `pay`.
    pub struct FakeLn {
        next_preimage: Mutex<u64>,
        invoices: Mutex<HashMap<String, (String, u64, i64)>>, // payment_request -> (hash, amount_msat, expires_at)
        preimages: Mutex<HashMap<String, String>>,            // payment_hash -> preimage (hex)
        pub fail_next_pay: Mutex<Option<String>>,
    }

    impl FakeLn {
        pub fn new() -> Self {
            Self {
                next_preimage: Mutex::new(1),
                invoices: Mutex::new(HashMap::new()),
                preimages: Mutex::new(HashMap::new()),
                fail_next_pay: Mutex::new(None),
            }
        }

        fn mint_preimage(&self) -> Vec<u8> {
            let mut n = self.next_preimage.lock().unwrap();
            let mut bytes = vec![0u8; 32];
            bytes[24..].copy_from_slice(&n.to_be_bytes());
            *n += 1;
            bytes
        }
    }

    impl Default for FakeLn {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl LnClient for FakeLn {
        async fn create_invoice(
            &self,
            amount_msat: u64,
            description: &str,
            expiry_sec: i64,
        ) -> Result<CreateInvoiceResult> {
            let preimage = self.mint_preimage();
            let hash = hex::encode(Sha256::digest(&preimage));
            let payment_request = format!("lnfake1{hash}{amount_msat}{description}");
            let expires_at = expiry_sec;

            self.invoices.lock().unwrap().insert(
                payment_request.clone(),
                (hash.clone(), amount_msat, expires_at),
            );
            self.preimages
                .lock()
                .unwrap()
                .insert(hash.clone(), hex::encode(preimage));

            Ok(CreateInvoiceResult {
                payment_request,
                payment_hash: hash,
                expires_at,
            })
        }

        async fn pay(&self, payment_request: &str) -> Result<PayResult> {
            if let Some(reason) = self.fail_next_pay.lock().unwrap().take() {
                return Ok(PayResult {
                    outcome: PayOutcome::Failed { reason },
                    preimage: None,
                });
            }

            let invoices = self.invoices.lock().unwrap();
            let Some((hash, _, _)) = invoices.get(payment_request) else {
                return Ok(PayResult {
                    outcome: PayOutcome::Failed {
                        reason: "unknown invoice".to_string(),
                    },
                    preimage: None,
                });
            };

            let preimage = self.preimages.lock().unwrap().get(hash).cloned();
            Ok(PayResult {
                outcome: PayOutcome::Succeeded,
                preimage,
            })
        }

        async fn decode(&self, payment_request: &str) -> Result<DecodedInvoice> {
            let invoices = self.invoices.lock().unwrap();
            let (hash, amount_msat, expires_at) = invoices
                .get(payment_request)
                .cloned()
                .ok_or_else(|| crate::error::Error::Validation("unknown invoice".to_string()))?;

            Ok(DecodedInvoice {
                payment_hash: hash,
                amount_msat: Some(amount_msat),
                expires_at,
                description: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeLn;
    use super::*;
    use sha2::Digest;

    #[tokio::test]
    async fn invoice_then_pay_reveals_matching_preimage() {
        let ln = FakeLn::new();
        let invoice = ln.create_invoice(1000, "swap", 3600).await.unwrap();

        let decoded = ln.decode(&invoice.payment_request).await.unwrap();
        assert_eq!(decoded.payment_hash, invoice.payment_hash);

        let paid = ln.pay(&invoice.payment_request).await.unwrap();
        assert_eq!(paid.outcome, PayOutcome::Succeeded);

        let preimage = paid.preimage.unwrap();
        let digest = hex::encode(sha2::Sha256::digest(hex::decode(&preimage).unwrap()));
        assert_eq!(digest, invoice.payment_hash);
    }

    #[tokio::test]
    async fn pay_unknown_invoice_fails() {
        let ln = FakeLn::new();
        let result = ln.pay("not-a-real-invoice").await.unwrap();
        assert!(matches!(result.outcome, PayOutcome::Failed { .. }));
    }
}
