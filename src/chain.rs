//! SPL-token escrow chain interface (spec §6, consumed).
//!
//! The settlement core never holds chain keys or submits signed
//! transactions directly: it builds unsigned transaction intents and
//! hands them to the chain client, which is responsible for signing
//! (with whatever signer it's configured with), submission, and
//! confirmation. `simulate` lets callers dry-run a transaction before
//! spending an action budget slot on it.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct EscrowInitParams {
    pub trade_id: String,
    pub mint: String,
    pub amount: String,
    pub beneficiary: String,
    pub depositor: String,
    /// Hex-encoded SHA-256 hashlock, matching the Lightning payment hash.
    pub hashlock: String,
    pub refund_after_unix: i64,
    pub trade_fee_collector: String,
}

#[derive(Debug, Clone)]
pub struct ClaimParams {
    pub trade_id: String,
    pub escrow_account: String,
    /// Hex-encoded preimage revealed by the Lightning payment.
    pub preimage: String,
    pub trade_fee_collector: String,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub trade_id: String,
    pub escrow_account: String,
}

/// An unsigned (or chain-client-signed) transaction intent, opaque to the
/// settlement core beyond its id for correlation/idempotency.
#[derive(Debug, Clone)]
pub struct ChainTx {
    pub intent_id: String,
}

#[derive(Debug, Clone)]
pub struct SimulateResult {
    pub would_succeed: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowStatus {
    Uninitialized,
    Funded,
    Claimed,
    Refunded,
}

#[derive(Debug, Clone)]
pub struct EscrowState {
    pub status: EscrowStatus,
    pub amount: String,
    pub refund_after_unix: i64,
}

/// The on-chain escrow operations the settlement core consumes (spec §6).
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Hex-encoded 32-byte signer public key for this side of the swap.
    async fn signer_pubkey(&self) -> Result<String>;

    async fn build_escrow_init_tx(&self, params: &EscrowInitParams) -> Result<ChainTx>;
    async fn build_claim_tx(&self, params: &ClaimParams) -> Result<ChainTx>;
    async fn build_refund_tx(&self, params: &RefundParams) -> Result<ChainTx>;

    async fn simulate(&self, tx: &ChainTx) -> Result<SimulateResult>;
    async fn send_and_confirm(&self, tx: &ChainTx) -> Result<String>;

    async fn read_escrow_state(&self, escrow_account: &str) -> Result<Option<EscrowState>>;
}

#[cfg(any(test, feature = "testing"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    enum PendingTx {
        Init(EscrowInitParams),
        Claim(ClaimParams),
        Refund(RefundParams),
    }

    /// Deterministic in-memory chain: escrow accounts are keyed by
    /// `trade_id`, and claims are only honored when the supplied preimage's
    /// SHA-256 matches the hashlock recorded at init time.
    ///
    /// `pending`/`escrows`/`next_tx` are `Arc`-shared so [`FakeChain::fork`]
    /// can hand a second signer (e.g. a taker driver in the same test) a
    /// distinct `signer_pubkey()` identity while still reading and writing
    /// the same ledger, the way two peers submit transactions to one chain.
    pub struct FakeChain {
        pubkey: String,
        pending: Arc<Mutex<HashMap<String, PendingTx>>>,
        escrows: Arc<Mutex<HashMap<String, (EscrowState, String)>>>, // account -> (state, hashlock)
        next_tx: Arc<Mutex<u64>>,
        pub fail_simulate: Mutex<bool>,
    }

    impl FakeChain {
        pub fn new(pubkey: impl Into<String>) -> Self {
            Self {
                pubkey: pubkey.into(),
                pending: Arc::new(Mutex::new(HashMap::new())),
                escrows: Arc::new(Mutex::new(HashMap::new())),
                next_tx: Arc::new(Mutex::new(1)),
                fail_simulate: Mutex::new(false),
            }
        }

        /// A second `FakeChain` handle for a different signer, sharing this
        /// one's ledger.
        pub fn fork(&self, pubkey: impl Into<String>) -> Self {
            Self {
                pubkey: pubkey.into(),
                pending: self.pending.clone(),
                escrows: self.escrows.clone(),
                next_tx: self.next_tx.clone(),
                fail_simulate: Mutex::new(false),
            }
        }

        fn mint_tx(&self, pending: PendingTx) -> ChainTx {
            let mut n = self.next_tx.lock().unwrap();
            let intent_id = format!("tx-{n}");
            *n += 1;
            self.pending.lock().unwrap().insert(intent_id.clone(), pending);
            ChainTx { intent_id }
        }
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn signer_pubkey(&self) -> Result<String> {
            Ok(self.pubkey.clone())
        }

        async fn build_escrow_init_tx(&self, params: &EscrowInitParams) -> Result<ChainTx> {
            Ok(self.mint_tx(PendingTx::Init(params.clone())))
        }

        async fn build_claim_tx(&self, params: &ClaimParams) -> Result<ChainTx> {
            Ok(self.mint_tx(PendingTx::Claim(params.clone())))
        }

        async fn build_refund_tx(&self, params: &RefundParams) -> Result<ChainTx> {
            Ok(self.mint_tx(PendingTx::Refund(params.clone())))
        }

        async fn simulate(&self, tx: &ChainTx) -> Result<SimulateResult> {
            if *self.fail_simulate.lock().unwrap() {
                return Ok(SimulateResult {
                    would_succeed: false,
                    error: Some("simulated failure".to_string()),
                });
            }
            let pending = self.pending.lock().unwrap();
            Ok(SimulateResult {
                would_succeed: pending.contains_key(&tx.intent_id),
                error: None,
            })
        }

        async fn send_and_confirm(&self, tx: &ChainTx) -> Result<String> {
            let pending = self
                .pending
                .lock()
                .unwrap()
                .remove(&tx.intent_id)
                .ok_or_else(|| crate::error::Error::Validation("unknown tx intent".to_string()))?;

            match pending {
                PendingTx::Init(params) => {
                    let account = format!("escrow-{}", params.trade_id);
                    self.escrows.lock().unwrap().insert(
                        account.clone(),
                        (
                            EscrowState {
                                status: EscrowStatus::Funded,
                                amount: params.amount.clone(),
                                refund_after_unix: params.refund_after_unix,
                            },
                            params.hashlock.clone(),
                        ),
                    );
                    Ok(account)
                }
                PendingTx::Claim(params) => {
                    let mut escrows = self.escrows.lock().unwrap();
                    let (state, hashlock) = escrows
                        .get_mut(&params.escrow_account)
                        .ok_or_else(|| crate::error::Error::Validation("unknown escrow".to_string()))?;

                    let preimage_bytes = hex::decode(&params.preimage)
                        .map_err(|e| crate::error::Error::Validation(e.to_string()))?;
                    let digest = hex::encode(sha2::Sha256::digest(&preimage_bytes));
                    if &digest != hashlock {
                        return Err(crate::error::Error::Validation(
                            "preimage does not match hashlock".to_string(),
                        ));
                    }
                    if state.status != EscrowStatus::Funded {
                        return Err(crate::error::Error::Validation(
                            "escrow not in funded state".to_string(),
                        ));
                    }
                    state.status = EscrowStatus::Claimed;
                    Ok(format!("claim-sig-{}", params.trade_id))
                }
                PendingTx::Refund(params) => {
                    let mut escrows = self.escrows.lock().unwrap();
                    let (state, _) = escrows
                        .get_mut(&params.escrow_account)
                        .ok_or_else(|| crate::error::Error::Validation("unknown escrow".to_string()))?;
                    if state.status != EscrowStatus::Funded {
                        return Err(crate::error::Error::Validation(
                            "escrow not in funded state".to_string(),
                        ));
                    }
                    state.status = EscrowStatus::Refunded;
                    Ok(format!("refund-sig-{}", params.trade_id))
                }
            }
        }

        async fn read_escrow_state(&self, escrow_account: &str) -> Result<Option<EscrowState>> {
            Ok(self
                .escrows
                .lock()
                .unwrap()
                .get(escrow_account)
                .map(|(state, _)| state.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeChain;
    use super::*;
    use sha2::Digest;

    fn hashlock_for(preimage: &[u8]) -> String {
        hex::encode(sha2::Sha256::digest(preimage))
    }

    #[tokio::test]
    async fn init_then_claim_with_correct_preimage_succeeds() {
        let chain = FakeChain::new("pk");
        let preimage = vec![7u8; 32];
        let hashlock = hashlock_for(&preimage);

        let init = chain
            .build_escrow_init_tx(&EscrowInitParams {
                trade_id: "t1".into(),
                mint: "mint".into(),
                amount: "100".into(),
                beneficiary: "bob".into(),
                depositor: "alice".into(),
                hashlock: hashlock.clone(),
                refund_after_unix: 1000,
                trade_fee_collector: "fee-collector".into(),
            })
            .await
            .unwrap();
        let account = chain.send_and_confirm(&init).await.unwrap();

        let claim = chain
            .build_claim_tx(&ClaimParams {
                trade_id: "t1".into(),
                escrow_account: account.clone(),
                preimage: hex::encode(preimage),
                trade_fee_collector: "fee-collector".into(),
            })
            .await
            .unwrap();
        chain.send_and_confirm(&claim).await.unwrap();

        let state = chain.read_escrow_state(&account).await.unwrap().unwrap();
        assert_eq!(state.status, EscrowStatus::Claimed);
    }

    #[tokio::test]
    async fn claim_with_wrong_preimage_fails() {
        let chain = FakeChain::new("pk");
        let hashlock = hashlock_for(&[7u8; 32]);

        let init = chain
            .build_escrow_init_tx(&EscrowInitParams {
                trade_id: "t2".into(),
                mint: "mint".into(),
                amount: "100".into(),
                beneficiary: "bob".into(),
                depositor: "alice".into(),
                hashlock,
                refund_after_unix: 1000,
                trade_fee_collector: "fee-collector".into(),
            })
            .await
            .unwrap();
        let account = chain.send_and_confirm(&init).await.unwrap();

        let claim = chain
            .build_claim_tx(&ClaimParams {
                trade_id: "t2".into(),
                escrow_account: account,
                preimage: hex::encode([9u8; 32]),
                trade_fee_collector: "fee-collector".into(),
            })
            .await
            .unwrap();

        assert!(chain.send_and_confirm(&claim).await.is_err());
    }
}
