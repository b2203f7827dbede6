//! In-memory two-chain ledger.
//!
//! The destination side keeps Cosmos-style accounts: an account number assigned
//! on creation and a sequence that increases by one per committed transaction.
//! Transactions are admitted only with the exact next sequence. Burns settle to
//! the source chain, and locks to the destination chain, after a configurable
//! delay. Settlement is applied lazily whenever the ledger is touched.

use super::{keyring::address_for, wire};
use crate::{
    chain::{
        BalanceQuery, BroadcastOutcome, ChainError, DestinationChain, Faucet, LockReceipt,
        Rejection, SourceChain,
    },
    config::{BridgedAsset, ExerciserConfig},
    fees::FeeSchedule,
    types::{
        AccountInfo, Address, Amount, ChainSide, Denom, SignContext, SignedTx, TransferKind,
        TxHash, UnsignedTransfer,
    },
};
use async_trait::async_trait;
use k256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, trace};

const CODE_TX_DECODE: u32 = 2;
const CODE_UNAUTHORIZED: u32 = 4;
const CODE_UNKNOWN_ADDRESS: u32 = 9;

#[derive(Debug, Default)]
struct DestinationAccount {
    account_number: u64,
    sequence: u64,
    balances: BTreeMap<Denom, Amount>,
}

#[derive(Debug)]
struct Settlement {
    side: ChainSide,
    account: Address,
    denom: Denom,
    amount: Amount,
    due: Instant,
    /// Locks are relayed only after the source chain advances.
    needs_advance: bool,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_account_number: u64,
    accounts: HashMap<Address, DestinationAccount>,
    source_balances: HashMap<Address, BTreeMap<Denom, Amount>>,
    pending: Vec<Settlement>,
}

impl LedgerState {
    fn credit(&mut self, side: ChainSide, account: &Address, denom: &Denom, amount: Amount) {
        let balances = match side {
            ChainSide::Source => self.source_balances.entry(account.clone()).or_default(),
            ChainSide::Destination => &mut self.destination_account(account).balances,
        };
        *balances.entry(denom.clone()).or_default() += amount;
    }

    fn destination_account(&mut self, address: &Address) -> &mut DestinationAccount {
        let next = &mut self.next_account_number;
        self.accounts.entry(address.clone()).or_insert_with(|| {
            let account = DestinationAccount {
                account_number: *next,
                ..Default::default()
            };
            *next += 1;
            account
        })
    }

    fn balance(&self, side: ChainSide, account: &Address, denom: &Denom) -> Amount {
        let balances = match side {
            ChainSide::Source => self.source_balances.get(account),
            ChainSide::Destination => self.accounts.get(account).map(|a| &a.balances),
        };
        balances
            .and_then(|b| b.get(denom))
            .copied()
            .unwrap_or_default()
    }
}

/// Fault injection for exercising the reconciliation failure paths.
#[derive(Debug, Default)]
pub struct Faults {
    double_settlement: AtomicBool,
    stall_settlement: AtomicBool,
    failing_queries: AtomicU32,
}

impl Faults {
    /// Every settlement credits twice its amount.
    pub fn set_double_settlement(&self, enabled: bool) {
        self.double_settlement.store(enabled, Ordering::SeqCst);
    }

    /// Settlements are never applied.
    pub fn set_stall_settlement(&self, enabled: bool) {
        self.stall_settlement.store(enabled, Ordering::SeqCst);
    }

    /// The next `count` account and balance queries fail with a transport error.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    fn take_query_failure(&self) -> Result<(), ChainError> {
        let failed = self
            .failing_queries
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            Err(ChainError::Transport("injected query failure".into()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
struct Shared {
    chain_id: String,
    address_prefix: String,
    fee_denom: Denom,
    fees: FeeSchedule,
    bridged_assets: Vec<BridgedAsset>,
    settlement_delay: Duration,
    faults: Faults,
    state: Mutex<LedgerState>,
}

impl Shared {
    fn settle(&self, state: &mut LedgerState) {
        if self.faults.stall_settlement.load(Ordering::SeqCst) {
            return;
        }
        let multiplier = if self.faults.double_settlement.load(Ordering::SeqCst) {
            2
        } else {
            1
        };

        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
            .into_iter()
            .partition(|s| !s.needs_advance && s.due <= now);
        state.pending = waiting;

        for settlement in due {
            trace!(
                side = %settlement.side,
                account = %settlement.account,
                denom = %settlement.denom,
                amount = %settlement.amount,
                "Applying settlement"
            );
            state.credit(
                settlement.side,
                &settlement.account,
                &settlement.denom,
                settlement.amount * multiplier,
            );
        }
    }

    fn native_for(&self, wrapped: &Denom) -> Option<&Denom> {
        self.bridged_assets
            .iter()
            .find(|a| &a.wrapped == wrapped)
            .map(|a| &a.native)
    }

    fn wrapped_for(&self, native: &Denom) -> Option<&Denom> {
        self.bridged_assets
            .iter()
            .find(|a| &a.native == native)
            .map(|a| &a.wrapped)
    }

    fn is_destination_denom(&self, denom: &Denom) -> bool {
        denom == &self.fee_denom || self.native_for(denom).is_some()
    }

    fn balance(
        &self,
        side: ChainSide,
        account: &Address,
        denom: &Denom,
    ) -> Result<Amount, ChainError> {
        self.faults.take_query_failure()?;
        let mut state = self.state.lock();
        self.settle(&mut state);
        Ok(state.balance(side, account, denom))
    }

    fn verify(&self, tx: &SignedTx) -> Result<(), Rejection> {
        let unauthorized = |log: &str| Rejection::Other {
            code: CODE_UNAUTHORIZED,
            log: log.to_string(),
        };

        if address_for(&self.address_prefix, &tx.signature.public_key) != tx.unsigned.from {
            return Err(unauthorized("public key does not match signer address"));
        }
        let key = VerifyingKey::from_sec1_bytes(&tx.signature.public_key)
            .map_err(|_| unauthorized("invalid public key"))?;
        let signature = Signature::from_slice(&tx.signature.signature)
            .map_err(|_| unauthorized("invalid signature encoding"))?;
        let sign_bytes = wire::sign_bytes(&tx.unsigned, &tx.context)
            .map_err(|e| unauthorized(&e.to_string()))?;
        key.verify(&sign_bytes, &signature)
            .map_err(|_| unauthorized("signature verification failed"))
    }

    /// Validates and commits a decoded transaction.
    fn deliver(&self, tx: SignedTx) -> Result<(), Rejection> {
        if tx.context.chain_id != self.chain_id {
            return Err(Rejection::Other {
                code: CODE_UNAUTHORIZED,
                log: format!("chain id {} does not match {}", tx.context.chain_id, self.chain_id),
            });
        }

        let mut state = self.state.lock();
        self.settle(&mut state);

        let from = tx.unsigned.from.clone();
        let Some(account) = state.accounts.get(&from) else {
            return Err(Rejection::Other {
                code: CODE_UNKNOWN_ADDRESS,
                log: format!("account {from} does not exist"),
            });
        };

        if account.sequence != tx.context.sequence {
            return Err(Rejection::SequenceMismatch {
                expected: account.sequence,
                got: tx.context.sequence,
            });
        }
        if account.account_number != tx.context.account_number {
            return Err(Rejection::Other {
                code: CODE_UNAUTHORIZED,
                log: format!(
                    "account number {} does not match {}",
                    tx.context.account_number, account.account_number
                ),
            });
        }
        self.verify(&tx)?;

        let mut charges: BTreeMap<Denom, Amount> = self.fees.fees_for(tx.unsigned.kind);
        *charges.entry(tx.unsigned.denom.clone()).or_default() += tx.unsigned.amount;
        for (denom, needed) in &charges {
            let available = account.balances.get(denom).copied().unwrap_or_default();
            if available < *needed {
                return Err(Rejection::InsufficientFunds {
                    denom: denom.clone(),
                    needed: *needed,
                    available,
                });
            }
        }

        let account = state.destination_account(&from);
        account.sequence += 1;
        for (denom, charge) in &charges {
            if let Some(balance) = account.balances.get_mut(denom) {
                *balance -= charge;
            }
        }

        let UnsignedTransfer {
            kind,
            to,
            amount,
            denom,
            ..
        } = tx.unsigned;
        match kind {
            TransferKind::Send => state.credit(ChainSide::Destination, &to, &denom, amount),
            TransferKind::Burn => {
                let native = self.native_for(&denom).cloned().unwrap_or(denom);
                state.pending.push(Settlement {
                    side: ChainSide::Source,
                    account: to,
                    denom: native,
                    amount,
                    due: Instant::now() + self.settlement_delay,
                    needs_advance: false,
                });
            }
        }
        Ok(())
    }
}

/// Both chains of a local bridge, sharing one state.
#[derive(Debug, Clone)]
pub struct LocalLedger {
    shared: Arc<Shared>,
}

impl LocalLedger {
    pub fn new(config: &ExerciserConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain_id: config.destination.chain_id.clone(),
                address_prefix: config.destination.address_prefix.clone(),
                fee_denom: config.destination.fee_denom.clone(),
                fees: config.fees.clone(),
                bridged_assets: config.bridged_assets.clone(),
                settlement_delay: Duration::from_millis(config.devnet.settlement_delay_ms),
                faults: Faults::default(),
                state: Mutex::new(LedgerState::default()),
            }),
        }
    }

    /// View implementing [`SourceChain`].
    pub fn source(&self) -> SourceLedger {
        SourceLedger {
            shared: Arc::clone(&self.shared),
        }
    }

    /// View implementing [`DestinationChain`].
    pub fn destination(&self) -> DestinationLedger {
        DestinationLedger {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn faults(&self) -> &Faults {
        &self.shared.faults
    }

    /// Settlements not yet applied.
    pub fn pending_settlements(&self) -> usize {
        let mut state = self.shared.state.lock();
        self.shared.settle(&mut state);
        state.pending.len()
    }
}

#[async_trait]
impl Faucet for LocalLedger {
    async fn fund(
        &self,
        side: ChainSide,
        address: &Address,
        amounts: &[(Denom, Amount)],
    ) -> Result<(), ChainError> {
        let mut state = self.shared.state.lock();
        if side == ChainSide::Destination {
            state.destination_account(address);
        }
        for (denom, amount) in amounts {
            state.credit(side, address, denom, *amount);
        }
        debug!(%side, %address, ?amounts, "Funded account");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SourceLedger {
    shared: Arc<Shared>,
}

#[async_trait]
impl BalanceQuery for SourceLedger {
    async fn get_balance(&self, account: &Address, denom: &Denom) -> Result<Amount, ChainError> {
        self.shared.balance(ChainSide::Source, account, denom)
    }
}

#[async_trait]
impl SourceChain for SourceLedger {
    async fn lock(
        &self,
        from: &Address,
        to: &Address,
        amount: Amount,
        denom: &Denom,
    ) -> Result<LockReceipt, ChainError> {
        let wrapped = self
            .shared
            .wrapped_for(denom)
            .cloned()
            .ok_or_else(|| ChainError::UnknownDenom(denom.clone()))?;

        let mut state = self.shared.state.lock();
        self.shared.settle(&mut state);

        let balance = state
            .source_balances
            .get_mut(from)
            .and_then(|b| b.get_mut(denom))
            .filter(|b| **b >= amount)
            .ok_or_else(|| ChainError::Other(format!("insufficient {denom} to lock from {from}")))?;
        *balance -= amount;

        state.pending.push(Settlement {
            side: ChainSide::Destination,
            account: to.clone(),
            denom: wrapped,
            amount,
            due: Instant::now() + self.shared.settlement_delay,
            needs_advance: true,
        });

        let nonce = state.pending.len();
        let tx_hash = TxHash::of(format!("lock:{from}:{to}:{amount}:{denom}:{nonce}").as_bytes());
        debug!(%from, %to, %amount, %denom, %tx_hash, "Locked on source chain");

        Ok(LockReceipt {
            tx_hash,
            from: from.clone(),
            to: to.clone(),
            amount,
            denom: denom.clone(),
        })
    }

    async fn advance_time_or_blocks(&self) -> Result<(), ChainError> {
        let mut state = self.shared.state.lock();
        for settlement in &mut state.pending {
            settlement.needs_advance = false;
        }
        self.shared.settle(&mut state);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DestinationLedger {
    shared: Arc<Shared>,
}

#[async_trait]
impl BalanceQuery for DestinationLedger {
    async fn get_balance(&self, account: &Address, denom: &Denom) -> Result<Amount, ChainError> {
        self.shared.balance(ChainSide::Destination, account, denom)
    }
}

#[async_trait]
impl DestinationChain for DestinationLedger {
    fn chain_id(&self) -> &str {
        &self.shared.chain_id
    }

    async fn query_account(&self, address: &Address) -> Result<AccountInfo, ChainError> {
        self.shared.faults.take_query_failure()?;
        let state = self.shared.state.lock();
        state
            .accounts
            .get(address)
            .map(|account| AccountInfo {
                address: address.clone(),
                sequence: account.sequence,
                account_number: account.account_number,
            })
            .ok_or_else(|| ChainError::UnknownAccount(address.clone()))
    }

    fn build_transfer(
        &self,
        kind: TransferKind,
        from: &Address,
        to: &Address,
        amount: Amount,
        denom: &Denom,
    ) -> Result<UnsignedTransfer, ChainError> {
        let known = match kind {
            TransferKind::Send => self.shared.is_destination_denom(denom),
            TransferKind::Burn => self.shared.native_for(denom).is_some(),
        };
        if !known {
            return Err(ChainError::UnknownDenom(denom.clone()));
        }
        Ok(UnsignedTransfer {
            kind,
            from: from.clone(),
            to: to.clone(),
            amount,
            denom: denom.clone(),
        })
    }

    fn sign_bytes(
        &self,
        unsigned: &UnsignedTransfer,
        context: &SignContext,
    ) -> Result<Vec<u8>, ChainError> {
        wire::sign_bytes(unsigned, context)
    }

    fn encode(&self, tx: &SignedTx) -> Result<Vec<u8>, ChainError> {
        wire::encode(tx)
    }

    async fn broadcast(&self, tx_bytes: &[u8]) -> Result<BroadcastOutcome, ChainError> {
        let tx = match wire::decode(tx_bytes) {
            Ok(tx) => tx,
            Err(e) => {
                return Ok(BroadcastOutcome::Rejected(Rejection::Other {
                    code: CODE_TX_DECODE,
                    log: e.to_string(),
                }));
            }
        };

        let (from, sequence) = (tx.unsigned.from.clone(), tx.context.sequence);
        match self.shared.deliver(tx) {
            Ok(()) => {
                let tx_hash = TxHash::of(tx_bytes);
                trace!(%from, sequence, %tx_hash, "Committed transaction");
                Ok(BroadcastOutcome::Accepted { tx_hash })
            }
            Err(rejection) => {
                trace!(%from, sequence, %rejection, "Rejected transaction");
                Ok(BroadcastOutcome::Rejected(rejection))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{chain::TransferSigner, devnet::Keyring, types::TransferSignature};

    struct Setup {
        ledger: LocalLedger,
        keyring: Keyring,
        sender: Address,
        receiver: Address,
    }

    async fn setup() -> Setup {
        let config = ExerciserConfig::default_test_config();
        let ledger = LocalLedger::new(&config);
        let keyring = Keyring::new("dst1");
        let sender = keyring.derive("sender");
        let receiver = Address::from("0xreceiver");
        ledger
            .fund(
                ChainSide::Destination,
                &sender,
                &[(Denom::from("ceth"), 1_000), (Denom::from("rowan"), 10_000_000)],
            )
            .await
            .unwrap();
        Setup {
            ledger,
            keyring,
            sender,
            receiver,
        }
    }

    async fn signed(setup: &Setup, sequence: u64, amount: Amount) -> Vec<u8> {
        let chain = setup.ledger.destination();
        let info = chain.query_account(&setup.sender).await.unwrap();
        let unsigned = chain
            .build_transfer(
                TransferKind::Burn,
                &setup.sender,
                &setup.receiver,
                amount,
                &Denom::from("ceth"),
            )
            .unwrap();
        let context = SignContext {
            chain_id: chain.chain_id().to_string(),
            account_number: info.account_number,
            sequence,
        };
        let bytes = chain.sign_bytes(&unsigned, &context).unwrap();
        let signature = setup.keyring.sign(&setup.sender, &bytes).await.unwrap();
        chain
            .encode(&SignedTx {
                unsigned,
                context,
                signature,
            })
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_burn_charges_fees_and_settles_after_delay() {
        let setup = setup().await;
        let chain = setup.ledger.destination();
        let tx = signed(&setup, 0, 100).await;

        let outcome = chain.broadcast(&tx).await.unwrap();
        assert!(matches!(outcome, BroadcastOutcome::Accepted { .. }));

        let ceth = chain.get_balance(&setup.sender, &Denom::from("ceth")).await.unwrap();
        let rowan = chain.get_balance(&setup.sender, &Denom::from("rowan")).await.unwrap();
        assert_eq!(ceth, 1_000 - 101);
        assert_eq!(rowan, 10_000_000 - 1_000_000);
        assert_eq!(chain.query_account(&setup.sender).await.unwrap().sequence, 1);

        let source = setup.ledger.source();
        let eth = Denom::from("eth");
        assert_eq!(source.get_balance(&setup.receiver, &eth).await.unwrap(), 0);

        tokio::time::advance(Duration::from_millis(2_001)).await;
        assert_eq!(source.get_balance(&setup.receiver, &eth).await.unwrap(), 100);
        assert_eq!(setup.ledger.pending_settlements(), 0);
    }

    #[tokio::test]
    async fn test_out_of_order_sequence_is_rejected_with_expected() {
        let setup = setup().await;
        let chain = setup.ledger.destination();
        let tx = signed(&setup, 2, 100).await;

        let outcome = chain.broadcast(&tx).await.unwrap();
        assert_eq!(
            outcome,
            BroadcastOutcome::Rejected(Rejection::SequenceMismatch {
                expected: 0,
                got: 2
            })
        );
        assert_eq!(chain.query_account(&setup.sender).await.unwrap().sequence, 0);
    }

    #[tokio::test]
    async fn test_tampered_signature_is_rejected() {
        let setup = setup().await;
        let chain = setup.ledger.destination();
        let mut tx = wire::decode(&signed(&setup, 0, 100).await).unwrap();
        tx.unsigned.amount = 999;
        let tampered = chain.encode(&tx).unwrap();

        let outcome = chain.broadcast(&tampered).await.unwrap();
        assert!(matches!(
            outcome,
            BroadcastOutcome::Rejected(Rejection::Other { code: CODE_UNAUTHORIZED, .. })
        ));
    }

    #[tokio::test]
    async fn test_foreign_key_is_rejected() {
        let setup = setup().await;
        let chain = setup.ledger.destination();
        let mut tx = wire::decode(&signed(&setup, 0, 100).await).unwrap();
        let other = Keyring::new("dst1");
        let impostor = other.derive("impostor");
        let TransferSignature { public_key, .. } = other.sign(&impostor, b"x").await.unwrap();
        tx.signature.public_key = public_key;

        let outcome = chain.broadcast(&chain.encode(&tx).unwrap()).await.unwrap();
        assert!(matches!(outcome, BroadcastOutcome::Rejected(Rejection::Other { .. })));
    }

    #[tokio::test]
    async fn test_insufficient_funds() {
        let setup = setup().await;
        let chain = setup.ledger.destination();
        let tx = signed(&setup, 0, 1_000).await;

        let outcome = chain.broadcast(&tx).await.unwrap();
        assert!(matches!(
            outcome,
            BroadcastOutcome::Rejected(Rejection::InsufficientFunds { needed: 1_001, .. })
        ));
    }

    #[tokio::test]
    async fn test_garbage_bytes_are_rejected() {
        let setup = setup().await;
        let outcome = setup.ledger.destination().broadcast(b"not a tx").await.unwrap();
        assert!(matches!(
            outcome,
            BroadcastOutcome::Rejected(Rejection::Other { code: CODE_TX_DECODE, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_waits_for_advance() {
        let setup = setup().await;
        let eth_account = Address::from("0xlocker");
        setup
            .ledger
            .fund(ChainSide::Source, &eth_account, &[(Denom::from("eth"), 500)])
            .await
            .unwrap();

        let source = setup.ledger.source();
        source
            .lock(&eth_account, &setup.sender, 200, &Denom::from("eth"))
            .await
            .unwrap();
        assert_eq!(source.get_balance(&eth_account, &Denom::from("eth")).await.unwrap(), 300);

        tokio::time::advance(Duration::from_secs(10)).await;
        let chain = setup.ledger.destination();
        assert_eq!(chain.get_balance(&setup.sender, &Denom::from("ceth")).await.unwrap(), 1_000);

        source.advance_time_or_blocks().await.unwrap();
        assert_eq!(chain.get_balance(&setup.sender, &Denom::from("ceth")).await.unwrap(), 1_200);
    }

    #[tokio::test]
    async fn test_lock_unknown_denom() {
        let setup = setup().await;
        let err = setup
            .ledger
            .source()
            .lock(&Address::from("0xa"), &setup.sender, 1, &Denom::from("btc"))
            .await
            .unwrap_err();
        assert_eq!(err, ChainError::UnknownDenom(Denom::from("btc")));
    }

    #[tokio::test]
    async fn test_injected_query_failures_are_transient() {
        let setup = setup().await;
        setup.ledger.faults().fail_next_queries(1);
        let chain = setup.ledger.destination();

        let err = chain.query_account(&setup.sender).await.unwrap_err();
        assert!(err.is_transient());
        assert!(chain.query_account(&setup.sender).await.is_ok());
    }
}
