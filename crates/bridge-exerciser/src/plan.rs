//! Declarative transfer matrix and the balance changes it predicts.

use crate::{
    config::BridgedAsset,
    error::{Error, Result},
    fees::FeeSchedule,
    types::{
        Address, Amount, ChainSide, Denom, SignedAmount, TransferId, TransferKind, TransferRequest,
    },
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// `counts[i][j]` unit transfers of `amount_per_tx` from `senders[i]` to `receivers[j]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    senders: Vec<Address>,
    receivers: Vec<Address>,
    counts: Vec<Vec<u64>>,
    amount_per_tx: Amount,
    denom: Denom,
    kind: TransferKind,
    sent: Vec<u64>,
    received: Vec<u64>,
    total: u64,
}

/// Predicted net change of one balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpectedDelta {
    pub side: ChainSide,
    pub account: Address,
    pub denom: Denom,
    pub delta: SignedAmount,
    /// False when the balance is both debited and credited by the plan, so
    /// intermediate samples may legitimately move past the final value.
    pub monotonic: bool,
}

impl TransferPlan {
    pub fn new(
        senders: Vec<Address>,
        receivers: Vec<Address>,
        counts: Vec<Vec<u64>>,
        amount_per_tx: Amount,
        denom: Denom,
        kind: TransferKind,
    ) -> Result<Self> {
        if senders.is_empty() || receivers.is_empty() {
            return Err(Error::InvalidPlan(
                "plan needs at least one sender and one receiver".into(),
            ));
        }
        if counts.len() != senders.len() {
            return Err(Error::InvalidPlan(format!(
                "{} count rows for {} senders",
                counts.len(),
                senders.len()
            )));
        }
        let ragged = counts
            .iter()
            .enumerate()
            .find(|(_, row)| row.len() != receivers.len());
        if let Some((i, row)) = ragged {
            return Err(Error::InvalidPlan(format!(
                "row {i} has {} counts for {} receivers",
                row.len(),
                receivers.len()
            )));
        }
        if amount_per_tx == 0 {
            return Err(Error::InvalidPlan("amount per transfer must be positive".into()));
        }
        let mut seen = BTreeSet::new();
        if let Some(duplicate) = senders.iter().find(|s| !seen.insert(*s)) {
            return Err(Error::InvalidPlan(format!("sender {duplicate} listed more than once")));
        }

        let overflow = || Error::InvalidPlan("transfer counts overflow".into());
        let mut sent = vec![0u64; senders.len()];
        let mut received = vec![0u64; receivers.len()];
        let mut total = 0u64;
        for (i, row) in counts.iter().enumerate() {
            for (j, &count) in row.iter().enumerate() {
                sent[i] = sent[i].checked_add(count).ok_or_else(overflow)?;
                received[j] = received[j].checked_add(count).ok_or_else(overflow)?;
                total = total.checked_add(count).ok_or_else(overflow)?;
            }
        }

        Ok(Self {
            senders,
            receivers,
            counts,
            amount_per_tx,
            denom,
            kind,
            sent,
            received,
            total,
        })
    }

    /// Every sender sends `count` transfers to every receiver.
    pub fn uniform(
        senders: Vec<Address>,
        receivers: Vec<Address>,
        count: u64,
        amount_per_tx: Amount,
        denom: Denom,
        kind: TransferKind,
    ) -> Result<Self> {
        let counts = vec![vec![count; receivers.len()]; senders.len()];
        Self::new(senders, receivers, counts, amount_per_tx, denom, kind)
    }

    /// Parses `"100,100,100;10,20,30"`: rows separated by `;`, counts by `,`.
    pub fn parse_matrix(matrix: &str) -> Result<Vec<Vec<u64>>> {
        matrix
            .split(';')
            .map(str::trim)
            .filter(|row| !row.is_empty())
            .map(|row| {
                row.split(',')
                    .map(|count| {
                        count.trim().parse::<u64>().map_err(|e| {
                            Error::InvalidPlan(format!("bad count {count:?} in row {row:?}: {e}"))
                        })
                    })
                    .collect()
            })
            .collect()
    }

    pub fn senders(&self) -> &[Address] {
        &self.senders
    }

    pub fn receivers(&self) -> &[Address] {
        &self.receivers
    }

    pub fn counts(&self) -> &[Vec<u64>] {
        &self.counts
    }

    pub fn amount_per_tx(&self) -> Amount {
        self.amount_per_tx
    }

    pub fn denom(&self) -> &Denom {
        &self.denom
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn sent_by_sender(&self) -> &[u64] {
        &self.sent
    }

    pub fn received_by_receiver(&self) -> &[u64] {
        &self.received
    }

    pub fn total_transfers(&self) -> u64 {
        self.total
    }

    /// Transfers of sender `i` in generation order: receiver by receiver.
    pub fn transfers_for(&self, sender: usize) -> impl Iterator<Item = TransferRequest> + '_ {
        let from = &self.senders[sender];
        self.counts[sender]
            .iter()
            .enumerate()
            .flat_map(move |(receiver, count)| {
                (0..*count).map(move |ordinal| TransferRequest {
                    id: TransferId {
                        sender,
                        receiver,
                        ordinal,
                    },
                    from: from.clone(),
                    to: self.receivers[receiver].clone(),
                    amount: self.amount_per_tx,
                    denom: self.denom.clone(),
                    kind: self.kind,
                })
            })
    }

    /// Side and denom the receivers of this plan are credited in.
    pub fn receiving_leg(&self, assets: &[BridgedAsset]) -> Result<(ChainSide, Denom)> {
        match self.kind {
            TransferKind::Send => Ok((ChainSide::Destination, self.denom.clone())),
            TransferKind::Burn => assets
                .iter()
                .find(|a| a.wrapped == self.denom)
                .map(|a| (ChainSide::Source, a.native.clone()))
                .ok_or_else(|| Error::InvalidPlan(format!("{} is not a bridged asset", self.denom))),
        }
    }

    /// Net balance change of every touched `(side, account, denom)`, fees included.
    pub fn expected_deltas(
        &self,
        fees: &FeeSchedule,
        assets: &[BridgedAsset],
    ) -> Result<Vec<ExpectedDelta>> {
        #[derive(Default)]
        struct Acc {
            delta: SignedAmount,
            debited: bool,
            credited: bool,
        }

        let overflow = || Error::InvalidPlan("expected delta overflows".into());
        let to_signed = |n: u64, per: Amount| -> Result<SignedAmount> {
            Amount::from(n)
                .checked_mul(per)
                .and_then(|v| SignedAmount::try_from(v).ok())
                .ok_or_else(overflow)
        };

        let mut acc: BTreeMap<(ChainSide, Address, Denom), Acc> = BTreeMap::new();
        let per_tx_fees = fees.fees_for(self.kind);

        for (sender, &sent) in self.senders.iter().zip(self.sent_by_sender()) {
            let mut charges = per_tx_fees.clone();
            *charges.entry(self.denom.clone()).or_default() += self.amount_per_tx;
            for (denom, per) in charges {
                let entry = acc.entry((ChainSide::Destination, sender.clone(), denom)).or_default();
                entry.delta = entry.delta.checked_sub(to_signed(sent, per)?).ok_or_else(overflow)?;
                entry.debited |= sent > 0;
            }
        }

        let (side, denom) = self.receiving_leg(assets)?;
        for (receiver, &received) in self.receivers.iter().zip(self.received_by_receiver()) {
            let entry = acc.entry((side, receiver.clone(), denom.clone())).or_default();
            entry.delta = entry
                .delta
                .checked_add(to_signed(received, self.amount_per_tx)?)
                .ok_or_else(overflow)?;
            entry.credited |= received > 0;
        }

        Ok(acc
            .into_iter()
            .map(|((side, account, denom), a)| ExpectedDelta {
                side,
                account,
                denom,
                delta: a.delta,
                monotonic: !(a.debited && a.credited),
            })
            .collect())
    }

    /// Amounts each sender needs before the run: everything it sends plus fees,
    /// scaled up by `headroom_percent`.
    pub fn required_funding(
        &self,
        fees: &FeeSchedule,
        headroom_percent: u64,
    ) -> Vec<(Address, Vec<(Denom, Amount)>)> {
        let per_tx_fees = fees.fees_for(self.kind);
        self.senders
            .iter()
            .zip(self.sent_by_sender())
            .map(|(sender, &sent)| {
                let mut charges = per_tx_fees.clone();
                *charges.entry(self.denom.clone()).or_default() += self.amount_per_tx;
                let amounts = charges
                    .into_iter()
                    .map(|(denom, per)| {
                        let exact = per.saturating_mul(Amount::from(sent));
                        let padded = exact.saturating_mul(Amount::from(100 + headroom_percent)) / 100;
                        (denom, padded)
                    })
                    .collect();
                (sender.clone(), amounts)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn addrs(prefix: &str, n: usize) -> Vec<Address> {
        (0..n).map(|i| Address::new(format!("{prefix}{i}"))).collect()
    }

    fn assets() -> Vec<BridgedAsset> {
        vec![BridgedAsset {
            native: Denom::from("eth"),
            wrapped: Denom::from("ceth"),
        }]
    }

    fn fees() -> FeeSchedule {
        FeeSchedule {
            per_tx: BTreeMap::from([(Denom::from("rowan"), 1_000_000)]),
            cross_chain: BTreeMap::from([(Denom::from("ceth"), 1)]),
        }
    }

    fn delta_of(deltas: &[ExpectedDelta], account: &Address, denom: &str) -> SignedAmount {
        deltas
            .iter()
            .find(|d| &d.account == account && d.denom.as_str() == denom)
            .map(|d| d.delta)
            .unwrap()
    }

    #[test]
    fn test_matrix_scenario_sums() {
        let counts =
            TransferPlan::parse_matrix("100,100,100;100,100,100;100,100,100;10,20,30").unwrap();
        let plan = TransferPlan::new(
            addrs("dst1s", 4),
            addrs("0xr", 3),
            counts,
            1_000,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap();

        assert_eq!(plan.sent_by_sender(), &[300, 300, 300, 60]);
        assert_eq!(plan.received_by_receiver(), &[310, 320, 330]);
        assert_eq!(plan.total_transfers(), 960);
    }

    #[test]
    fn test_single_sender_burn_fees() {
        let amount = 123_456_000_000_000;
        let sender = Address::from("dst1sender");
        let receiver = Address::from("0xreceiver");
        let plan = TransferPlan::uniform(
            vec![sender.clone()],
            vec![receiver.clone()],
            3,
            amount,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap();

        let deltas = plan.expected_deltas(&fees(), &assets()).unwrap();
        assert_eq!(deltas.len(), 3);
        assert_eq!(delta_of(&deltas, &sender, "ceth"), -((amount as i128 + 1) * 3));
        assert_eq!(delta_of(&deltas, &sender, "rowan"), -1_000_000 * 3);
        assert_eq!(delta_of(&deltas, &receiver, "eth"), amount as i128 * 3);

        let receiver_entry = deltas.iter().find(|d| d.account == receiver).unwrap();
        assert_eq!(receiver_entry.side, ChainSide::Source);
        assert!(deltas.iter().all(|d| d.monotonic));
    }

    #[test]
    fn test_send_between_overlapping_accounts_nets_out() {
        let a = Address::from("dst1a");
        let b = Address::from("dst1b");
        let plan = TransferPlan::new(
            vec![a.clone(), b.clone()],
            vec![a.clone(), b.clone()],
            vec![vec![0, 2], vec![1, 0]],
            10,
            Denom::from("ceth"),
            TransferKind::Send,
        )
        .unwrap();

        let deltas = plan.expected_deltas(&fees(), &assets()).unwrap();
        assert_eq!(delta_of(&deltas, &a, "ceth"), -20 + 10);
        assert_eq!(delta_of(&deltas, &b, "ceth"), -10 + 20);
        assert_eq!(delta_of(&deltas, &a, "rowan"), -2_000_000);
        assert!(deltas.iter().filter(|d| d.denom.as_str() == "ceth").all(|d| !d.monotonic));
    }

    #[test]
    fn test_transfers_follow_receiver_order() {
        let plan = TransferPlan::new(
            addrs("dst1s", 1),
            addrs("0xr", 2),
            vec![vec![2, 1]],
            5,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap();

        let ids: Vec<_> = plan.transfers_for(0).map(|t| (t.id.receiver, t.id.ordinal)).collect();
        assert_eq!(ids, vec![(0, 0), (0, 1), (1, 0)]);
    }

    #[test]
    fn test_required_funding_includes_fees_and_headroom() {
        let plan = TransferPlan::uniform(
            addrs("dst1s", 1),
            addrs("0xr", 1),
            3,
            100,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap();

        let funding = plan.required_funding(&fees(), 10);
        assert_eq!(
            funding[0].1,
            vec![(Denom::from("ceth"), 333), (Denom::from("rowan"), 3_300_000)]
        );
    }

    #[test]
    fn test_ragged_matrix_is_rejected() {
        let err = TransferPlan::new(
            addrs("dst1s", 2),
            addrs("0xr", 2),
            vec![vec![1, 2], vec![3]],
            5,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let err = TransferPlan::uniform(
            addrs("dst1s", 1),
            addrs("0xr", 1),
            1,
            0,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
    }

    #[test]
    fn test_duplicate_sender_is_rejected() {
        let sender = Address::from("dst1s");
        let err = TransferPlan::new(
            vec![sender.clone(), sender],
            addrs("0xr", 1),
            vec![vec![2], vec![2]],
            5,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(msg) if msg.contains("more than once")));
    }

    #[test]
    fn test_overflowing_counts_are_rejected() {
        let counts = TransferPlan::parse_matrix("18446744073709551615,1").unwrap();
        let err = TransferPlan::new(
            addrs("dst1s", 1),
            addrs("0xr", 2),
            counts,
            5,
            Denom::from("ceth"),
            TransferKind::Burn,
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(msg) if msg.contains("overflow")));
    }

    #[test]
    fn test_parse_matrix_rejects_garbage() {
        assert!(TransferPlan::parse_matrix("1,2;x,4").is_err());
        assert_eq!(TransferPlan::parse_matrix(" 1, 2 ; 3,4 ").unwrap(), vec![vec![1, 2], vec![3, 4]]);
    }

    #[test]
    fn test_burn_of_unbridged_denom_is_rejected() {
        let plan = TransferPlan::uniform(
            addrs("dst1s", 1),
            addrs("0xr", 1),
            1,
            1,
            Denom::from("rowan"),
            TransferKind::Burn,
        )
        .unwrap();
        assert!(matches!(
            plan.expected_deltas(&fees(), &assets()),
            Err(Error::InvalidPlan(_))
        ));
    }

    proptest! {
        #[test]
        fn proptest_matrix_accounting_law(
            counts in (1usize..6, 1usize..6).prop_flat_map(|(rows, cols)| {
                prop::collection::vec(prop::collection::vec(0u64..500, cols), rows)
            }),
            amount in 1u128..1_000_000,
        ) {
            let rows = counts.len();
            let cols = counts[0].len();
            let plan = TransferPlan::new(
                addrs("dst1s", rows),
                addrs("dst1r", cols),
                counts.clone(),
                amount,
                Denom::from("ceth"),
                TransferKind::Send,
            ).unwrap();

            let sent = plan.sent_by_sender();
            let received = plan.received_by_receiver();
            for (i, row) in counts.iter().enumerate() {
                prop_assert_eq!(row.iter().sum::<u64>(), sent[i]);
            }
            for j in 0..cols {
                prop_assert_eq!(counts.iter().map(|r| r[j]).sum::<u64>(), received[j]);
            }
            prop_assert_eq!(sent.iter().sum::<u64>(), plan.total_transfers());
            prop_assert_eq!(received.iter().sum::<u64>(), plan.total_transfers());

            // Without fees, value is conserved across the destination chain.
            let deltas = plan.expected_deltas(&FeeSchedule::default(), &[]).unwrap();
            prop_assert_eq!(deltas.iter().map(|d| d.delta).sum::<i128>(), 0);
        }
    }
}
