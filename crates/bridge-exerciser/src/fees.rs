//! Fixed per-transaction fee schedule.

use crate::types::{Amount, Denom, TransferKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fees charged to the sender of every destination-chain transaction.
///
/// Values are `u64` so the schedule round-trips through TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    /// Charged on every transaction, e.g. the gas fee in the native token.
    #[serde(default)]
    pub per_tx: BTreeMap<Denom, u64>,
    /// Charged additionally on burns, paid in the wrapped asset.
    #[serde(default)]
    pub cross_chain: BTreeMap<Denom, u64>,
}

impl FeeSchedule {
    /// Total fee per transaction of `kind`, by denom.
    pub fn fees_for(&self, kind: TransferKind) -> BTreeMap<Denom, Amount> {
        let mut fees: BTreeMap<Denom, Amount> = self
            .per_tx
            .iter()
            .map(|(denom, fee)| (denom.clone(), Amount::from(*fee)))
            .collect();

        if kind == TransferKind::Burn {
            for (denom, fee) in &self.cross_chain {
                *fees.entry(denom.clone()).or_default() += Amount::from(*fee);
            }
        }

        fees.retain(|_, fee| *fee > 0);
        fees
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn schedule() -> FeeSchedule {
        FeeSchedule {
            per_tx: BTreeMap::from([(Denom::from("rowan"), 1_000_000)]),
            cross_chain: BTreeMap::from([(Denom::from("ceth"), 1)]),
        }
    }

    #[test_case(TransferKind::Burn, &[("ceth", 1), ("rowan", 1_000_000)] ; "burn pays cross chain fee")]
    #[test_case(TransferKind::Send, &[("rowan", 1_000_000)] ; "send pays gas only")]
    fn test_fees_for(kind: TransferKind, expected: &[(&str, Amount)]) {
        let expected: BTreeMap<Denom, Amount> =
            expected.iter().map(|(d, a)| (Denom::from(*d), *a)).collect();
        assert_eq!(schedule().fees_for(kind), expected);
    }

    #[test]
    fn test_zero_fees_are_dropped() {
        let fees = FeeSchedule {
            per_tx: BTreeMap::from([(Denom::from("rowan"), 0)]),
            cross_chain: BTreeMap::new(),
        };
        assert!(fees.fees_for(TransferKind::Burn).is_empty());
    }
}
