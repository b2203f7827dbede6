//! Client-side sequence tracking.
//!
//! Each sender's sequence is read from the chain once and then advanced in
//! memory, so a whole batch can be signed offline before anything is
//! broadcast. A sequencer is owned by exactly one sender flow.

use crate::{
    chain::{ChainError, DestinationChain},
    error::{Error, Result},
    retry::{RetryPolicy, with_retry},
    types::{Address, TransferId},
};
use std::{collections::HashMap, sync::Arc};
use tracing::debug;

#[derive(Debug)]
struct Cursor {
    account_number: u64,
    start: u64,
    next: u64,
    reservations: HashMap<TransferId, u64>,
}

pub struct AccountSequencer {
    chain: Arc<dyn DestinationChain>,
    require_fresh: bool,
    query_retry: RetryPolicy,
    cursors: HashMap<Address, Cursor>,
}

impl std::fmt::Debug for AccountSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSequencer")
            .field("require_fresh", &self.require_fresh)
            .field("cursors", &self.cursors)
            .finish_non_exhaustive()
    }
}

impl AccountSequencer {
    pub fn new(
        chain: Arc<dyn DestinationChain>,
        require_fresh: bool,
        query_retry: RetryPolicy,
    ) -> Self {
        Self {
            chain,
            require_fresh,
            query_retry,
            cursors: HashMap::new(),
        }
    }

    /// Returns the chain-reported `(sequence, account_number)` of `account`.
    ///
    /// The chain is queried on the first call only; later calls return the
    /// cached starting point.
    pub async fn current(&mut self, account: &Address) -> Result<(u64, u64)> {
        if let Some(cursor) = self.cursors.get(account) {
            return Ok((cursor.start, cursor.account_number));
        }

        let chain = &self.chain;
        let info = with_retry("query_account", &self.query_retry, move || {
            chain.query_account(account)
        })
        .await
        .map_err(|source| Error::AccountQuery {
            address: account.clone(),
            source,
        })?;

        if self.require_fresh && info.sequence != 0 {
            return Err(Error::Precondition {
                address: account.clone(),
                sequence: info.sequence,
            });
        }

        debug!(
            %account,
            sequence = info.sequence,
            account_number = info.account_number,
            "Loaded account"
        );

        self.cursors.insert(
            account.clone(),
            Cursor {
                account_number: info.account_number,
                start: info.sequence,
                next: info.sequence,
                reservations: HashMap::new(),
            },
        );
        Ok((info.sequence, info.account_number))
    }

    /// Issues the next unused sequence for `account`. Never consults the chain.
    pub fn reserve(&mut self, account: &Address) -> Result<u64> {
        let cursor = self.cursor_mut(account)?;
        let sequence = cursor.next;
        cursor.next += 1;
        Ok(sequence)
    }

    /// Like [`Self::reserve`], but returns the same sequence every time it is
    /// called with the same `id`.
    pub fn reserve_for(&mut self, account: &Address, id: TransferId) -> Result<u64> {
        let cursor = self.cursor_mut(account)?;
        if let Some(sequence) = cursor.reservations.get(&id) {
            return Ok(*sequence);
        }
        let sequence = cursor.next;
        cursor.next += 1;
        cursor.reservations.insert(id, sequence);
        Ok(sequence)
    }

    /// Sequence the next reservation for `account` will receive.
    pub fn next_sequence(&self, account: &Address) -> Option<u64> {
        self.cursors.get(account).map(|c| c.next)
    }

    pub fn account_number(&self, account: &Address) -> Option<u64> {
        self.cursors.get(account).map(|c| c.account_number)
    }

    fn cursor_mut(&mut self, account: &Address) -> Result<&mut Cursor> {
        self.cursors
            .get_mut(account)
            .ok_or_else(|| Error::AccountQuery {
                address: account.clone(),
                source: ChainError::Other("account not loaded, call current() first".into()),
            })
    }
}
