// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Transaction document storage.
//!
//! The engine holds no lock across actions. Consistency comes from
//! [`TransactionStore::compare_and_swap`]: a write only lands if the document
//! still has the revision the writer read, so of two racing actors exactly
//! one wins and the other re-reads.

use crate::base::{TransactionId, UserId};
use crate::short_id::SuffixLookup;
use crate::transaction::Transaction;
use crate::MarketError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Result of a compare-and-swap.
#[derive(Debug, Clone, PartialEq)]
pub enum Swap {
    /// Write landed; carries the stored document with its new revision.
    Swapped(Transaction),
    /// Another write got there first; carries the current document.
    Conflict(Transaction),
}

/// Abstract document store for transactions.
pub trait TransactionStore: Send + Sync {
    /// Inserts a new document.
    ///
    /// # Errors
    ///
    /// Returns [`MarketError::DuplicateTransaction`] if the id already exists.
    fn insert(&self, transaction: Transaction) -> Result<(), MarketError>;

    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, MarketError>;

    /// Replaces the document if its revision is still `expected_revision`.
    ///
    /// The stored copy gets revision `expected_revision + 1`.
    fn compare_and_swap(
        &self,
        expected_revision: u64,
        updated: Transaction,
    ) -> Result<Swap, MarketError>;

    /// Newest transaction whose id ends with `suffix` and that `actor` is a party to.
    fn find_owned_by_suffix(
        &self,
        suffix: &str,
        actor: UserId,
    ) -> Result<Option<TransactionId>, MarketError>;

    fn all(&self) -> Result<Vec<Transaction>, MarketError>;

    fn for_user(&self, user: UserId) -> Result<Vec<Transaction>, MarketError> {
        Ok(self.all()?.into_iter().filter(|tx| tx.involves(user)).collect())
    }

    fn open(&self) -> Result<Vec<Transaction>, MarketError> {
        Ok(self.all()?.into_iter().filter(|tx| !tx.is_terminal()).collect())
    }
}

/// Short token checks over the transactions an actor is a party to.
pub struct OwnedTransactions<'a>(pub &'a dyn TransactionStore);

impl SuffixLookup for OwnedTransactions<'_> {
    fn lookup_suffix(&self, suffix: &str, actor: UserId) -> Result<Option<String>, MarketError> {
        Ok(self.0.find_owned_by_suffix(suffix, actor)?.map(|id| id.0))
    }

    fn accessible(&self, full_id: &str, actor: UserId) -> Result<bool, MarketError> {
        Ok(self
            .0
            .get(&TransactionId::from(full_id))?
            .is_some_and(|tx| tx.involves(actor)))
    }
}

/// In-process store backed by a [`DashMap`].
///
/// Inserts use the entry API so duplicate detection is atomic, and the
/// compare-and-swap runs under the shard's write lock.
#[derive(Debug, Default)]
pub struct InMemoryTransactionStore {
    transactions: DashMap<TransactionId, Transaction>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self {
            transactions: DashMap::new(),
        }
    }

    /// Rebuilds a store from previously exported documents.
    pub fn from_documents(documents: impl IntoIterator<Item = Transaction>) -> Result<Self, MarketError> {
        let store = Self::new();
        for document in documents {
            store.insert(document)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}

impl TransactionStore for InMemoryTransactionStore {
    fn insert(&self, transaction: Transaction) -> Result<(), MarketError> {
        match self.transactions.entry(transaction.id().clone()) {
            Entry::Occupied(_) => Err(MarketError::DuplicateTransaction),
            Entry::Vacant(entry) => {
                entry.insert(transaction);
                Ok(())
            }
        }
    }

    fn get(&self, id: &TransactionId) -> Result<Option<Transaction>, MarketError> {
        Ok(self.transactions.get(id).map(|entry| entry.value().clone()))
    }

    fn compare_and_swap(
        &self,
        expected_revision: u64,
        mut updated: Transaction,
    ) -> Result<Swap, MarketError> {
        let mut current = self
            .transactions
            .get_mut(updated.id())
            .ok_or(MarketError::NotFound)?;

        if current.revision() != expected_revision {
            return Ok(Swap::Conflict(current.clone()));
        }

        updated.set_revision(expected_revision + 1);
        *current = updated.clone();
        Ok(Swap::Swapped(updated))
    }

    fn find_owned_by_suffix(
        &self,
        suffix: &str,
        actor: UserId,
    ) -> Result<Option<TransactionId>, MarketError> {
        Ok(self
            .transactions
            .iter()
            .filter(|entry| entry.key().as_str().ends_with(suffix) && entry.involves(actor))
            .max_by_key(|entry| entry.created_at())
            .map(|entry| entry.key().clone()))
    }

    fn all(&self) -> Result<Vec<Transaction>, MarketError> {
        Ok(self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect())
    }
}
