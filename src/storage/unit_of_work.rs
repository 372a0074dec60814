//! Unit of work lifecycle shared by every backend.

use super::{Result, StorageError};

/// Lifecycle of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOfWorkState {
    Unstarted,
    Active,
    Committed,
    RolledBack,
}

impl UnitOfWorkState {
    /// Committed or rolled back.
    pub fn is_finished(self) -> bool {
        matches!(self, UnitOfWorkState::Committed | UnitOfWorkState::RolledBack)
    }
}

/// Holds a backend transaction and enforces the unit of work state machine.
///
/// The transaction is only reachable while `Active`. Finishing takes it out
/// of the slot, so it can be committed or rolled back at most once.
#[derive(Debug)]
pub struct TxSlot<T> {
    tx: Option<T>,
    state: UnitOfWorkState,
}

impl<T> Default for TxSlot<T> {
    fn default() -> Self {
        Self {
            tx: None,
            state: UnitOfWorkState::Unstarted,
        }
    }
}

impl<T> TxSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> UnitOfWorkState {
        self.state
    }

    /// Fail unless a transaction may be started.
    pub fn ensure_startable(&self) -> Result<()> {
        match self.state {
            UnitOfWorkState::Unstarted => Ok(()),
            UnitOfWorkState::Active => Err(StorageError::TransactionAlreadyStarted),
            UnitOfWorkState::Committed | UnitOfWorkState::RolledBack => {
                Err(StorageError::TransactionFinished)
            }
        }
    }

    /// Store a freshly opened transaction.
    pub fn start(&mut self, tx: T) -> Result<()> {
        self.ensure_startable()?;
        self.tx = Some(tx);
        self.state = UnitOfWorkState::Active;
        Ok(())
    }

    /// Borrow the active transaction.
    pub fn active_mut(&mut self) -> Result<&mut T> {
        match self.state {
            UnitOfWorkState::Active => self.tx.as_mut().ok_or(StorageError::TransactionNotActive),
            UnitOfWorkState::Unstarted => Err(StorageError::TransactionNotActive),
            UnitOfWorkState::Committed | UnitOfWorkState::RolledBack => {
                Err(StorageError::TransactionFinished)
            }
        }
    }

    /// Take the transaction out to finish it, moving to `next`.
    ///
    /// The state moves to `next` before the caller commits or rolls back, so
    /// a failed commit still leaves the unit of work spent.
    pub fn finish(&mut self, next: UnitOfWorkState) -> Result<T> {
        self.active_mut()?;
        let tx = self.tx.take().ok_or(StorageError::TransactionNotActive)?;
        self.state = next;
        Ok(tx)
    }

    /// Record that a commit failed and the backend discarded the transaction.
    pub fn mark_rolled_back(&mut self) {
        self.tx = None;
        self.state = UnitOfWorkState::RolledBack;
    }
}
