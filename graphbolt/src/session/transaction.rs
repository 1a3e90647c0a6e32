use faststr::FastStr;

use super::Session;
use crate::error::Result;
use crate::protocol::{MakeConnection, Record, ValueMap};

/// An explicit, unmanaged transaction.
///
/// Obtained from [`Session::begin_transaction`]. Must be finished with
/// [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback);
/// a transaction still open when the session closes is rolled back.
pub struct Transaction<'a, M: MakeConnection> {
    session: &'a mut Session<M>,
}

impl<'a, M: MakeConnection> std::fmt::Debug for Transaction<'a, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}

impl<'a, M: MakeConnection> Transaction<'a, M> {
    pub(crate) fn new(session: &'a mut Session<M>) -> Self {
        Transaction { session }
    }

    /// Run a query inside this transaction and buffer its records.
    pub async fn run(
        &mut self,
        query: impl Into<FastStr>,
        parameters: ValueMap,
    ) -> Result<Vec<Record>> {
        self.session.tx_run(query.into(), &parameters).await
    }

    /// Commit, making the transaction's bookmark the session's causal
    /// baseline.
    pub async fn commit(self) -> Result<()> {
        self.session.tx_commit().await
    }

    pub async fn rollback(self) -> Result<()> {
        self.session.tx_rollback().await
    }
}

/// The transaction handle passed to a managed transaction function.
///
/// Commit and rollback are owned by the retry loop, so the function can only
/// run queries.
pub struct ManagedTransaction<'a, M: MakeConnection> {
    session: &'a mut Session<M>,
}

impl<'a, M: MakeConnection> ManagedTransaction<'a, M> {
    pub(crate) fn new(session: &'a mut Session<M>) -> Self {
        ManagedTransaction { session }
    }

    /// Run a query inside the managed transaction and buffer its records.
    pub async fn run(
        &mut self,
        query: impl Into<FastStr>,
        parameters: ValueMap,
    ) -> Result<Vec<Record>> {
        self.session.tx_run(query.into(), &parameters).await
    }
}
