use super::Session;
use crate::error::Result;
use crate::protocol::{MakeConnection, Record};

/// The handle to a session's open auto-commit result.
///
/// Records are fetched from the server in batches of the session's configured
/// fetch size as the handle is advanced. Dropping the handle leaves the
/// result open in the session; the next operation on the session buffers or
/// discards it as needed.
pub struct SessionResult<'a, M: MakeConnection> {
    session: &'a mut Session<M>,
}

impl<'a, M: MakeConnection> std::fmt::Debug for SessionResult<'a, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResult").finish_non_exhaustive()
    }
}

impl<'a, M: MakeConnection> SessionResult<'a, M> {
    pub(crate) fn new(session: &'a mut Session<M>) -> Self {
        SessionResult { session }
    }

    /// The next record, or `None` once the result is exhausted.
    pub async fn next(&mut self) -> Result<Option<Record>> {
        self.session.next_auto_record().await
    }

    /// Drain the remaining records into a vector.
    pub async fn collect(mut self) -> Result<Vec<Record>> {
        let mut records = Vec::new();
        while let Some(record) = self.next().await? {
            records.push(record);
        }
        Ok(records)
    }

    /// Discard whatever remains of the result, keeping only its bookmark.
    pub async fn consume(self) -> Result<()> {
        self.session.finish_auto_result().await
    }
}
