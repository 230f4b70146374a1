//! Cancellation scope with a cause slot.

use crate::TraceError;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Why a run ended.
#[derive(Debug)]
pub enum EndCause {
    /// Every printable TTL was delivered; the run finished on its own.
    NaturalDone,
    /// An interrupt signal cancelled the run.
    Interrupted,
    /// An unexpected error tore the run down.
    Fault(TraceError),
}

/// Cancellation token for one trace run, carrying the first cause recorded.
///
/// All tasks of a run select on [`cancelled`](RunToken::cancelled) and exit
/// promptly once it fires. The first caller of
/// [`cancel_with`](RunToken::cancel_with) wins the cause slot; later causes
/// are discarded.
#[derive(Clone)]
pub struct RunToken {
    token: CancellationToken,
    cause: Arc<Mutex<Option<EndCause>>>,
}

impl Default for RunToken {
    fn default() -> Self {
        Self::new()
    }
}

impl RunToken {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            cause: Arc::new(Mutex::new(None)),
        }
    }

    /// Cancels the run, recording `cause` if none was recorded yet.
    pub fn cancel_with(&self, cause: EndCause) {
        {
            let mut slot = self.cause.lock().unwrap();
            if slot.is_none() {
                *slot = Some(cause);
            }
        }
        self.token.cancel();
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The raw token, for handing to listener threads.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Takes the recorded cause out of the slot.
    pub fn take_cause(&self) -> Option<EndCause> {
        self.cause.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_cause_wins() {
        let run = RunToken::new();
        run.cancel_with(EndCause::NaturalDone);
        run.cancel_with(EndCause::Interrupted);
        assert!(run.is_cancelled());
        assert!(matches!(run.take_cause(), Some(EndCause::NaturalDone)));
        assert!(run.take_cause().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_future_fires() {
        let run = RunToken::new();
        let waiter = run.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });
        run.cancel_with(EndCause::Interrupted);
        handle.await.unwrap();
    }
}
