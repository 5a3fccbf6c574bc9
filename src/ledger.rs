use std::sync::atomic::{AtomicUsize, Ordering};

use tokio_util::sync::CancellationToken;

/// Counts tasks still in circulation: queued, retrying or being processed.
///
/// A task leaves circulation once, either when it is processed or when the
/// retry dispatcher drops it. When the count reaches zero the `settled` token
/// fires, which is how idle workers learn there is nothing more to wait for.
#[derive(Debug)]
pub(crate) struct WorkLedger {
  outstanding: AtomicUsize,
  settled: CancellationToken,
}

impl WorkLedger {
  pub(crate) fn new(total: usize) -> Self {
    let settled = CancellationToken::new();
    if total == 0 {
      settled.cancel();
    }
    Self {
      outstanding: AtomicUsize::new(total),
      settled,
    }
  }

  /// Records that one task left circulation.
  pub(crate) fn settle_one(&self) {
    let previous = self
      .outstanding
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    if previous == Ok(1) {
      self.settled.cancel();
    }
  }

  pub(crate) fn outstanding(&self) -> usize {
    self.outstanding.load(Ordering::Acquire)
  }

  pub(crate) fn settled_token(&self) -> &CancellationToken {
    &self.settled
  }
}
