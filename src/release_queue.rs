use std::collections::BTreeMap;

use tokio::time::Instant;

/// Pending rate-limit releases, ordered by deadline.
///
/// Entries are owned by the pool and advanced explicitly with
/// [`ReleaseQueue::pop_expired`]; nothing here runs on its own.
#[derive(Debug, Default)]
pub(crate) struct ReleaseQueue {
  // Keyed by (deadline, sequence) so two entries with the same deadline stay distinct
  // and pop in scheduling order.
  entries: BTreeMap<(Instant, u64), String>,
  next_seq: u64,
}

impl ReleaseQueue {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn schedule(&mut self, resource: &str, deadline: Instant) {
    let seq = self.next_seq;
    self.next_seq += 1;
    self.entries.insert((deadline, seq), resource.to_string());
  }

  pub(crate) fn next_deadline(&self) -> Option<Instant> {
    self.entries.keys().next().map(|(deadline, _)| *deadline)
  }

  /// Removes and returns every entry due at or before `now`, earliest first.
  pub(crate) fn pop_expired(&mut self, now: Instant) -> Vec<String> {
    let mut expired = Vec::new();
    while let Some(entry) = self.entries.first_entry() {
      if entry.key().0 > now {
        break;
      }
      expired.push(entry.remove());
    }
    expired
  }

  /// Whether any entry for `resource` is still waiting.
  pub(crate) fn is_pending(&self, resource: &str) -> bool {
    self.entries.values().any(|pending| pending == resource)
  }

  /// Drops all pending entries for `resource`. Returns how many were dropped.
  pub(crate) fn cancel(&mut self, resource: &str) -> usize {
    let before = self.entries.len();
    self.entries.retain(|_, pending| pending != resource);
    before - self.entries.len()
  }

  /// Drops every pending entry. Returns how many were dropped.
  pub(crate) fn drain(&mut self) -> usize {
    let dropped = self.entries.len();
    self.entries.clear();
    dropped
  }

  pub(crate) fn len(&self) -> usize {
    self.entries.len()
  }
}
