use crate::release_queue::ReleaseQueue;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Observable state of a single resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
  Available,
  InUse,
  RateLimited,
  Removed,
}

/// How an acquisition scan moves over the resource sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanPolicy {
  /// The cursor only moves forward and never wraps. Once it reaches the end of
  /// the sequence, resources behind it are not reconsidered, even if they have
  /// become available again.
  #[default]
  Monotonic,
  /// Each scan starts at the cursor, wraps to the start, and examines every
  /// resource exactly once.
  Wraparound,
}

/// Result of a single acquisition scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
  /// The resource is now marked in use by the caller.
  Acquired(String),
  /// Nothing was free, but at least one rate-limited resource was skipped.
  RateLimited,
  /// Nothing was free and nothing is coming back.
  Exhausted,
}

#[derive(Debug, Clone)]
pub struct PoolOptions {
  /// Pause between scans while only rate-limited resources stand in the way.
  pub acquire_retry_interval: Duration,
  pub scan_policy: ScanPolicy,
}

impl Default for PoolOptions {
  fn default() -> Self {
    Self {
      acquire_retry_interval: Duration::from_secs(5),
      scan_policy: ScanPolicy::default(),
    }
  }
}

impl PoolOptions {
  pub fn with_acquire_retry_interval(mut self, interval: Duration) -> Self {
    self.acquire_retry_interval = interval;
    self
  }

  pub fn with_scan_policy(mut self, policy: ScanPolicy) -> Self {
    self.scan_policy = policy;
    self
  }
}

struct PoolState {
  resources: Vec<String>,
  cursor: usize,
  in_use: HashSet<String>,
  rate_limited: HashSet<String>,
  releases: ReleaseQueue,
}

impl PoolState {
  fn contains(&self, resource: &str) -> bool {
    self.resources.iter().any(|r| r == resource)
  }

  fn state_of(&self, resource: &str) -> ResourceState {
    if !self.contains(resource) {
      ResourceState::Removed
    } else if self.rate_limited.contains(resource) {
      ResourceState::RateLimited
    } else if self.in_use.contains(resource) {
      ResourceState::InUse
    } else {
      ResourceState::Available
    }
  }

  fn scan(&mut self, policy: ScanPolicy) -> Acquire {
    let len = self.resources.len();
    let budget = match policy {
      ScanPolicy::Monotonic => len.saturating_sub(self.cursor),
      ScanPolicy::Wraparound => len,
    };

    let mut skipped_rate_limited = false;
    for _ in 0..budget {
      if self.cursor >= len {
        self.cursor = 0;
      }
      let index = self.cursor;
      self.cursor += 1;

      let candidate = &self.resources[index];
      if self.rate_limited.contains(candidate) {
        skipped_rate_limited = true;
        continue;
      }
      if self.in_use.contains(candidate) {
        continue;
      }

      let acquired = candidate.clone();
      self.in_use.insert(acquired.clone());
      return Acquire::Acquired(acquired);
    }

    if skipped_rate_limited {
      Acquire::RateLimited
    } else {
      Acquire::Exhausted
    }
  }
}

/// Everything the release driver needs, shared without a reference back to the pool.
struct PoolShared {
  pool_name: Arc<String>,
  state: Mutex<PoolState>,
  release_wakeup: Notify,
}

impl PoolShared {
  /// A resource only comes back when its last pending release expires; an
  /// earlier, shorter release must not cut a later cooldown short.
  fn release_expired(&self, now: Instant) -> Vec<String> {
    let (reactivated, still_limited) = {
      let mut state = self.state.lock();
      let mut reactivated: Vec<String> = Vec::new();
      let mut still_limited = 0usize;
      for resource in state.releases.pop_expired(now) {
        if state.releases.is_pending(&resource) {
          still_limited += 1;
          continue;
        }
        if reactivated.contains(&resource) {
          continue;
        }
        state.rate_limited.remove(&resource);
        state.in_use.remove(&resource);
        reactivated.push(resource);
      }
      (reactivated, still_limited)
    };

    if still_limited > 0 {
      debug!(pool_name = %*self.pool_name, still_limited, "Expired releases superseded by a later cooldown.");
    }
    for resource in &reactivated {
      info!(pool_name = %*self.pool_name, %resource, "Resource re-activated after rate limit delay.");
    }
    reactivated
  }
}

/// An ordered set of exclusively-held resources.
///
/// All state lives behind one lock that callers never see; every operation is
/// atomic with respect to every other. A resource is held by at most one
/// caller at a time, and removed resources never come back.
pub struct ResourcePool {
  shared: Arc<PoolShared>,
  options: PoolOptions,
  shutdown_token: CancellationToken,
  driver_join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ResourcePool {
  /// Builds a pool without a release driver. Rate-limit releases only happen
  /// when [`ResourcePool::release_expired`] is called.
  ///
  /// Blank identifiers are skipped and duplicates keep their first position.
  pub fn new<I, S>(pool_name: &str, resources: I, options: PoolOptions) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let mut seen = HashSet::new();
    let mut skipped = 0usize;
    let mut ordered = Vec::new();
    for resource in resources {
      let resource: String = resource.into();
      let resource = resource.trim().to_string();
      if resource.is_empty() || !seen.insert(resource.clone()) {
        skipped += 1;
        continue;
      }
      ordered.push(resource);
    }
    if skipped > 0 {
      warn!(pool_name = %pool_name, skipped, "Ignored blank or duplicate resource identifiers.");
    }
    debug!(pool_name = %pool_name, resources = ordered.len(), policy = ?options.scan_policy, "Resource pool created.");

    Self {
      shared: Arc::new(PoolShared {
        pool_name: Arc::new(pool_name.to_string()),
        state: Mutex::new(PoolState {
          resources: ordered,
          cursor: 0,
          in_use: HashSet::new(),
          rate_limited: HashSet::new(),
          releases: ReleaseQueue::new(),
        }),
        release_wakeup: Notify::new(),
      }),
      options,
      shutdown_token: CancellationToken::new(),
      driver_join_handle: Mutex::new(None),
    }
  }

  /// Builds a pool and starts its release driver on `tokio_handle`.
  ///
  /// The driver sleeps until the next pending release is due and applies it.
  /// It stops on [`ResourcePool::shutdown`] or when the pool is dropped.
  pub fn spawn<I, S>(pool_name: &str, resources: I, options: PoolOptions, tokio_handle: TokioHandle) -> Arc<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let pool = Self::new(pool_name, resources, options);
    let driver_shared = pool.shared.clone();
    let driver_token = pool.shutdown_token.clone();

    let handle = tokio_handle.spawn(
      Self::run_release_driver(driver_shared, driver_token)
        .instrument(info_span!("release_driver", pool_name = %pool_name)),
    );
    *pool.driver_join_handle.lock() = Some(handle);

    Arc::new(pool)
  }

  pub fn name(&self) -> &str {
    &self.shared.pool_name
  }

  pub fn options(&self) -> &PoolOptions {
    &self.options
  }

  /// Acquires an available resource, marking it in use.
  ///
  /// While the only candidates are rate-limited, waits
  /// `acquire_retry_interval` and scans again from the current cursor.
  /// Returns `None` once the pool is exhausted or shut down.
  pub async fn acquire(&self) -> Option<String> {
    loop {
      match self.try_acquire() {
        Acquire::Acquired(resource) => return Some(resource),
        Acquire::Exhausted => {
          debug!(pool_name = %*self.shared.pool_name, "No resource left to acquire.");
          return None;
        }
        Acquire::RateLimited => {
          info!(pool_name = %*self.shared.pool_name, "Waiting for available resource...");
          tokio::select! {
            biased;
            _ = self.shutdown_token.cancelled() => {
              debug!(pool_name = %*self.shared.pool_name, "Pool shut down while waiting for a resource.");
              return None;
            }
            _ = tokio::time::sleep(self.options.acquire_retry_interval) => {}
          }
        }
      }
    }
  }

  /// Runs one acquisition scan without waiting.
  pub fn try_acquire(&self) -> Acquire {
    let outcome = self.shared.state.lock().scan(self.options.scan_policy);
    if let Acquire::Acquired(resource) = &outcome {
      debug!(pool_name = %*self.shared.pool_name, %resource, "Resource acquired.");
    }
    outcome
  }

  /// Marks `resource` rate-limited now and schedules it to become available
  /// after `delay`. Overlapping calls extend the cooldown: the resource stays
  /// rate-limited until the latest pending deadline.
  ///
  /// Returns `false` (and does nothing) if the resource is not in the pool.
  pub fn release_after_delay(&self, resource: &str, delay: Duration) -> bool {
    {
      let mut state = self.shared.state.lock();
      if !state.contains(resource) {
        drop(state);
        warn!(pool_name = %*self.shared.pool_name, %resource, "Ignoring rate limit for a resource that is not in the pool.");
        return false;
      }
      state.rate_limited.insert(resource.to_string());
      state.releases.schedule(resource, Instant::now() + delay);
    }
    self.shared.release_wakeup.notify_one();
    debug!(pool_name = %*self.shared.pool_name, %resource, ?delay, "Resource rate limited.");
    true
  }

  /// Applies every rate-limit release due at or before `now` and returns the
  /// resources that became available.
  pub fn release_expired(&self, now: Instant) -> Vec<String> {
    self.shared.release_expired(now)
  }

  /// Gives a held resource back immediately. A pending rate limit on it is not affected.
  pub fn release(&self, resource: &str) -> bool {
    let released = self.shared.state.lock().in_use.remove(resource);
    if released {
      debug!(pool_name = %*self.shared.pool_name, %resource, "Resource released.");
    }
    released
  }

  /// Permanently removes `resource` and cancels its pending releases.
  ///
  /// Returns `false` if it was already gone. The scan cursor keeps its relative position.
  pub fn remove(&self, resource: &str) -> bool {
    let cancelled = {
      let mut state = self.shared.state.lock();
      let Some(index) = state.resources.iter().position(|r| r == resource) else {
        drop(state);
        trace!(pool_name = %*self.shared.pool_name, %resource, "Resource already removed.");
        return false;
      };
      state.resources.remove(index);
      if index < state.cursor {
        state.cursor -= 1;
      }
      state.in_use.remove(resource);
      state.rate_limited.remove(resource);
      state.releases.cancel(resource)
    };

    info!(pool_name = %*self.shared.pool_name, %resource, cancelled_releases = cancelled, "Removed resource permanently.");
    true
  }

  pub fn state(&self, resource: &str) -> ResourceState {
    self.shared.state.lock().state_of(resource)
  }

  /// Every remaining resource with its state, in scan order.
  pub fn snapshot(&self) -> Vec<(String, ResourceState)> {
    let state = self.shared.state.lock();
    state
      .resources
      .iter()
      .map(|resource| (resource.clone(), state.state_of(resource)))
      .collect()
  }

  pub fn len(&self) -> usize {
    self.shared.state.lock().resources.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn cursor(&self) -> usize {
    self.shared.state.lock().cursor
  }

  pub fn available_count(&self) -> usize {
    let state = self.shared.state.lock();
    state
      .resources
      .iter()
      .filter(|resource| state.state_of(resource) == ResourceState::Available)
      .count()
  }

  pub fn pending_releases(&self) -> usize {
    self.shared.state.lock().releases.len()
  }

  /// Stops the release driver and drops every pending release.
  ///
  /// Resources still rate-limited stay that way. Waiting [`ResourcePool::acquire`]
  /// calls return `None`.
  pub async fn shutdown(&self) {
    let already_shutting_down = self.shutdown_token.is_cancelled();
    if !already_shutting_down {
      info!(pool_name = %*self.shared.pool_name, "Shutting down resource pool.");
      self.shutdown_token.cancel();
    }

    let handle_to_await = self.driver_join_handle.lock().take();
    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(pool_name = %*self.shared.pool_name, "Error joining release driver: {:?}", join_error);
      }
    }

    let dropped = self.shared.state.lock().releases.drain();
    if dropped > 0 {
      info!(pool_name = %*self.shared.pool_name, dropped, "Dropped pending rate limit releases at shutdown.");
    }
  }

  async fn run_release_driver(shared: Arc<PoolShared>, shutdown_token: CancellationToken) {
    debug!(pool_name = %*shared.pool_name, "Release driver started.");

    loop {
      let next_deadline = shared.state.lock().releases.next_deadline();
      match next_deadline {
        Some(deadline) => {
          tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            // A new entry may be due earlier; recompute.
            _ = shared.release_wakeup.notified() => continue,
            _ = tokio::time::sleep_until(deadline) => {
              shared.release_expired(Instant::now());
            }
          }
        }
        None => {
          tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            _ = shared.release_wakeup.notified() => {}
          }
        }
      }
    }

    debug!(pool_name = %*shared.pool_name, "Release driver stopped.");
  }
}

impl Drop for ResourcePool {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      trace!(pool_name = %*self.shared.pool_name, "ResourcePool dropped. Stopping release driver.");
      self.shutdown_token.cancel();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn pool(resources: &[&str], policy: ScanPolicy) -> ResourcePool {
    ResourcePool::new(
      "test_pool",
      resources.iter().copied(),
      PoolOptions::default()
        .with_scan_policy(policy)
        .with_acquire_retry_interval(Duration::from_millis(100)),
    )
  }

  #[test]
  fn acquire_hands_out_each_resource_once() {
    let pool = pool(&["p1", "p2"], ScanPolicy::Monotonic);

    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p2".to_string()));
    assert_eq!(pool.try_acquire(), Acquire::Exhausted);
    assert_eq!(pool.state("p1"), ResourceState::InUse);
    assert_eq!(pool.available_count(), 0);
  }

  #[test]
  fn blank_and_duplicate_identifiers_are_dropped() {
    let pool = pool(&["p1", " ", "p2", "p1", ""], ScanPolicy::Monotonic);
    assert_eq!(pool.len(), 2);
    assert_eq!(
      pool.snapshot(),
      vec![
        ("p1".to_string(), ResourceState::Available),
        ("p2".to_string(), ResourceState::Available)
      ]
    );
  }

  #[test]
  fn rate_limited_resource_is_skipped_and_reported() {
    let pool = pool(&["p1", "p2"], ScanPolicy::Monotonic);
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));
    assert_eq!(pool.state("p1"), ResourceState::RateLimited);

    assert_eq!(pool.try_acquire(), Acquire::Acquired("p2".to_string()));

    // Cursor is past both entries now; the next monotonic scan examines nothing.
    assert_eq!(pool.try_acquire(), Acquire::Exhausted);
  }

  #[test]
  fn scan_reports_rate_limited_when_only_throttled_entries_remain() {
    let pool = pool(&["p1", "p2"], ScanPolicy::Wraparound);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert!(pool.release_after_delay("p2", Duration::from_secs(1)));
    assert_eq!(pool.try_acquire(), Acquire::RateLimited);

    pool.release("p1");
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
  }

  #[test]
  fn release_after_delay_clears_exactly_once_after_deadline() {
    let pool = pool(&["p1"], ScanPolicy::Wraparound);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));

    let scheduled_at = Instant::now();
    assert!(pool.release_after_delay("p1", Duration::from_secs(30)));
    assert_eq!(pool.pending_releases(), 1);

    assert!(pool.release_expired(scheduled_at).is_empty());
    assert_eq!(pool.state("p1"), ResourceState::RateLimited);

    let released = pool.release_expired(scheduled_at + Duration::from_secs(31));
    assert_eq!(released, vec!["p1".to_string()]);
    assert_eq!(pool.state("p1"), ResourceState::Available);

    assert!(pool.release_expired(scheduled_at + Duration::from_secs(3600)).is_empty());
    assert_eq!(pool.pending_releases(), 0);
  }

  #[test]
  fn overlapping_rate_limits_hold_until_the_latest_deadline() {
    let pool = pool(&["p1"], ScanPolicy::Wraparound);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));

    let start = Instant::now();
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));
    assert!(pool.release_after_delay("p1", Duration::from_secs(10)));

    // The short cooldown expires but the long one is still pending.
    assert!(pool.release_expired(start + Duration::from_secs(2)).is_empty());
    assert_eq!(pool.state("p1"), ResourceState::RateLimited);
    assert_eq!(pool.try_acquire(), Acquire::RateLimited);
    assert_eq!(pool.pending_releases(), 1);

    let released = pool.release_expired(start + Duration::from_secs(11));
    assert_eq!(released, vec!["p1".to_string()]);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));

    // Nothing left behind can free it from under its new holder.
    assert!(pool.release_expired(start + Duration::from_secs(3600)).is_empty());
    assert_eq!(pool.state("p1"), ResourceState::InUse);
    assert_eq!(pool.try_acquire(), Acquire::Exhausted);
  }

  #[test]
  fn same_deadline_releases_reactivate_once() {
    let pool = pool(&["p1"], ScanPolicy::Wraparound);
    let start = Instant::now();
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));

    let released = pool.release_expired(start + Duration::from_secs(5));
    assert_eq!(released, vec!["p1".to_string()]);
    assert_eq!(pool.state("p1"), ResourceState::Available);
  }

  #[test]
  fn release_after_delay_ignores_unknown_resources() {
    let pool = pool(&["p1"], ScanPolicy::Monotonic);
    assert!(!pool.release_after_delay("ghost", Duration::from_secs(1)));
    assert_eq!(pool.pending_releases(), 0);
    assert_eq!(pool.state("ghost"), ResourceState::Removed);
  }

  #[test]
  fn remove_is_idempotent_and_cancels_pending_releases() {
    let pool = pool(&["p1", "p2", "p3"], ScanPolicy::Monotonic);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));

    assert!(pool.remove("p1"));
    let after_first = pool.snapshot();
    let cursor_after_first = pool.cursor();

    assert!(!pool.remove("p1"));
    assert_eq!(pool.snapshot(), after_first);
    assert_eq!(pool.cursor(), cursor_after_first);

    assert_eq!(pool.state("p1"), ResourceState::Removed);
    assert_eq!(pool.pending_releases(), 0);
    assert!(pool.release_expired(Instant::now() + Duration::from_secs(10)).is_empty());
  }

  #[test]
  fn remove_before_cursor_keeps_relative_position() {
    let pool = pool(&["p1", "p2", "p3"], ScanPolicy::Monotonic);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert_eq!(pool.cursor(), 1);

    assert!(pool.remove("p1"));
    assert_eq!(pool.cursor(), 0);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p2".to_string()));

    // Removing an entry at or after the cursor leaves it alone.
    assert!(pool.remove("p3"));
    assert_eq!(pool.cursor(), 1);
    assert_eq!(pool.try_acquire(), Acquire::Exhausted);
  }

  #[test]
  fn monotonic_scan_does_not_revisit_released_entries() {
    let monotonic = pool(&["p1", "p2"], ScanPolicy::Monotonic);
    assert_eq!(monotonic.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert_eq!(monotonic.try_acquire(), Acquire::Acquired("p2".to_string()));
    assert!(monotonic.release("p1"));
    assert_eq!(monotonic.state("p1"), ResourceState::Available);
    assert_eq!(monotonic.try_acquire(), Acquire::Exhausted);

    let wraparound = pool(&["p1", "p2"], ScanPolicy::Wraparound);
    assert_eq!(wraparound.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert_eq!(wraparound.try_acquire(), Acquire::Acquired("p2".to_string()));
    assert!(wraparound.release("p1"));
    assert_eq!(wraparound.try_acquire(), Acquire::Acquired("p1".to_string()));
  }

  #[test]
  fn release_does_not_lift_rate_limit() {
    let pool = pool(&["p1"], ScanPolicy::Wraparound);
    assert_eq!(pool.try_acquire(), Acquire::Acquired("p1".to_string()));
    assert!(pool.release_after_delay("p1", Duration::from_secs(5)));
    assert!(pool.release("p1"));
    assert_eq!(pool.state("p1"), ResourceState::RateLimited);
    assert_eq!(pool.try_acquire(), Acquire::RateLimited);
  }

  #[tokio::test(start_paused = true)]
  async fn acquire_waits_for_rate_limited_resource() {
    let pool = ResourcePool::spawn(
      "test_pool_driver",
      ["p1"],
      PoolOptions::default()
        .with_scan_policy(ScanPolicy::Wraparound)
        .with_acquire_retry_interval(Duration::from_millis(100)),
      TokioHandle::current(),
    );
    assert_eq!(pool.acquire().await, Some("p1".to_string()));

    let started = Instant::now();
    assert!(pool.release_after_delay("p1", Duration::from_secs(1)));
    assert_eq!(pool.acquire().await, Some("p1".to_string()));
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(pool.pending_releases(), 0);

    pool.shutdown().await;
  }

  #[tokio::test(start_paused = true)]
  async fn shutdown_drains_pending_releases_and_unblocks_acquire() {
    let pool = ResourcePool::spawn(
      "test_pool_shutdown",
      ["p1"],
      PoolOptions::default().with_scan_policy(ScanPolicy::Wraparound),
      TokioHandle::current(),
    );
    assert!(pool.release_after_delay("p1", Duration::from_secs(3600)));

    let waiter = {
      let pool = pool.clone();
      tokio::spawn(async move { pool.acquire().await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    pool.shutdown().await;
    assert_eq!(waiter.await.unwrap(), None);
    assert_eq!(pool.pending_releases(), 0);
    assert_eq!(pool.state("p1"), ResourceState::RateLimited);
  }
}
