use std::{collections::HashMap, fmt, future::Future, pin::pin, sync::Arc, time::Duration};

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    object::QualifiedName,
    reconcile::{self, Reconciler},
    sources::{self, SourceReconciler},
    store::ObjectStore,
    subscriber::Event,
};

mod slot;
use slot::Slot;

/// Retry delays after failed passes: `initial`, doubled per attempt, capped
/// at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// The delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.initial.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

/// A reconciler the runner can drive, one key at a time.
pub trait Reconcile: Send + Sync + 'static {
    type Error: fmt::Display + Send;

    /// Runs one pass for `key`. `cancel` fires when a newer event for the
    /// same key supersedes this pass.
    fn handle(
        &self,
        key: QualifiedName,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Whether `err` is expected to clear up without intervention.
    fn is_transient(&self, err: &Self::Error) -> bool {
        let _ = err;
        true
    }
}

impl<S: ObjectStore + 'static> Reconcile for Reconciler<S> {
    type Error = reconcile::Error;

    async fn handle(&self, key: QualifiedName, cancel: CancellationToken) -> Result<(), Self::Error> {
        let outcome = self.reconcile(&key, &cancel).await?;
        log::debug!("{key}: pass ended in {}", outcome.phase);
        Ok(())
    }

    fn is_transient(&self, err: &Self::Error) -> bool {
        err.is_transient()
    }
}

impl<S: ObjectStore + 'static> Reconcile for SourceReconciler<S> {
    type Error = sources::Error;

    async fn handle(&self, key: QualifiedName, _cancel: CancellationToken) -> Result<(), Self::Error> {
        self.reconcile_deployment(&key).await?;
        Ok(())
    }
}

/// Drives `reconciler` with the keys from `events` until the stream ends.
///
/// Every event starts a pass for its key, whether the object was changed or
/// deleted. Passes for distinct keys run concurrently. A newer event for a
/// key cancels the pass in flight and waits for it to return before starting
/// over, so there is at most one pass per key at any time. Failed passes are
/// retried after `backoff` until one succeeds or a newer event arrives.
///
/// Subscription errors are logged and skipped; the stream is expected to
/// recover by itself, as backed-off watchers do. When the stream ends, the
/// passes still in flight are awaited.
pub async fn run<R, Entry, E>(
    reconciler: Arc<R>,
    events: impl Stream<Item = Result<Event<QualifiedName, Entry>, E>>,
    backoff: Backoff,
) where
    R: Reconcile,
    E: fmt::Display,
{
    let mut slots = HashMap::<QualifiedName, Slot>::new();

    let mut events = pin!(events);
    while let Some(event) = events.next().await {
        let event = match event {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Event subscription failed, waiting for it to recover: {err}");
                continue;
            }
        };

        slots.retain(|_, slot| !slot.is_finished());

        let key = event.key;
        log::debug!(
            "Event for {key} ({})",
            if event.exists { "present" } else { "deleted" }
        );
        let prev = slots.remove(&key);
        let slot = Slot::spawn(prev, {
            let reconciler = Arc::clone(&reconciler);
            let key = key.clone();
            move |cancel| retry(reconciler, key, cancel, backoff)
        });
        slots.insert(key, slot);
    }

    for (_, slot) in slots.drain() {
        slot.join().await;
    }
}

async fn retry<R: Reconcile>(
    reconciler: Arc<R>,
    key: QualifiedName,
    cancel: CancellationToken,
    backoff: Backoff,
) {
    let mut attempt = 0;
    loop {
        let err = match reconciler.handle(key.clone(), cancel.clone()).await {
            Ok(()) => return,
            Err(err) => err,
        };
        if cancel.is_cancelled() {
            log::debug!("Pass for {key} superseded: {err}");
            return;
        }

        let delay = backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        if reconciler.is_transient(&err) {
            log::warn!("Reconciling {key} failed (attempt {attempt}), retrying in {delay:?}: {err}");
        } else {
            log::error!("Reconciling {key} failed (attempt {attempt}), retrying in {delay:?}: {err}");
        }

        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use futures::stream;
    use parking_lot::Mutex;
    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        in_flight: Mutex<HashMap<QualifiedName, usize>>,
        max_in_flight: AtomicUsize,
        completed: Mutex<HashMap<QualifiedName, usize>>,
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Reconcile for Recorder {
        type Error = String;

        async fn handle(&self, key: QualifiedName, cancel: CancellationToken) -> Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut in_flight = self.in_flight.lock();
                let count = in_flight.entry(key.clone()).or_default();
                *count += 1;
                self.max_in_flight.fetch_max(*count, Ordering::SeqCst);
            }

            let finished = tokio::select! {
                () = cancel.cancelled() => false,
                () = tokio::time::sleep(Duration::from_millis(100)) => true,
            };

            *self.in_flight.lock().entry(key.clone()).or_default() -= 1;
            if !finished {
                return Err("cancelled".to_owned());
            }
            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if failed {
                return Err("not yet".to_owned());
            }
            *self.completed.lock().entry(key).or_default() += 1;
            Ok(())
        }
    }

    fn event(name: &str) -> Result<Event<QualifiedName, ()>, Infallible> {
        Ok(Event {
            key: QualifiedName::namespaced("ns", name),
            entry: (),
            exists: true,
        })
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_secs(1));
        assert_eq!(backoff.delay(1), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(8));
        assert_eq!(backoff.delay(9), Duration::from_secs(300));
        assert_eq!(backoff.delay(64), Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn newer_events_supersede_the_pass_in_flight() {
        let recorder = Arc::new(Recorder::default());
        let events = stream::iter([event("a"), event("a"), event("b"), event("a")]);
        run(Arc::clone(&recorder), events, Backoff::default()).await;

        assert_eq!(recorder.max_in_flight.load(Ordering::SeqCst), 1);
        let completed = recorder.completed.lock();
        assert_eq!(completed.get(&QualifiedName::namespaced("ns", "a")), Some(&1));
        assert_eq!(completed.get(&QualifiedName::namespaced("ns", "b")), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_passes_are_retried_with_backoff() {
        let recorder = Arc::new(Recorder {
            failures_left: AtomicUsize::new(2),
            ..Recorder::default()
        });
        let start = Instant::now();
        run(Arc::clone(&recorder), stream::iter([event("a")]), Backoff::default()).await;

        assert_eq!(recorder.calls.load(Ordering::SeqCst), 3);
        assert_eq!(recorder.completed.lock().len(), 1);
        // three 100ms passes plus 1s and 2s of backoff
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3300), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(4), "{elapsed:?}");
    }

    #[derive(Debug, thiserror::Error)]
    #[error("watch broke")]
    struct Broken;

    #[tokio::test(start_paused = true)]
    async fn subscription_errors_are_skipped() {
        let recorder = Arc::new(Recorder::default());
        let key = |name: &str| QualifiedName::namespaced("ns", name);
        let event = |name: &str| {
            Ok(Event {
                key: key(name),
                entry: (),
                exists: true,
            })
        };
        let events = stream::iter([event("a"), Err(Broken), Err(Broken), event("b")]);
        run(Arc::clone(&recorder), events, Backoff::default()).await;

        let completed = recorder.completed.lock();
        assert_eq!(completed.get(&key("a")), Some(&1));
        assert_eq!(completed.get(&key("b")), Some(&1));
    }
}
