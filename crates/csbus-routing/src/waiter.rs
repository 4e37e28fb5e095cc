use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock;

/// Sentinel for an unbounded wait.
pub const INFINITE_WAIT: Duration = Duration::MAX;

/// Default bound applied to blocking calls that do not pass an explicit
/// timeout.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(10);

enum State<T> {
    Pending,
    Ready(T),
    Taken,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

/// Fulfilling half of a one-shot promise. Consumed by [`Resolver::resolve`];
/// dropping it unresolved leaves the waiter to its timeout.
pub struct Resolver<T> {
    slot: Arc<Slot<T>>,
}

/// Waiting half of a one-shot promise.
pub struct Waiter<T> {
    slot: Arc<Slot<T>>,
}

/// Create a one-shot promise pair.
///
/// The resolver is handed to whichever delivery path produces the result; the
/// waiter blocks the calling thread until resolution or timeout. This is the
/// only blocking primitive in the stack, so every synchronous call shares the
/// same bounded-wait behavior.
pub fn promise<T>() -> (Resolver<T>, Waiter<T>) {
    let slot = Arc::new(Slot {
        state: Mutex::new(State::Pending),
        ready: Condvar::new(),
    });
    (
        Resolver { slot: slot.clone() },
        Waiter { slot },
    )
}

impl<T> Resolver<T> {
    /// Resolve the promise. Returns `false` if it was already resolved.
    pub fn resolve(self, value: T) -> bool {
        let mut state = lock(&self.slot.state);
        if !matches!(*state, State::Pending) {
            return false;
        }
        *state = State::Ready(value);
        drop(state);
        self.slot.ready.notify_all();
        true
    }
}

impl<T> Waiter<T> {
    /// Block until the promise resolves or `timeout` elapses.
    ///
    /// Returns `None` on timeout. [`INFINITE_WAIT`] disables the bound.
    pub fn wait(self, timeout: Duration) -> Option<T> {
        let mut state = lock(&self.slot.state);
        if timeout == INFINITE_WAIT {
            loop {
                if let Some(value) = take_ready(&mut state) {
                    return Some(value);
                }
                state = self
                    .slot
                    .ready
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(value) = take_ready(&mut state) {
                return Some(value);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            state = self
                .slot
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .0;
        }
    }
}

fn take_ready<T>(state: &mut State<T>) -> Option<T> {
    if matches!(*state, State::Ready(_)) {
        if let State::Ready(value) = std::mem::replace(state, State::Taken) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn resolve_before_wait() {
        let (resolver, waiter) = promise();
        assert!(resolver.resolve(7));
        assert_eq!(waiter.wait(Duration::from_millis(10)), Some(7));
    }

    #[test]
    fn resolve_from_another_thread() {
        let (resolver, waiter) = promise();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            resolver.resolve("done");
        });
        assert_eq!(waiter.wait(Duration::from_secs(2)), Some("done"));
        producer.join().expect("producer thread should finish");
    }

    #[test]
    fn wait_times_out() {
        let (resolver, waiter) = promise::<u8>();
        let started = Instant::now();
        assert_eq!(waiter.wait(Duration::from_millis(50)), None);
        assert!(started.elapsed() >= Duration::from_millis(50));
        drop(resolver);
    }

    #[test]
    fn second_resolve_loses() {
        let (first, waiter) = promise();
        let slot = Resolver {
            slot: first.slot.clone(),
        };
        assert!(first.resolve(1));
        assert!(!slot.resolve(2));
        assert_eq!(waiter.wait(Duration::from_millis(10)), Some(1));
    }

    #[test]
    fn dropped_resolver_leaves_timeout() {
        let (resolver, waiter) = promise::<()>();
        drop(resolver);
        assert_eq!(waiter.wait(Duration::from_millis(20)), None);
    }
}
