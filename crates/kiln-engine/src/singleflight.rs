//! Coalesces overlapping calls for the same key into one execution.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

enum FlightState<V> {
    Running,
    Done(V),
    Abandoned,
}

struct Flight<V> {
    state: Mutex<FlightState<V>>,
    settled: Condvar,
}

pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<Flight<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> std::fmt::Debug for SingleFlight<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight").finish_non_exhaustive()
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `work` unless a call for `key` is already in flight, in which case
    /// this waits for and returns that call's result. If the leader unwinds
    /// without a result, waiters run their own `work`.
    pub fn run(&self, key: K, work: impl FnOnce() -> V) -> V {
        let (flight, leader) = {
            let mut flights = lock(&self.flights);
            match flights.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let flight = Arc::new(Flight {
                        state: Mutex::new(FlightState::Running),
                        settled: Condvar::new(),
                    });
                    flights.insert(key.clone(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !leader {
            let mut state = lock(&flight.state);
            loop {
                if let FlightState::Done(value) = &*state {
                    return value.clone();
                }
                if matches!(*state, FlightState::Abandoned) {
                    break;
                }
                state = flight
                    .settled
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            drop(state);
            return work();
        }

        let landing = Landing {
            owner: self,
            key,
            flight,
        };
        let value = work();
        landing.settle(FlightState::Done(value.clone()));
        value
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

/// Publishes the leader's outcome and retires the flight, including when the
/// leader unwinds.
struct Landing<'a, K: Eq + Hash, V> {
    owner: &'a SingleFlight<K, V>,
    key: K,
    flight: Arc<Flight<V>>,
}

impl<K: Eq + Hash, V> Landing<'_, K, V> {
    fn settle(self, outcome: FlightState<V>) {
        *lock(&self.flight.state) = outcome;
    }
}

impl<K: Eq + Hash, V> Drop for Landing<'_, K, V> {
    fn drop(&mut self) {
        lock(&self.owner.flights).remove(&self.key);
        let mut state = lock(&self.flight.state);
        if matches!(*state, FlightState::Running) {
            *state = FlightState::Abandoned;
        }
        drop(state);
        self.flight.settled.notify_all();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
