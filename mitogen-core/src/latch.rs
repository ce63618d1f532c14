//! Blocking wait queue shared between application threads and the broker.
//!
//! A [`Latch`] is the one primitive every blocking wait in this crate is built
//! on: waiting for an RPC reply, waiting on another thread's connection
//! attempt, or simply synchronizing with the broker thread.
use std::{
    collections::{HashMap, VecDeque},
    sync::{Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use crate::{Error, Result};

/// Thread-safe queue whose [`get`](Latch::get) blocks until an item arrives.
///
/// Waiters are served strictly in arrival order: each [`put`](Latch::put)
/// hands its value to the longest-sleeping waiter, and once a value has been
/// handed over that waiter receives it even if its deadline passes before it
/// runs again.
pub struct Latch<T> {
    state: Mutex<State<T>>,
    cond: Condvar,
}

struct State<T> {
    queue: VecDeque<T>,
    sleeping: VecDeque<u64>,
    handed: HashMap<u64, T>,
    next_ticket: u64,
    closed: bool,
}

impl<T> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Latch<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                sleeping: VecDeque::new(),
                handed: HashMap::new(),
                next_ticket: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    // A panicking waiter must not wedge every other thread on the latch.
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `value`, waking exactly one waiter if any is sleeping.
    pub fn put(&self, value: T) -> Result<()> {
        let mut state = self.lock();
        if state.closed {
            return Err(Error::LatchClosed);
        }
        match state.sleeping.pop_front() {
            Some(ticket) => {
                state.handed.insert(ticket, value);
                drop(state);
                self.cond.notify_all();
            }
            None => state.queue.push_back(value),
        }
        Ok(())
    }

    /// Block until a value is available, `timeout` elapses
    /// ([`Error::LatchTimeout`]) or the latch is closed
    /// ([`Error::LatchClosed`]). `None` waits forever.
    pub fn get(&self, timeout: Option<Duration>) -> Result<T> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        if state.closed {
            return Err(Error::LatchClosed);
        }
        if let Some(value) = state.queue.pop_front() {
            return Ok(value);
        }

        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.sleeping.push_back(ticket);

        loop {
            if let Some(value) = state.handed.remove(&ticket) {
                return Ok(value);
            }
            if state.closed {
                return Err(Error::LatchClosed);
            }
            match deadline {
                None => {
                    state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        state.sleeping.retain(|t| *t != ticket);
                        return Err(Error::LatchTimeout);
                    }
                    state = self
                        .cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
        }
    }

    /// Non-blocking [`get`](Latch::get).
    pub fn try_get(&self) -> Option<T> {
        self.lock().queue.pop_front()
    }

    /// Wake every present and future waiter with [`Error::LatchClosed`].
    pub fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.sleeping.clear();
        drop(state);
        self.cond.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }
}
