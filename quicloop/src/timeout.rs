//! # Timeout Scheduler
//!
//! Both sessions block in exactly one place, the socket receive. Its deadline
//! is the soonest timer over every live connection; when the receive times
//! out every connection gets `on_timeout`, and each engine fires only what
//! has actually expired.

use quicloop_engine::ProtocolEngine;
use std::time::{Duration, Instant};

use crate::connection::Connection;

/// Anything with an engine timer.
pub trait Timer {
    /// Delay until the next timer, `None` when none is armed.
    fn time_remaining(&self) -> Option<Duration>;

    fn on_timeout(&mut self);
}

impl<E: ProtocolEngine> Timer for Connection<E> {
    fn time_remaining(&self) -> Option<Duration> {
        Connection::time_remaining(self)
    }

    fn on_timeout(&mut self) {
        Connection::on_timeout(self)
    }
}

/// Smallest positive delay over `timers`; `None` means wait indefinitely.
pub fn next_timeout<'a, T, I>(timers: I) -> Option<Duration>
where
    T: Timer + 'a,
    I: IntoIterator<Item = &'a T>,
{
    timers
        .into_iter()
        .filter_map(Timer::time_remaining)
        .filter(|d| !d.is_zero())
        .min()
}

/// [`next_timeout`] as an absolute instant.
pub fn next_deadline<'a, T, I>(now: Instant, timers: I) -> Option<Instant>
where
    T: Timer + 'a,
    I: IntoIterator<Item = &'a T>,
{
    next_timeout(timers).map(|d| now + d)
}

/// Deliver a receive timeout to every timer.
pub fn fire_all<'a, T, I>(timers: I) -> usize
where
    T: Timer + 'a,
    I: IntoIterator<Item = &'a mut T>,
{
    let mut fired = 0;
    for timer in timers {
        timer.on_timeout();
        fired += 1;
    }
    fired
}
