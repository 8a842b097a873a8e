// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The cooperative tick loop (C5): one background thread driving every
//! registered executor at a fixed 0.2 s cadence. Callbacks run on the
//! ticker thread; anything long-running must hand off to its own thread.

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{Local, TimeZone, Timelike};
use enum_dispatch::enum_dispatch;
use tracing::warn;

pub const TICK_SLEEP: Duration = Duration::from_millis(200);

pub type TickFn = Box<dyn FnMut() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutorId(u64);

/// One scheduled unit of work. `tick` receives the wall clock and the time
/// since the previous scheduler pass, and returns whether the executor
/// stays registered.
#[enum_dispatch]
pub trait Tick {
    fn tick(&mut self, now: f64, dt: f64) -> bool;
}

#[enum_dispatch(Tick)]
pub enum Executor {
    Timed(TimedExecutor),
    Deferred(DeferredExecutor),
    Unix(UnixExecutor),
    Daily(DailyExecutor),
}

/// Fires every `interval` seconds, accumulating elapsed time and reducing
/// modulo the interval on overflow. Never unregisters itself.
pub struct TimedExecutor {
    interval: f64,
    passed: f64,
    callback: TickFn,
}

impl TimedExecutor {
    pub fn new(interval: f64, callback: TickFn) -> Self {
        Self {
            interval,
            passed: 0.0,
            callback,
        }
    }
}

impl Tick for TimedExecutor {
    fn tick(&mut self, _now: f64, dt: f64) -> bool {
        self.passed += dt;
        if self.passed > self.interval {
            self.passed %= self.interval;
            (self.callback)();
        }
        true
    }
}

/// Counts down `wait` seconds, fires once and unregisters.
pub struct DeferredExecutor {
    remaining: f64,
    callback: TickFn,
}

impl DeferredExecutor {
    pub fn new(wait: f64, callback: TickFn) -> Self {
        Self {
            remaining: wait,
            callback,
        }
    }
}

impl Tick for DeferredExecutor {
    fn tick(&mut self, _now: f64, dt: f64) -> bool {
        self.remaining -= dt;
        if self.remaining <= 0.0 {
            (self.callback)();
            return false;
        }
        true
    }
}

/// Fires once the wall clock reaches `target` (unix seconds), then
/// unregisters.
pub struct UnixExecutor {
    target: f64,
    callback: TickFn,
}

impl UnixExecutor {
    pub fn new(target: f64, callback: TickFn) -> Self {
        Self { target, callback }
    }
}

impl Tick for UnixExecutor {
    fn tick(&mut self, now: f64, _dt: f64) -> bool {
        if now >= self.target {
            (self.callback)();
            return false;
        }
        true
    }
}

/// Fires at the next local occurrence of a time of day, then re-arms for
/// the following day. Default target 02:00.
pub struct DailyExecutor {
    hour: u32,
    minute: u32,
    next: f64,
    callback: TickFn,
}

impl DailyExecutor {
    pub fn new(hour: u32, minute: u32, callback: TickFn) -> Self {
        let next = next_occurrence(now_epoch(), hour, minute);
        Self {
            hour,
            minute,
            next,
            callback,
        }
    }

    pub fn new_default(callback: TickFn) -> Self {
        Self::new(2, 0, callback)
    }
}

impl Tick for DailyExecutor {
    fn tick(&mut self, now: f64, _dt: f64) -> bool {
        if now >= self.next {
            (self.callback)();
            self.next = next_occurrence(now, self.hour, self.minute);
        }
        true
    }
}

/// Unix timestamp of the next local `hour:minute` strictly after `now`.
pub fn next_occurrence(now: f64, hour: u32, minute: u32) -> f64 {
    let now_local = match Local.timestamp_opt(now as i64, 0).earliest() {
        Some(t) => t,
        None => return now + 24.0 * 3600.0,
    };

    let today = now_local
        .with_hour(hour)
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0));

    match today {
        Some(target) if target.timestamp() as f64 > now => target.timestamp() as f64,
        Some(target) => target.timestamp() as f64 + 24.0 * 3600.0,
        None => now + 24.0 * 3600.0,
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// The scheduler service. Owned by the process entry point and handed to
/// whoever needs to register work; there is no global instance.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    entries: Mutex<Vec<(ExecutorId, Executor)>>,
    pending_remove: Mutex<HashSet<ExecutorId>>,
    next_id: AtomicU64,
    running: AtomicBool,
    last_tick: Mutex<f64>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                entries: Mutex::new(Vec::new()),
                pending_remove: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(1),
                running: AtomicBool::new(false),
                last_tick: Mutex::new(now_epoch()),
            }),
        }
    }

    /// Registers an executor, preserving insertion order. Safe to call from
    /// inside a ticking callback.
    pub fn register(&self, executor: Executor) -> ExecutorId {
        let id = ExecutorId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.push((id, executor));
        }
        id
    }

    /// Removes an executor by identity. Safe to call from inside a ticking
    /// callback; removal then takes effect at the end of the pass.
    pub fn unregister(&self, id: ExecutorId) {
        if let Ok(mut pending) = self.inner.pending_remove.lock() {
            pending.insert(id);
        }
        if let Ok(mut entries) = self.inner.entries.lock() {
            entries.retain(|(entry_id, _)| *entry_id != id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one scheduler pass. Entries are swapped out of the lock so
    /// callbacks may register or unregister without deadlocking.
    pub fn tick_all(&self) {
        let now = now_epoch();
        let dt = {
            let mut last = match self.inner.last_tick.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let dt = now - *last;
            *last = now;
            dt
        };

        let mut current = match self.inner.entries.lock() {
            Ok(mut entries) => std::mem::take(&mut *entries),
            Err(_) => return,
        };

        let mut retained = Vec::with_capacity(current.len());
        for (id, mut executor) in current.drain(..) {
            let keep = executor.tick(now, dt);
            if keep {
                retained.push((id, executor));
            }
        }

        let removed: HashSet<ExecutorId> = self
            .inner
            .pending_remove
            .lock()
            .map(|mut pending| std::mem::take(&mut *pending))
            .unwrap_or_default();

        if let Ok(mut entries) = self.inner.entries.lock() {
            // Entries registered during the pass are sitting in the vec now;
            // keep them after the survivors to preserve insertion order.
            let added = std::mem::take(&mut *entries);
            retained.extend(added);
            retained.retain(|(id, _)| !removed.contains(id));
            *entries = retained;
        }
    }

    /// Starts the ticker thread.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut last) = self.inner.last_tick.lock() {
            *last = now_epoch();
        }

        let scheduler = self.clone();
        let spawned = thread::Builder::new()
            .name("Scheduler".to_string())
            .spawn(move || {
                while scheduler.inner.running.load(Ordering::SeqCst) {
                    scheduler.tick_all();
                    thread::sleep(TICK_SLEEP);
                }
            });
        if let Err(e) = spawned {
            warn!("failed to spawn scheduler thread: {e}");
            self.inner.running.store(false, Ordering::SeqCst);
        }
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
