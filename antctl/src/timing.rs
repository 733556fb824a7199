// Part of antctl. Copyright 2022-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Cycle timing diagnostics: scheduling latency, execution time and period,
//! each tracked as last/min/max.

/// Timing figures for the cycle loop [ns].  Minima start at `u64::MAX`
/// until the first cycle is recorded.
#[derive(Debug, Clone, Copy)]
pub struct CycleTimeInfo {
    pub period_ns: u64,
    pub exec_ns: u64,
    pub latency_ns: u64,
    pub latency_min_ns: u64,
    pub latency_max_ns: u64,
    pub period_min_ns: u64,
    pub period_max_ns: u64,
    pub exec_min_ns: u64,
    pub exec_max_ns: u64,
}

impl Default for CycleTimeInfo {
    fn default() -> Self {
        CycleTimeInfo {
            period_ns: 0,
            exec_ns: 0,
            latency_ns: 0,
            latency_min_ns: u64::MAX,
            latency_max_ns: 0,
            period_min_ns: u64::MAX,
            period_max_ns: 0,
            exec_min_ns: u64::MAX,
            exec_max_ns: 0,
        }
    }
}

/// Accumulates [`CycleTimeInfo`] for the cycle engine.  O(1) per cycle,
/// no allocation.
#[derive(Debug, Default)]
pub struct TimingMonitor {
    info: CycleTimeInfo,
    last_wake_ns: u64,
}

impl TimingMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the wake-up of a cycle: `wake_ns` is the actual wake time,
    /// `deadline_ns` the planned one.
    pub fn record_wake(&mut self, wake_ns: u64, deadline_ns: u64) {
        let latency = wake_ns.saturating_sub(deadline_ns);
        self.info.latency_ns = latency;
        self.info.latency_min_ns = self.info.latency_min_ns.min(latency);
        self.info.latency_max_ns = self.info.latency_max_ns.max(latency);

        if self.last_wake_ns != 0 {
            let period = wake_ns.saturating_sub(self.last_wake_ns);
            self.info.period_ns = period;
            self.info.period_min_ns = self.info.period_min_ns.min(period);
            self.info.period_max_ns = self.info.period_max_ns.max(period);
        }
        self.last_wake_ns = wake_ns;
    }

    /// Record the work portion of a cycle, from wake to send-done.
    pub fn record_exec(&mut self, wake_ns: u64, done_ns: u64) {
        let exec = done_ns.saturating_sub(wake_ns);
        self.info.exec_ns = exec;
        self.info.exec_min_ns = self.info.exec_min_ns.min(exec);
        self.info.exec_max_ns = self.info.exec_max_ns.max(exec);
    }

    pub fn info(&self) -> CycleTimeInfo {
        self.info
    }
}

/// CLOCK_MONOTONIC in nanoseconds.  Drives the cycle deadlines.
pub fn monotonic_ns() -> u64 {
    clock_ns(libc::CLOCK_MONOTONIC)
}

/// CLOCK_REALTIME in nanoseconds since the epoch.  Stamps snapshots.
pub fn realtime_ns() -> u64 {
    clock_ns(libc::CLOCK_REALTIME)
}

fn clock_ns(clock: libc::clockid_t) -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail for the clocks used here.
    unsafe { libc::clock_gettime(clock, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Sleep until an absolute CLOCK_MONOTONIC deadline.  Absolute deadlines
/// keep the cycle grid drift-free regardless of execution jitter.
pub fn sleep_until_ns(deadline_ns: u64) {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / 1_000_000_000) as libc::time_t,
        tv_nsec: (deadline_ns % 1_000_000_000) as libc::c_long,
    };
    loop {
        let r = unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        };
        if r != libc::EINTR {
            break;
        }
    }
}
