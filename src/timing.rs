//! Retransmission timers.
//!
//! A hashed timing wheel keyed by an absolute tick cursor: time is divided
//! into fixed-granularity ticks, a timer lands in the slot for its deadline
//! tick, and advancing sweeps every tick between the cursor and now.
//! Deadlines past the wheel's horizon park in the furthest slot and are
//! re-examined once per rotation until they come due.
//!
//! Timestamps are microseconds from a process-wide [`minstant`] anchor, so
//! the clock is TSC-backed rather than wall time.

use std::sync::OnceLock;

/// Entry in the timing wheel.
#[derive(Debug, Clone, Copy)]
pub struct TimerEntry {
    /// Local session number.
    pub session_num: u16,
    /// Slot index within the session.
    pub sslot_idx: usize,
    /// Request number the timer guards.
    pub req_num: u64,
    /// Expiration timestamp (microseconds).
    pub expires_at: u64,
    /// Packets received for the slot when the timer was armed. A slot that
    /// made progress past this mark re-arms instead of counting a retry.
    pub rx_mark: u16,
}

/// Hashed timing wheel.
pub struct TimingWheel {
    slots: Vec<Vec<TimerEntry>>,
    granularity_us: u64,
    /// Last tick the wheel has swept through.
    cursor: u64,
    horizon_us: u64,
}

impl TimingWheel {
    /// Create a wheel of `num_slots` ticks of `granularity_us` each.
    pub fn new(num_slots: usize, granularity_us: u64) -> Self {
        Self {
            slots: vec![Vec::new(); num_slots],
            granularity_us,
            cursor: 0,
            horizon_us: num_slots as u64 * granularity_us,
        }
    }

    /// Wheel sized for RTO tracking: 256 ticks of 100us = 25.6ms coverage.
    pub fn default_for_rpc() -> Self {
        Self::new(256, 100)
    }

    /// Place the cursor at a starting timestamp.
    pub fn init(&mut self, ts: u64) {
        self.cursor = ts / self.granularity_us;
    }

    #[inline]
    fn slot_of(&self, tick: u64) -> usize {
        (tick % self.slots.len() as u64) as usize
    }

    /// File a timer. Returns false if the deadline already passed.
    pub fn insert(&mut self, entry: TimerEntry) -> bool {
        let cursor_us = self.cursor * self.granularity_us;
        if entry.expires_at <= cursor_us {
            return false;
        }
        // Deadlines beyond the horizon park one rotation out; the sweep
        // re-files them until they fit
        let filed_at = entry.expires_at.min(cursor_us + self.horizon_us);
        let tick = (filed_at / self.granularity_us).max(self.cursor + 1);
        let idx = self.slot_of(tick);
        self.slots[idx].push(entry);
        true
    }

    /// Sweep the cursor up to `ts`, pushing due entries into `due`. The
    /// buffer is not cleared.
    pub fn advance_into(&mut self, ts: u64, due: &mut Vec<TimerEntry>) {
        let target = ts / self.granularity_us;
        if target <= self.cursor {
            return;
        }
        // A jump past a full rotation still only needs each slot once
        let steps = (target - self.cursor).min(self.slots.len() as u64);
        let mut refile: Vec<TimerEntry> = Vec::new();
        for step in 1..=steps {
            let idx = self.slot_of(self.cursor + step);
            while let Some(entry) = self.slots[idx].pop() {
                if entry.expires_at <= ts {
                    due.push(entry);
                } else {
                    refile.push(entry);
                }
            }
        }
        self.cursor = target;
        for entry in refile {
            let filed_at = entry.expires_at.min(ts + self.horizon_us);
            let tick = (filed_at / self.granularity_us).max(self.cursor + 1);
            let idx = self.slot_of(tick);
            self.slots[idx].push(entry);
        }
    }

    /// Sweep the cursor up to `ts`, returning due entries in a fresh Vec.
    pub fn advance(&mut self, ts: u64) -> Vec<TimerEntry> {
        let mut due = Vec::new();
        self.advance_into(ts, &mut due);
        due
    }

    /// Remove the timer guarding (session, slot, request). Returns whether
    /// one was found. Linear over the wheel; request windows are small
    /// enough that this never shows up in profiles.
    pub fn cancel(&mut self, session_num: u16, sslot_idx: usize, req_num: u64) -> bool {
        for slot in &mut self.slots {
            let before = slot.len();
            slot.retain(|e| {
                e.session_num != session_num || e.sslot_idx != sslot_idx || e.req_num != req_num
            });
            if slot.len() != before {
                return true;
            }
        }
        false
    }

    /// Number of filed timers.
    pub fn active_count(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }

    /// Check if no timers are filed.
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Vec::is_empty)
    }
}

/// Microseconds since the process-wide anchor.
#[inline]
pub fn now_us() -> u64 {
    static ANCHOR: OnceLock<minstant::Instant> = OnceLock::new();
    let anchor = ANCHOR.get_or_init(minstant::Instant::now);
    anchor.elapsed().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(req_num: u64, expires_at: u64) -> TimerEntry {
        TimerEntry {
            session_num: 3,
            sslot_idx: 1,
            req_num,
            expires_at,
            rx_mark: 0,
        }
    }

    fn wheel_at(ts: u64) -> TimingWheel {
        let mut wheel = TimingWheel::new(8, 100);
        wheel.init(ts);
        wheel
    }

    #[test]
    fn fires_only_after_deadline() {
        let mut wheel = wheel_at(1000);
        assert!(wheel.insert(guard(7, 1450)));

        assert!(wheel.advance(1400).is_empty());
        let due = wheel.advance(1500);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].req_num, 7);
        assert!(wheel.is_empty());
    }

    #[test]
    fn expired_deadline_not_filed() {
        let mut wheel = wheel_at(1000);
        assert!(!wheel.insert(guard(1, 900)));
        assert_eq!(wheel.active_count(), 0);
    }

    #[test]
    fn cancel_removes_exactly_one_arming() {
        let mut wheel = wheel_at(0);
        wheel.insert(guard(5, 250));
        wheel.insert(guard(6, 250));

        assert!(wheel.cancel(3, 1, 5));
        assert!(!wheel.cancel(3, 1, 5));
        assert_eq!(wheel.active_count(), 1);
        assert_eq!(wheel.advance(300)[0].req_num, 6);
    }

    #[test]
    fn far_deadline_survives_rotations() {
        // Horizon is 800us; a 2.5ms deadline parks and re-files
        let mut wheel = wheel_at(0);
        wheel.insert(guard(9, 2500));

        assert!(wheel.advance(800).is_empty());
        assert!(wheel.advance(1600).is_empty());
        assert!(wheel.advance(2400).is_empty());
        let due = wheel.advance(3200);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].req_num, 9);
    }

    #[test]
    fn large_jump_sweeps_every_slot_once() {
        let mut wheel = wheel_at(0);
        for i in 0..5u64 {
            wheel.insert(guard(i, 100 + i * 150));
        }
        // One advance far past everything collects the lot
        assert_eq!(wheel.advance(10_000).len(), 5);
    }

    #[test]
    fn now_us_is_monotonic() {
        let a = now_us();
        let b = now_us();
        assert!(b >= a);
    }
}
