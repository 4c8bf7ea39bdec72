use std::time::Duration;

use tokio::time::Instant;

/// What the subscriber should do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorStep {
    Fetch(u64),
    /// Too far behind, `from..=to` will never be delivered
    Skip {
        from: u64,
        to: u64,
    },
    Idle,
}

/// Height bookkeeping of the block subscriber, no I/O
///
/// Delivery starts at the first height ever observed and never goes backwards:
/// `next` only moves forward, one height per successful fetch or in one jump on a skip.
#[derive(Debug)]
pub struct BlockCursor {
    latest: Option<u64>,
    next: u64,
    confirmation_lag: u64,
    max_catchup: u64,
    cooldown: Duration,
    cooldown_until: Option<Instant>,
}

impl BlockCursor {
    pub fn new(confirmation_lag: u64, max_catchup: u64, cooldown: Duration) -> Self {
        Self {
            latest: None,
            next: 0,
            confirmation_lag,
            max_catchup,
            cooldown,
            cooldown_until: None,
        }
    }

    pub fn latest(&self) -> Option<u64> {
        self.latest
    }

    pub fn next(&self) -> u64 {
        self.next
    }

    /// Whether `height` is ahead of everything seen so far
    pub fn is_new(&self, height: u64) -> bool {
        self.latest.map(|latest| height > latest).unwrap_or(true)
    }

    /// Returns false for heights at or below the current latest
    pub fn observe(&mut self, height: u64) -> bool {
        match self.latest {
            None => {
                self.latest = Some(height);
                self.next = height;
                true
            }
            Some(latest) if height <= latest => false,
            Some(_) => {
                self.latest = Some(height);
                true
            }
        }
    }

    pub fn next_step(&mut self, now: Instant) -> CursorStep {
        let Some(latest) = self.latest else {
            return CursorStep::Idle;
        };

        if let Some(until) = self.cooldown_until {
            if now < until {
                return CursorStep::Idle;
            }
            self.cooldown_until = None;
        }

        if latest.saturating_sub(self.next) > self.max_catchup {
            let from = self.next;
            self.next = latest;
            return CursorStep::Skip {
                from,
                to: latest - 1,
            };
        }

        if self.next < latest.saturating_sub(self.confirmation_lag) {
            CursorStep::Fetch(self.next)
        } else {
            CursorStep::Idle
        }
    }

    pub fn advance(&mut self, fetched: u64) {
        if fetched == self.next {
            self.next += 1;
        }
    }

    /// The height stays where it is, and catching up pauses for the cooldown
    pub fn failed(&mut self, now: Instant) {
        self.cooldown_until = Some(now + self.cooldown);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn cursor() -> BlockCursor {
        BlockCursor::new(3, 500, Duration::from_secs(5))
    }

    fn drain(cursor: &mut BlockCursor, now: Instant) -> Vec<u64> {
        let mut fetched = Vec::new();
        while let CursorStep::Fetch(height) = cursor.next_step(now) {
            cursor.advance(height);
            fetched.push(height);
        }
        fetched
    }

    #[test]
    fn starts_at_first_height_and_holds_back_lag() {
        let now = Instant::now();
        let mut cursor = cursor();

        assert!(cursor.observe(100));
        assert_eq!(cursor.next_step(now), CursorStep::Idle);

        assert!(cursor.observe(103));
        assert_eq!(cursor.next_step(now), CursorStep::Idle);

        assert!(cursor.observe(105));
        assert_eq!(drain(&mut cursor, now), vec![100, 101]);
        assert!(cursor.next() <= cursor.latest().unwrap() + 1);
    }

    #[test]
    fn stale_heights_are_ignored() {
        let now = Instant::now();
        let mut cursor = cursor();

        cursor.observe(10);
        cursor.observe(20);
        assert!(!cursor.observe(20));
        assert!(!cursor.observe(15));
        assert_eq!(cursor.latest(), Some(20));

        let fetched = drain(&mut cursor, now);
        assert_eq!(fetched, (10..17).collect::<Vec<_>>());
    }

    #[test]
    fn failure_pauses_without_advancing() {
        let now = Instant::now();
        let mut cursor = cursor();

        cursor.observe(10);
        cursor.observe(20);
        assert_eq!(cursor.next_step(now), CursorStep::Fetch(10));
        cursor.failed(now);

        assert_eq!(cursor.next_step(now + Duration::from_secs(4)), CursorStep::Idle);
        assert_eq!(
            cursor.next_step(now + Duration::from_secs(5)),
            CursorStep::Fetch(10)
        );
    }

    #[test]
    fn far_behind_skips_to_head() {
        let now = Instant::now();
        let mut cursor = cursor();

        cursor.observe(1_000);
        cursor.observe(1_600);
        assert_eq!(
            cursor.next_step(now),
            CursorStep::Skip {
                from: 1_000,
                to: 1_599
            }
        );
        assert_eq!(cursor.next(), 1_600);
        assert_eq!(cursor.next_step(now), CursorStep::Idle);

        cursor.observe(1_604);
        assert_eq!(drain(&mut cursor, now), vec![1_600]);
    }
}
