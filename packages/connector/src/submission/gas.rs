use std::{future::Future, time::Duration};

/// Cheapest possible transaction
pub const GAS_FLOOR: u64 = 21_000;
pub const GAS_CEILING: u64 = 30_000_000;
/// Bisecting stops once the window is this narrow
pub const GAS_TOLERANCE: u64 = 10_000;
pub const MAX_PROBES: u32 = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    /// Simulate with this gas limit and [`GasProbe::record`] the outcome
    Probe(u64),
    Done(u64),
    Failed(ProbeFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeFailure {
    /// Even the ceiling wasn't enough
    Ceiling,
    TooManyProbes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Trying the node's estimate first
    Start,
    /// Growing ×1.5 until a probe succeeds
    Grow,
    /// Narrowing `lo..=hi` down to the tolerance
    Bisect,
    Done(u64),
    Failed(ProbeFailure),
}

/// Finds a gas limit that is known to succeed and at most [`GAS_TOLERANCE`]
/// above the lowest failure
///
/// `lo` is always a limit that failed (or lies below [`GAS_FLOOR`], where every call fails),
/// `hi` one that succeeded, so the answer never fails.
#[derive(Debug, Clone)]
pub struct GasProbe {
    phase: Phase,
    next: u64,
    lo: u64,
    hi: u64,
    probes: u32,
}

impl GasProbe {
    pub fn new(estimate: u64) -> Self {
        let start = estimate.clamp(GAS_FLOOR, GAS_CEILING);
        Self {
            phase: Phase::Start,
            next: start,
            lo: 0,
            hi: GAS_CEILING,
            probes: 0,
        }
    }

    pub fn step(&self) -> ProbeStep {
        match self.phase {
            Phase::Done(gas) => ProbeStep::Done(gas),
            Phase::Failed(failure) => ProbeStep::Failed(failure),
            _ => ProbeStep::Probe(self.next),
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes
    }

    pub fn record(&mut self, gas: u64, succeeded: bool) {
        if gas != self.next || matches!(self.phase, Phase::Done(_) | Phase::Failed(_)) {
            return;
        }
        self.probes += 1;

        match (self.phase, succeeded) {
            (Phase::Start, true) => {
                if gas <= GAS_FLOOR {
                    self.phase = Phase::Done(gas);
                    return;
                }
                // node estimates run high, narrow down from there
                self.lo = GAS_FLOOR - 1;
                self.hi = gas;
                self.phase = Phase::Bisect;
            }
            (Phase::Start | Phase::Grow, false) => {
                self.lo = gas;
                if gas >= GAS_CEILING {
                    self.phase = Phase::Failed(ProbeFailure::Ceiling);
                    return;
                }
                self.phase = Phase::Grow;
                self.next = (gas.saturating_mul(3) / 2).max(gas + 1).min(GAS_CEILING);
            }
            (Phase::Grow, true) => {
                self.hi = gas;
                self.phase = Phase::Bisect;
            }
            (Phase::Bisect, true) => self.hi = gas,
            (Phase::Bisect, false) => self.lo = gas,
            (Phase::Done(_) | Phase::Failed(_), _) => return,
        }

        if self.phase == Phase::Bisect {
            if self.hi - self.lo <= GAS_TOLERANCE {
                self.phase = Phase::Done(self.hi);
                return;
            }
            self.next = self.lo + (self.hi - self.lo) / 2;
        }

        if self.probes >= MAX_PROBES {
            self.phase = match self.phase {
                // the upper bound already succeeded
                Phase::Bisect => Phase::Done(self.hi),
                _ => Phase::Failed(ProbeFailure::TooManyProbes),
            };
        }
    }
}

/// Drives a [`GasProbe`] to the end
///
/// A probe that doesn't finish within `timeout` counts as failed. A probe that
/// errors (rather than answering "fails at this limit") ends the search with that error.
pub async fn search<F, Fut, E>(estimate: u64, timeout: Duration, mut probe: F) -> Result<u64, E>
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: From<ProbeFailure>,
{
    let mut search = GasProbe::new(estimate);

    loop {
        match search.step() {
            ProbeStep::Done(gas) => {
                tracing::debug!("EVM: gas {gas} after {} probes", search.probes());
                return Ok(gas);
            }
            ProbeStep::Failed(failure) => return Err(failure.into()),
            ProbeStep::Probe(gas) => {
                let succeeded = match tokio::time::timeout(timeout, probe(gas)).await {
                    Ok(outcome) => outcome?,
                    Err(_) => false,
                };
                search.record(gas, succeeded);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn run(estimate: u64, needed: u64) -> (Result<u64, ProbeFailure>, u32) {
        let mut probe = GasProbe::new(estimate);
        loop {
            match probe.step() {
                ProbeStep::Done(gas) => return (Ok(gas), probe.probes()),
                ProbeStep::Failed(failure) => return (Err(failure), probe.probes()),
                ProbeStep::Probe(gas) => probe.record(gas, gas >= needed),
            }
        }
    }

    #[test]
    fn floor_estimate_that_works_is_kept() {
        // below the floor the floor is probed instead
        assert_eq!(run(0, 21_000), (Ok(21_000), 1));
        assert_eq!(run(21_000, 21_000), (Ok(21_000), 1));
    }

    #[test]
    fn high_estimate_is_narrowed_down() {
        let (gas, probes) = run(100_000, 21_000);
        let gas = gas.unwrap();
        assert!((21_000..=31_000).contains(&gas), "gas {gas}");
        assert!(probes > 1);

        for (estimate, needed) in [(50_000, 40_000), (1_000_000, 30_000), (GAS_CEILING, 500_000)] {
            let gas = run(estimate, needed).0.unwrap();
            assert!(gas >= needed, "{gas} < {needed}");
            assert!(gas - needed <= GAS_TOLERANCE, "{gas} too far above {needed}");
        }
    }

    #[test]
    fn converges_just_above_the_need() {
        for needed in [21_000, 21_001, 25_000, 31_000, 100_000, 1_234_567, 29_999_999] {
            let (gas, probes) = run(21_000, needed);
            let gas = gas.unwrap();
            assert!(gas >= needed, "{gas} < {needed}");
            assert!(gas - needed <= GAS_TOLERANCE, "{gas} too far above {needed}");
            assert!(probes <= MAX_PROBES);
        }

        let (gas, _) = run(10_000, 21_000);
        assert!((21_000..=31_000).contains(&gas.unwrap()));
    }

    #[test]
    fn ceiling_is_terminal() {
        assert_eq!(run(21_000, GAS_CEILING + 1).0, Err(ProbeFailure::Ceiling));
        assert_eq!(run(GAS_CEILING * 2, u64::MAX).0, Err(ProbeFailure::Ceiling));
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_probes_fail() {
        let gas: Result<u64, ProbeFailure> =
            search(21_000, Duration::from_secs(10), |gas| async move {
                if gas < 40_000 {
                    // hangs, e.g. an unresponsive node
                    std::future::pending::<()>().await;
                }
                Ok(true)
            })
            .await;

        assert!((40_000..=50_000).contains(&gas.unwrap()));
    }

    #[derive(Debug, PartialEq)]
    enum NodeError {
        Gone,
        Search(ProbeFailure),
    }

    impl From<ProbeFailure> for NodeError {
        fn from(failure: ProbeFailure) -> Self {
            NodeError::Search(failure)
        }
    }

    #[tokio::test]
    async fn node_errors_end_the_search() {
        let mut probed = Vec::new();
        let result = search(21_000, Duration::from_secs(10), |gas| {
            probed.push(gas);
            async move {
                if gas > 21_000 {
                    Err(NodeError::Gone)
                } else {
                    Ok(false)
                }
            }
        })
        .await;

        assert_eq!(result, Err(NodeError::Gone));
        // no growing towards the ceiling on errors
        assert_eq!(probed.len(), 2);

        let result: Result<u64, NodeError> =
            search(21_000, Duration::from_secs(10), |_| async { Ok(false) }).await;
        assert_eq!(result, Err(NodeError::Search(ProbeFailure::Ceiling)));
    }
}
