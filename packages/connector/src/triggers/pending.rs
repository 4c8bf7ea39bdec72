use std::collections::{HashMap, VecDeque};

use alloy_primitives::B256;
use alloy_rpc_types_eth::Log;

/// Logs of one chain held back until `depth` newer blocks have been processed
///
/// A log flagged `removed` retracts every held log with the same block hash,
/// and keeps later arrivals for that hash out too. Only released logs get decoded.
#[derive(Debug)]
pub struct PendingLogWindow {
    depth: u64,
    held: VecDeque<Log>,
    seen_ids: HashMap<LogId, u64>,
    retracted: HashMap<B256, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct LogId {
    block_hash: B256,
    transaction_hash: Option<B256>,
    log_index: Option<u64>,
}

impl LogId {
    fn of(log: &Log) -> Option<Self> {
        Some(Self {
            block_hash: log.block_hash?,
            transaction_hash: log.transaction_hash,
            log_index: log.log_index,
        })
    }
}

impl PendingLogWindow {
    pub fn new(depth: u64) -> Self {
        Self {
            depth,
            held: VecDeque::new(),
            seen_ids: HashMap::new(),
            retracted: HashMap::new(),
        }
    }

    /// Applies the batch's removals, then holds on to the rest
    pub fn ingest(&mut self, logs: impl IntoIterator<Item = Log>) {
        let logs: Vec<Log> = logs.into_iter().collect();

        for log in logs.iter().filter(|log| log.removed) {
            if let (Some(hash), Some(number)) = (log.block_hash, log.block_number) {
                self.retract(hash, number);
            }
        }

        for log in logs {
            if log.removed {
                continue;
            }
            // pending logs carry no block, nothing to de-duplicate on
            if let Some(id) = LogId::of(&log) {
                if self.retracted.contains_key(&id.block_hash) || self.seen_ids.contains_key(&id) {
                    continue;
                }
                self.seen_ids
                    .insert(id, log.block_number.unwrap_or_default());
            }
            self.held.push_back(log);
        }
    }

    /// Hands out, in arrival order, the held logs that are `depth` blocks below `newest`
    pub fn release(&mut self, newest: u64) -> Vec<Log> {
        let depth = self.depth;
        let (released, held): (Vec<Log>, Vec<Log>) = self
            .held
            .drain(..)
            .partition(|log| log.block_number.unwrap_or_default().saturating_add(depth) <= newest);
        self.held = held.into();

        let horizon = newest.saturating_sub(self.depth);
        self.seen_ids.retain(|_, number| *number >= horizon);
        self.retracted.retain(|_, number| *number >= horizon);

        released
    }

    fn retract(&mut self, block_hash: B256, block_number: u64) {
        tracing::debug!("EVM: retracting logs of reorged block {block_number} ({block_hash})");
        self.retracted.insert(block_hash, block_number);
        self.held.retain(|log| log.block_hash != Some(block_hash));
        self.seen_ids.retain(|id, _| id.block_hash != block_hash);
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }
}

#[cfg(test)]
mod test {
    use alloy_primitives::{Address, Bytes};
    use utils::test_utils::mock_chain::mock_log;

    use super::*;

    fn log(block_number: u64, log_index: u64) -> Log {
        mock_log(
            Address::with_last_byte(1),
            vec![B256::with_last_byte(0xee)],
            Bytes::new(),
            block_number,
            log_index,
        )
    }

    fn numbers(logs: &[Log]) -> Vec<(u64, u64)> {
        logs.iter()
            .map(|log| (log.block_number.unwrap(), log.log_index.unwrap()))
            .collect()
    }

    #[test]
    fn logs_are_held_until_confirmed() {
        let mut window = PendingLogWindow::new(2);
        window.ingest([log(10, 0), log(10, 1)]);

        assert!(window.release(10).is_empty());
        assert!(window.release(11).is_empty());
        assert_eq!(window.len(), 2);
        assert_eq!(numbers(&window.release(12)), vec![(10, 0), (10, 1)]);
        assert!(window.is_empty());
    }

    #[test]
    fn removed_log_retracts_its_block() {
        let mut window = PendingLogWindow::new(3);

        let mut removed = log(10, 5);
        removed.removed = true;

        window.ingest([log(10, 0), log(10, 1), removed, log(11, 0)]);
        assert_eq!(numbers(&window.release(14)), vec![(11, 0)]);
    }

    #[test]
    fn removal_in_a_later_batch_retracts_held_logs() {
        let mut window = PendingLogWindow::new(3);
        window.ingest([log(10, 0), log(10, 1)]);
        assert!(window.release(11).is_empty());

        let mut removed = log(10, 0);
        removed.removed = true;
        window.ingest([removed, log(12, 0)]);
        assert_eq!(window.len(), 1);

        // late arrivals for the retracted block stay out too
        window.ingest([log(10, 2)]);
        assert_eq!(numbers(&window.release(15)), vec![(12, 0)]);
    }

    #[test]
    fn duplicates_are_held_once() {
        let mut window = PendingLogWindow::new(1);
        window.ingest([log(10, 0)]);
        window.ingest([log(10, 0)]);
        assert_eq!(window.release(11).len(), 1);

        window.ingest([log(20, 0)]);
        assert!(window.release(20).is_empty());
        assert_eq!(window.len(), 1);
    }
}
