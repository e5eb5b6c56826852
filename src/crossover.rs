//! PS/VS crossover detection
//!
//! A crossover at index `i` compares readings `i-1` and `i`. Entry filters for
//! it may only run on candle `i+1`, once the crossing candle has closed.

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::indicators::IndicatorSet;
use crate::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossoverEvent {
    pub direction: Direction,
    pub detected_index: usize,
}

impl CrossoverEvent {
    /// The only candle index at which this crossover may be acted on
    pub fn evaluation_index(&self) -> usize {
        self.detected_index + 1
    }
}

/// Classify the transition between two consecutive readings.
///
/// Indeterminate readings never produce a crossover. If both directions
/// would match at once (only possible with non-finite values slipping
/// through), no signal is produced.
pub fn detect_between(prev: &IndicatorSet, curr: &IndicatorSet) -> Option<Direction> {
    if !prev.is_valid() || !curr.is_valid() {
        return None;
    }

    let up = prev.ps < prev.vs && curr.ps >= curr.vs;
    let down = prev.ps > prev.vs && curr.ps <= curr.vs;

    match (up, down) {
        (true, false) => Some(Direction::Up),
        (false, true) => Some(Direction::Down),
        _ => None,
    }
}

/// Crossover whose source candle is `index` (compares `index-1` → `index`)
pub fn detect_at(sets: &[IndicatorSet], index: usize) -> Option<CrossoverEvent> {
    if index == 0 || index >= sets.len() {
        return None;
    }
    detect_between(&sets[index - 1], &sets[index]).map(|direction| CrossoverEvent {
        direction,
        detected_index: index,
    })
}

/// Crossover that authorizes evaluation at `entry_index`, i.e. one detected
/// on the candle before it.
pub fn pending_for_entry(sets: &[IndicatorSet], entry_index: usize) -> Option<CrossoverEvent> {
    if entry_index == 0 || entry_index >= sets.len() {
        return None;
    }
    detect_at(sets, entry_index - 1)
}

/// Scan the whole sequence
pub fn detect_all(sets: &[IndicatorSet]) -> Vec<CrossoverEvent> {
    sets.iter()
        .tuple_windows()
        .filter_map(|(prev, curr)| {
            detect_between(prev, curr).map(|direction| CrossoverEvent {
                direction,
                detected_index: curr.index,
            })
        })
        .collect()
}
