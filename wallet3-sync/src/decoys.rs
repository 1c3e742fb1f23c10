//! Decoy selection for ring construction.
//!
//! Indices are drawn from the output age distribution observed for real spends: the age in
//! seconds follows `exp(Gamma(19.28, 1/1.61))`, which is then mapped to a global output index by
//! the average time between outputs. Recent outputs are therefore far more likely than old ones.

use std::collections::{BTreeSet, HashSet};

use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::error::DecoyError;

const GAMMA_SHAPE: f64 = 19.28;
const GAMMA_SCALE: f64 = 1.0 / 1.61;
/// Seconds an output is locked after being mined
const DEFAULT_UNLOCK_TIME: f64 = 10.0 * 120.0;
/// Outputs younger than the unlock time are redrawn uniformly from this recent window
const RECENT_SPEND_WINDOW: f64 = 15.0 * 120.0;
/// Default average seconds between consecutive global outputs
pub const DEFAULT_SECONDS_PER_OUTPUT: f64 = 6.0;
const MAX_ATTEMPTS_PER_DECOY: usize = 50;

/// Samples decoy global output indices from `[min_index, highest_known_output_index]`.
///
/// The upper bound only moves when [`DecoySelector::update_output_count`] is called. Outputs
/// created after the last refresh are never picked, so callers refresh before building rings.
#[derive(Debug, Clone)]
pub struct DecoySelector {
    min_index: u64,
    end_index: u64,
    seconds_per_output: f64,
    gamma: Gamma<f64>,
}

impl DecoySelector {
    /// Selector over the inclusive index range `[min_index, max_index]`
    pub fn new(min_index: u64, max_index: u64) -> Self {
        Self {
            min_index,
            end_index: max_index.saturating_add(1),
            seconds_per_output: DEFAULT_SECONDS_PER_OUTPUT,
            gamma: Gamma::new(GAMMA_SHAPE, GAMMA_SCALE).expect("gamma parameters are positive"),
        }
    }

    /// Selector over every output of a chain holding `output_count` outputs
    pub fn from_output_count(output_count: u64) -> Self {
        let mut selector = Self::new(0, 0);
        selector.update_output_count(output_count);
        selector
    }

    /// Sets the average time between outputs used to turn ages into indices
    pub fn with_seconds_per_output(mut self, seconds_per_output: f64) -> Self {
        if seconds_per_output.is_finite() && seconds_per_output > 0.0 {
            self.seconds_per_output = seconds_per_output;
        }
        self
    }

    /// Moves the upper bound to the last output of a chain holding `output_count` outputs
    pub fn update_output_count(&mut self, output_count: u64) {
        if output_count != self.end_index {
            tracing::debug!(
                "Decoy output range updated from {} to {} outputs",
                self.end_index,
                output_count
            );
        }
        self.end_index = output_count;
    }

    /// Highest selectable index, `None` when the range is empty
    pub fn highest_known_output_index(&self) -> Option<u64> {
        self.end_index
            .checked_sub(1)
            .filter(|highest| *highest >= self.min_index)
    }

    /// Number of selectable indices
    pub fn universe(&self) -> u64 {
        self.end_index.saturating_sub(self.min_index)
    }

    fn contains(&self, index: u64) -> bool {
        (self.min_index..self.end_index).contains(&index)
    }

    /// Returns `count` distinct indices, none of them in `exclude`
    pub fn select(&self, count: usize, exclude: &HashSet<u64>) -> Result<BTreeSet<u64>, DecoyError> {
        self.select_with_rng(count, exclude, &mut rand::thread_rng())
    }

    /// [`DecoySelector::select`] with a caller supplied random source
    pub fn select_with_rng<R>(
        &self,
        count: usize,
        exclude: &HashSet<u64>,
        rng: &mut R,
    ) -> Result<BTreeSet<u64>, DecoyError>
    where
        R: Rng + ?Sized,
    {
        let excluded = exclude.iter().filter(|index| self.contains(**index)).count();
        let universe = self.universe();
        if (count as u64).saturating_add(excluded as u64) > universe {
            return Err(DecoyError::NoDecoysAvailable {
                requested: count,
                excluded,
                universe,
            });
        }

        let mut picks = BTreeSet::new();
        let Some(highest) = self.highest_known_output_index() else {
            return Ok(picks);
        };

        let mut attempts = 0;
        while picks.len() < count && attempts < count * MAX_ATTEMPTS_PER_DECOY {
            attempts += 1;
            match self.sample_index(rng, highest) {
                Some(index) if index >= self.min_index && !exclude.contains(&index) => {
                    picks.insert(index);
                }
                _ => {}
            }
        }

        if picks.len() < count {
            tracing::debug!(
                "Gamma sampling found {} of {} decoys, filling the rest uniformly",
                picks.len(),
                count
            );
            // terminates: the range holds at least `count` indices outside `exclude`
            while picks.len() < count {
                let index = rng.gen_range(self.min_index..self.end_index);
                if !exclude.contains(&index) {
                    picks.insert(index);
                }
            }
        }

        Ok(picks)
    }

    fn sample_index<R>(&self, rng: &mut R, highest: u64) -> Option<u64>
    where
        R: Rng + ?Sized,
    {
        let mut age = self.gamma.sample(rng).exp();
        if age > DEFAULT_UNLOCK_TIME {
            age -= DEFAULT_UNLOCK_TIME;
        } else {
            age = rng.gen_range(0.0..RECENT_SPEND_WINDOW);
        }
        // saturating float cast, overflowing ages fall out of range below
        let offset = (age / self.seconds_per_output) as u64;
        highest.checked_sub(offset)
    }
}
