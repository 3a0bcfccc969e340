// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Bounded bisection of a register toward a target brightness.
use log::debug;

use crate::image::Image;

/// How the measured level moves as a register value increases.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    Rising,
    Falling,
}

/// A brightness level and the tolerance around it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Target {
    pub level: u8,
    pub margin: u8,
}

impl Target {
    pub fn contains(&self, mean: f32) -> bool {
        (mean - self.level as f32).abs() <= self.margin as f32
    }

    /// Distance from the target level.
    pub fn error(&self, mean: f32) -> f32 {
        (mean - self.level as f32).abs()
    }
}

/// Where a channel's search stands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    Pending,

    /// The last candidate landed within the target margin.
    Converged,

    /// The interval shrank to a single value without reaching the target.
    Collapsed,
}

/// Bisection state for one channel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSearch {
    /// The full range the register accepts.
    range: (u8, u8),
    bottom: u8,
    top: u8,
    candidate: u8,
    response: Response,
    target: Target,

    /// Candidate with the smallest error so far, and that error.
    best: Option<(u8, f32)>,

    outcome: Outcome,
    observations: usize,
}

impl ChannelSearch {
    /// Start a search over the inclusive range `bounds`.
    pub fn new(bounds: (u8, u8), response: Response, target: Target) -> Self {
        let (bottom, top) = if bounds.0 <= bounds.1 {
            bounds
        } else {
            (bounds.1, bounds.0)
        };
        Self {
            range: (bottom, top),
            bottom,
            top,
            candidate: midpoint(bottom, top),
            response,
            target,
            best: None,
            outcome: Outcome::Pending,
            observations: 0,
        }
    }

    /// The value to measure next.
    pub fn candidate(&self) -> u8 {
        self.candidate
    }

    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    pub fn is_done(&self) -> bool {
        self.outcome != Outcome::Pending
    }

    pub fn observations(&self) -> usize {
        self.observations
    }

    /// The value to use: the converged candidate, or the best one seen.
    pub fn value(&self) -> u8 {
        match (self.outcome, self.best) {
            (Outcome::Converged, _) | (_, None) => self.candidate,
            (_, Some((best, _))) => best,
        }
    }

    /// Record the level measured with the current candidate.
    pub fn observe(&mut self, mean: f32) -> Outcome {
        if self.is_done() {
            return self.outcome;
        }
        self.observations += 1;
        let error = self.target.error(mean);
        if self.best.map_or(true, |(_, best_error)| error < best_error) {
            self.best = Some((self.candidate, error));
        }
        if self.target.contains(mean) {
            self.outcome = Outcome::Converged;
        } else if self.bottom == self.top {
            self.outcome = Outcome::Collapsed;
        } else {
            // Too bright with a rising response, or too dark with a falling one, means the
            // register has to come down.
            let too_bright = mean > self.target.level as f32;
            let lower = too_bright == (self.response == Response::Rising);
            if lower {
                self.top = self.candidate.saturating_sub(1).max(self.bottom);
            } else {
                self.bottom = self.candidate.saturating_add(1).min(self.top);
            }
            self.candidate = midpoint(self.bottom, self.top);
        }
        self.outcome
    }

    /// Step a converged value by one toward the target, for when another channel has pushed it
    /// off. Returns the new value, which never leaves the range the search started with.
    pub fn nudge(&mut self, mean: f32) -> u8 {
        let too_bright = mean > self.target.level as f32;
        let lower = too_bright == (self.response == Response::Rising);
        let (min, max) = self.range;
        self.candidate = if lower {
            self.candidate.saturating_sub(1).max(min)
        } else {
            self.candidate.saturating_add(1).min(max)
        };
        self.candidate
    }
}

fn midpoint(bottom: u8, top: u8) -> u8 {
    bottom + (top - bottom) / 2
}

/// The result of tuning a register.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tuned<T> {
    pub value: T,

    /// Measurements taken.
    pub passes: usize,

    /// Channels that never landed within the target margin.
    pub unconverged: Vec<usize>,

    /// The last strip measured, when the search scanned strips.
    pub strip: Option<Image<u8>>,
}

impl<T> Tuned<T> {
    pub fn converged(&self) -> bool {
        self.unconverged.is_empty()
    }
}

/// Bisect a single register.
///
/// `measure` sets the register to the given value and returns the resulting level.
pub fn bisect<E, F>(
    bounds: (u8, u8),
    response: Response,
    target: Target,
    max_passes: usize,
    mut measure: F,
) -> Result<Tuned<u8>, E>
where
    F: FnMut(u8) -> Result<f32, E>,
{
    let mut search = ChannelSearch::new(bounds, response, target);
    while !search.is_done() && search.observations() < max_passes {
        let candidate = search.candidate();
        let mean = measure(candidate)?;
        debug!("candidate {} measured {:.1}", candidate, mean);
        search.observe(mean);
    }
    Ok(Tuned {
        value: search.value(),
        passes: search.observations(),
        unconverged: if search.outcome() == Outcome::Converged {
            Vec::new()
        } else {
            vec![0]
        },
        strip: None,
    })
}
