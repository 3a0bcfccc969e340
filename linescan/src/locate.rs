// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Finding the physical reference points on the bed.

/// A rising transition between consecutive line levels.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Edge {
    /// The line the transition is centred on.
    pub line: usize,

    /// The difference in level across the transition.
    pub magnitude: f32,
}

/// Find the strongest dark-to-bright transition in a run of line levels.
///
/// The levels are differentiated with a `[-1, 0, 1]` kernel, so the first and last lines can't be
/// an edge.
pub fn find_edge(levels: &[f32]) -> Option<Edge> {
    levels
        .windows(3)
        .enumerate()
        .map(|(index, window)| Edge {
            line: index + 1,
            magnitude: window[2] - window[0],
        })
        .filter(|edge| edge.magnitude > 0.0)
        .fold(None, |strongest: Option<Edge>, edge| match strongest {
            Some(current) if current.magnitude >= edge.magnitude => Some(current),
            _ => Some(edge),
        })
}

/// Find the first column brighter than `threshold`.
pub fn find_margin(line: &[u8], threshold: u8) -> Option<usize> {
    line.iter().position(|sample| *sample > threshold)
}
