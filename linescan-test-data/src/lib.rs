// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! A simulated line-sensor scanner, for testing `linescan` without hardware.
//!
//! The simulator speaks the scanner's command protocol over an `embedded-hal` I²C bus, and
//! renders scan data from a simple model of the bed, the lamp, and the analog front end.
mod sim;

pub use sim::{NoopDelay, Pattern, SimConfig, SimError, SimulatedScanner};
