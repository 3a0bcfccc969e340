// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Calibration and image reconstruction for CCD and CIS line-sensor scanners.
//!
//! A line sensor reads one row of the page at a time while a motor moves the head (or the page)
//! past it. Turning that into a usable image takes more work than it sounds like: the analog
//! front end has to be tuned before every session, every column of the sensor sees a slightly
//! different amount of light, and on colour sensors the red, green and blue rows are physically
//! offset from each other, so each channel sees a given line of the page at a different time.
//! This crate handles all of that, and hands back plain gray, colour or lineart rows.
//!
//! # High-Level API
//! ```no_run
//! # use embedded_hal::blocking::{delay::DelayMs, i2c};
//! use linescan::{BusTransport, ColorMode, ScanRequest, Scanner};
//! # fn scan<I2C, D>(bus: I2C, delay: D) -> Result<(), linescan::Error>
//! # where
//! #     I2C: i2c::Write + i2c::Read,
//! #     <I2C as i2c::Write>::Error: core::fmt::Debug,
//! #     <I2C as i2c::Read>::Error: core::fmt::Debug,
//! #     D: DelayMs<u32>,
//! # {
//! let transport = BusTransport::new(bus, 0x2A);
//! let mut scanner = Scanner::open("ls600", transport, delay)?;
//! // A letter size page in colour, at 300 dpi.
//! let plan = scanner.configure(ScanRequest::new(2550, 3300, 300, ColorMode::Color))?;
//! let session = scanner.start()?;
//! let mut row = Vec::with_capacity(plan.bytes_per_line);
//! loop {
//!     let chunk = scanner.read(session, plan.bytes_per_line - row.len())?;
//!     row.extend_from_slice(&chunk.bytes);
//!     if row.len() == plan.bytes_per_line {
//!         // Do something with the row.
//!         row.clear();
//!     }
//!     if chunk.is_final {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```
//! [`Scanner::start`] does a lot before it returns. It finds the physical origin of the bed and
//! the left edge of the sensor's usable area, tunes the front end's offsets and gains against the
//! calibration strips, measures a shading table, then programs the scan and starts it. After
//! that, each [`Scanner::read`] is at most one data exchange with the device.
//!
//! # Transports
//! The library only needs an ordered byte channel to the scanner, described by [`Transport`].
//! [`BusTransport`] implements it over the [`embedded-hal`][embedded-hal] blocking I²C traits.
//!
//! [embedded-hal]: https://docs.rs/embedded-hal/0.2/embedded_hal/blocking/i2c/index.html
//!
//! # Low-Level API
//! Each stage is usable on its own. [`geometry::resolve`] turns a request into a [`ScanPlan`],
//! the [`calibration`] module has each calibration step as a function over a
//! [`Device`][protocol::Device], and [`decode::Decoder`] turns raw blocks into rows given a plan
//! and a shading table. New models are described with a [`DeviceProfile`].
//!
//! # Logging
//! Everything is logged through the [`log`](https://docs.rs/log) facade. State transitions are
//! `info`, calibration passes are `debug`, and individual exchanges are `trace`. No logger is
//! installed by this crate.

pub mod calibration;
pub mod decode;
pub mod driver;
pub mod error;
pub mod geometry;
pub mod image;
pub mod locate;
pub mod options;
pub mod profile;
pub mod protocol;
pub mod register;
pub mod sequencer;
#[cfg(test)]
mod test;
pub mod transport;
mod util;

pub use calibration::{CalibrationRecord, CalibrationSet, ShadingTable};
pub use driver::{Scanner, SessionId};
pub use error::Error;
pub use geometry::{ScanPlan, ScanRequest};
pub use options::SessionOptions;
pub use profile::{ColorMode, DeviceProfile, Source, PROFILES};
pub use sequencer::{CancelHandle, Chunk, State};
pub use transport::{BusTransport, Transport};
