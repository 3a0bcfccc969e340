// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
use core::time::Duration;

use thiserror::Error;

use crate::profile::{ColorMode, Source};

/// Errors from the byte channel to the scanner.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The device didn't answer within the configured timeout.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Fewer bytes came back than were asked for.
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    /// Not every byte of a command could be written.
    #[error("short write: {written} of {expected} bytes written")]
    ShortWrite { expected: usize, written: usize },

    /// The device has no data yet.
    #[error("device not ready")]
    NotReady,

    /// The device answered with a NAK, meaning it lost sync with the command stream.
    #[error("device rejected command {0:#04x}")]
    Rejected(u8),

    /// The reply didn't follow the protocol.
    #[error("unexpected reply {status:#04x} to command {opcode:#04x}")]
    Protocol { opcode: u8, status: u8 },

    /// Errors from the underlying bus implementation.
    #[error("bus error: {0}")]
    Bus(String),
}

impl TransportError {
    /// Whether resending the same exchange has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Rejected(_) | Self::ShortRead { .. })
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// There is no command template for this mode at the resolved resolution.
    #[error("{mode:?} is not supported at {ydpi} dpi")]
    Unsupported { mode: ColorMode, ydpi: u16 },

    #[error("{0:?} is not available on this device")]
    UnsupportedSource(Source),

    #[error("scan area is empty")]
    Empty,

    /// The scan window extends past the usable width of the sensor.
    #[error("scan window ends at native column {end}, past the usable width of {limit}")]
    OutOfBounds { end: usize, limit: usize },
}

/// The individual calibration steps, used to label non-convergence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CalibrationStep {
    Dark,
    Gain,
    Offset,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CalibrationError {
    /// A reference column is either dead or saturated, so no correction can be derived.
    #[error("bad reference data at column {column}, channel {channel}")]
    BadReferenceData { column: usize, channel: usize },

    /// The search ran out of passes before landing in the target window.
    ///
    /// This is reported as a warning, the best candidate is still used.
    #[error("{step:?} calibration of channel {channel} did not converge, using {value}")]
    NotConverged {
        step: CalibrationStep,
        channel: usize,
        value: u8,
    },

    #[error("could not find the origin edge")]
    OriginNotFound,

    #[error("could not find the left margin")]
    MarginNotFound,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough raw data is buffered to finish the requested line.
    #[error("raw line {line} is not complete yet")]
    ShortBlock { line: usize },

    /// More bytes were delivered than the scan should produce.
    #[error("received {received} bytes, but the scan only has {total}")]
    Overrun { received: usize, total: usize },

    /// The scan ended before every output row could be produced.
    #[error("scan ended after {rows} of {expected} rows")]
    Truncated { rows: usize, expected: usize },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("not a calibration record")]
    BadMagic,

    #[error("unsupported calibration record version {0}")]
    UnsupportedVersion(u16),

    #[error("record is for a sensor pitch of {found}, expected {expected}")]
    PitchMismatch { expected: usize, found: usize },

    #[error("record is truncated: {needed} bytes needed, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} unexpected bytes after the record")]
    TrailingBytes(usize),
}

/// Every error this library can return.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// A scan session is already streaming on this handle.
    #[error("a scan is already in progress")]
    Busy,

    /// There's no built-in profile with this id.
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("unknown session {0}")]
    UnknownSession(u32),

    /// `start` was called before `configure`.
    #[error("no scan has been configured")]
    NotConfigured,

    #[error("scan was cancelled")]
    Cancelled,

    /// The transport is in use by a session, or was lost to an earlier failure.
    #[error("device handle is closed")]
    Closed,
}
