// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! The persisted form of a calibration.
//!
//! All fields are little-endian:
//!
//! | Field | Size |
//! |-------|------|
//! | magic, `LSCB` | 4 |
//! | version | 2 |
//! | sensor pitch | 4 |
//! | black levels | 4 × pitch |
//! | red levels | 4 × pitch |
//! | green levels | 4 × pitch |
//! | blue levels | 4 × pitch |
//! | gains, offsets, shading target, then zero padding | 32 |
//!
//! Levels are per native column, in 24.8 fixed point.
use crate::error::RecordError;
use crate::util::Buffer;

const MAGIC: &[u8; 4] = b"LSCB";
const VERSION: u16 = 1;
const HEADER_LENGTH: usize = 4 + 2 + 4;
const BALANCE_LENGTH: usize = 32;

/// Everything needed to restore a calibration without rescanning the reference strips.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalibrationRecord {
    pub black: Vec<u32>,
    pub red: Vec<u32>,
    pub green: Vec<u32>,
    pub blue: Vec<u32>,
    pub gains: [u8; 3],
    pub offsets: [u8; 3],
    pub shading_target: u8,
}

impl CalibrationRecord {
    /// The number of columns in each level array.
    pub fn pitch(&self) -> usize {
        self.black.len()
    }

    /// Size of an encoded record for a sensor pitch.
    pub fn encoded_len(pitch: usize) -> usize {
        HEADER_LENGTH + 4 * 4 * pitch + BALANCE_LENGTH
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let pitch = self.pitch();
        let mut bytes = Vec::with_capacity(Self::encoded_len(pitch));
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&VERSION.to_le_bytes());
        bytes.extend_from_slice(&(pitch as u32).to_le_bytes());
        for levels in [&self.black, &self.red, &self.green, &self.blue] {
            // Every array is written at the same pitch, so they can be read back unambiguously.
            let padding = core::iter::repeat(&0u32).take(pitch.saturating_sub(levels.len()));
            for level in levels.iter().take(pitch).chain(padding) {
                bytes.extend_from_slice(&level.to_le_bytes());
            }
        }
        let mut balance = [0u8; BALANCE_LENGTH];
        balance[0..3].copy_from_slice(&self.gains);
        balance[3..6].copy_from_slice(&self.offsets);
        balance[6] = self.shading_target;
        bytes.extend_from_slice(&balance);
        bytes
    }

    /// Decode a record, checking it was made for a sensor with `expected_pitch` columns.
    pub fn from_bytes(bytes: &[u8], expected_pitch: usize) -> Result<Self, RecordError> {
        if bytes.len() < HEADER_LENGTH {
            return Err(RecordError::Truncated {
                needed: HEADER_LENGTH,
                available: bytes.len(),
            });
        }
        let mut buf = bytes;
        if &buf[..4] != MAGIC {
            return Err(RecordError::BadMagic);
        }
        buf.advance(4);
        let version = buf.get_u16_le();
        if version != VERSION {
            return Err(RecordError::UnsupportedVersion(version));
        }
        let pitch = buf.get_u32_le() as usize;
        if pitch != expected_pitch {
            return Err(RecordError::PitchMismatch {
                expected: expected_pitch,
                found: pitch,
            });
        }
        let needed = Self::encoded_len(pitch);
        if bytes.len() < needed {
            return Err(RecordError::Truncated {
                needed,
                available: bytes.len(),
            });
        }
        if bytes.len() > needed {
            return Err(RecordError::TrailingBytes(bytes.len() - needed));
        }
        let mut read_levels = || (0..pitch).map(|_| buf.get_u32_le()).collect::<Vec<_>>();
        let black = read_levels();
        let red = read_levels();
        let green = read_levels();
        let blue = read_levels();
        let mut gains = [0u8; 3];
        gains.copy_from_slice(&buf[0..3]);
        let mut offsets = [0u8; 3];
        offsets.copy_from_slice(&buf[3..6]);
        Ok(Self {
            black,
            red,
            green,
            blue,
            gains,
            offsets,
            shading_target: buf[6],
        })
    }
}
