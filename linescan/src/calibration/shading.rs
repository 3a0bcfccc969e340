// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Per-column shading correction.
//!
//! Lamp fall-off and sensor element sensitivity vary across the sensor, so a uniform white
//! reference doesn't come back uniform. Each hardware column gets a multiplier, stored as a 16-bit
//! code where [`UNITY`] is a gain of one.
use log::debug;

use crate::error::CalibrationError;
use crate::image::ImageView;
use crate::protocol::SHADING_TERMINATOR;

/// The code for a gain of 1.0.
pub const UNITY: u16 = 0x1000;

/// The largest gain code the hardware accepts, just under 4×.
pub const MAX_CODE: u16 = 0x3FFF;

/// Lower a code until neither of its bytes collides with the upload terminator.
fn escape(code: u16) -> u16 {
    let mut code = code;
    while code.to_le_bytes().contains(&SHADING_TERMINATOR) {
        code -= 1;
    }
    code
}

/// Shading codes for every hardware column of every channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShadingTable {
    columns: usize,
    channels: usize,

    /// Channel-planar, like the raw lines the table corrects.
    codes: Vec<u16>,
}

impl ShadingTable {
    /// A table that leaves every sample unchanged.
    pub fn unity(columns: usize, channels: usize) -> Self {
        Self {
            columns,
            channels,
            codes: vec![UNITY; columns * channels],
        }
    }

    /// Derive a table from a white reference strip.
    ///
    /// `discard` rows are dropped from each end of the strip before averaging, as long as some
    /// rows are left. A column averaging at or below `black` is dead, and one averaging full scale
    /// is saturated. Neither can be corrected.
    pub fn from_reference(
        strip: ImageView<'_, u8>,
        discard: usize,
        target: u8,
        floor: u8,
        black: u8,
    ) -> Result<Self, CalibrationError> {
        let strip = if strip.rows() > discard * 2 {
            strip.rows_range(discard..strip.rows() - discard)
        } else {
            strip
        };
        let columns = strip.columns();
        let channels = strip.channels();
        let mut codes = Vec::with_capacity(columns * channels);
        let floor = floor.max(1) as f32;
        for channel in 0..channels {
            for column in 0..columns {
                let average = strip
                    .column_mean(column, channel)
                    .ok_or(CalibrationError::BadReferenceData { column, channel })?;
                if average <= black as f32 || average >= u8::MAX as f32 {
                    return Err(CalibrationError::BadReferenceData { column, channel });
                }
                let code = (target as f32 * UNITY as f32 / average.max(floor)).round();
                let code = code.min(MAX_CODE as f32) as u16;
                codes.push(escape(code));
            }
        }
        debug!(
            "shading table for {} columns, {} channels, from {} lines",
            columns,
            channels,
            strip.rows()
        );
        Ok(Self {
            columns,
            channels,
            codes,
        })
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn code(&self, column: usize, channel: usize) -> u16 {
        self.codes[channel * self.columns + column]
    }

    /// Correct one sample.
    pub fn apply(&self, sample: u8, column: usize, channel: usize) -> u8 {
        let code = self.code(column, channel) as u32;
        let corrected = (sample as u32 * code + UNITY as u32 / 2) / UNITY as u32;
        corrected.min(u8::MAX as u32) as u8
    }

    /// The upload form of the table: little-endian codes, channel-planar, without the terminator.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.codes.iter().flat_map(|code| code.to_le_bytes()).collect()
    }
}

#[cfg(test)]
mod test {
    use super::{escape, ShadingTable, MAX_CODE, UNITY};
    use crate::error::CalibrationError;
    use crate::image::Image;
    use crate::protocol::SHADING_TERMINATOR;

    /// A strip where column `c` of every row and channel reads `levels[c]`.
    fn strip(rows: usize, levels: &[u8], channels: usize) -> Image<u8> {
        let mut image = Image::new(rows, levels.len(), channels);
        for row in 0..rows {
            for channel in 0..channels {
                for (column, level) in levels.iter().enumerate() {
                    image[(row, column, channel)] = *level;
                }
            }
        }
        image
    }

    #[test]
    fn uniform_round_trip() {
        let levels: Vec<u8> = (0..64).map(|c| 150 + (c % 50) as u8).collect();
        let image = strip(8, &levels, 3);
        let table = ShadingTable::from_reference(image.view(), 2, 240, 16, 8).unwrap();
        for channel in 0..3 {
            for (column, level) in levels.iter().enumerate() {
                let corrected = table.apply(*level, column, channel) as i32;
                assert!(
                    (corrected - 240).abs() <= 1,
                    "column {} corrected to {}",
                    column,
                    corrected
                );
            }
        }
    }

    #[test]
    fn discarded_rows_are_ignored() {
        let mut image = strip(6, &[100, 100], 1);
        // Garbage in the first and last rows
        image[(0, 0, 0)] = 255;
        image[(5, 1, 0)] = 9;
        let table = ShadingTable::from_reference(image.view(), 1, 200, 16, 8).unwrap();
        assert_eq!(table.code(0, 0), 2 * UNITY);
        assert_eq!(table.code(1, 0), 2 * UNITY);
    }

    #[test]
    fn bad_reference() {
        let dead = strip(4, &[100, 8, 100], 1);
        assert_eq!(
            ShadingTable::from_reference(dead.view(), 0, 240, 16, 8),
            Err(CalibrationError::BadReferenceData {
                column: 1,
                channel: 0
            })
        );
        let saturated = strip(4, &[100, 100, 255], 3);
        assert_eq!(
            ShadingTable::from_reference(saturated.view(), 0, 240, 16, 8),
            Err(CalibrationError::BadReferenceData {
                column: 2,
                channel: 0
            })
        );
    }

    #[test]
    fn codes_are_clamped() {
        // 240 / 20 is far past the largest gain
        let dim = strip(4, &[20], 1);
        let table = ShadingTable::from_reference(dim.view(), 0, 240, 16, 8).unwrap();
        assert_eq!(table.code(0, 0), MAX_CODE);
        assert_eq!(table.apply(20, 0, 0), 80);
    }

    #[test]
    fn floor_limits_gain() {
        let dim = strip(4, &[12], 1);
        let table = ShadingTable::from_reference(dim.view(), 0, 64, 16, 8).unwrap();
        // 64 / max(12, 16) = 4.0, then clamped
        assert_eq!(table.code(0, 0), MAX_CODE);
        let table = ShadingTable::from_reference(dim.view(), 0, 32, 16, 8).unwrap();
        assert_eq!(table.code(0, 0), 2 * UNITY);
    }

    #[test]
    fn no_terminator_bytes() {
        assert_eq!(escape(0x10AA), 0x10A9);
        assert_eq!(escape(0x2AAA), 0x2AA9);
        assert_eq!(escape(0x1000), 0x1000);
        // Every level a column can average to
        let levels: Vec<u8> = (9..255).collect();
        let image = strip(2, &levels, 1);
        let table = ShadingTable::from_reference(image.view(), 0, 240, 16, 8).unwrap();
        assert!(!table.to_bytes().contains(&SHADING_TERMINATOR));
        assert_eq!(table.to_bytes().len(), levels.len() * 2);
    }

    #[test]
    fn unity_is_identity() {
        let table = ShadingTable::unity(4, 3);
        for sample in [0u8, 1, 127, 128, 254, 255] {
            assert_eq!(table.apply(sample, 3, 2), sample);
        }
    }
}
