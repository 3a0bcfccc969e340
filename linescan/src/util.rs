// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Small numeric helpers shared by the protocol and calibration code.
use num_traits::{NumCast, ToPrimitive};

/// Encode the low 24 bits of `value`, most significant byte first.
pub(crate) fn u24_to_be_bytes(value: u32) -> [u8; 3] {
    let [_, high, mid, low] = value.to_be_bytes();
    [high, mid, low]
}

pub(crate) fn u24_from_be_bytes(bytes: [u8; 3]) -> u32 {
    u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
}

/// The arithmetic mean of an iterator of samples, or `None` if it's empty.
pub(crate) fn mean<S, I>(samples: I) -> Option<f32>
where
    S: ToPrimitive,
    I: IntoIterator<Item = S>,
{
    let (sum, count) = samples
        .into_iter()
        .filter_map(|sample| sample.to_f64())
        .fold((0f64, 0usize), |(sum, count), sample| (sum + sample, count + 1));
    if count == 0 {
        None
    } else {
        <f32 as NumCast>::from(sum / count as f64)
    }
}

/// Convert a level to 24.8 fixed point, saturating at the ends of the range.
pub(crate) fn to_fixed_24_8(level: f32) -> u32 {
    let scaled = (level * 256.0).round();
    if scaled <= 0.0 {
        0
    } else {
        <u32 as NumCast>::from(scaled).unwrap_or(u32::MAX)
    }
}

/// Sequential little-endian reads from a byte slice.
///
/// Callers are expected to check the length up front, these panic on short input.
pub(crate) trait Buffer {
    fn advance(&mut self, cnt: usize);
    fn get_u16_le(&mut self) -> u16;
    fn get_u32_le(&mut self) -> u32;
}

impl Buffer for &[u8] {
    fn advance(&mut self, cnt: usize) {
        *self = &self[cnt..];
    }

    fn get_u16_le(&mut self) -> u16 {
        let (bytes, rest) = self.split_at(2);
        *self = rest;
        u16::from_le_bytes([bytes[0], bytes[1]])
    }

    fn get_u32_le(&mut self) -> u32 {
        let (bytes, rest) = self.split_at(4);
        *self = rest;
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }
}

/// Integer division, rounding up.
pub(crate) fn div_ceil(numerator: usize, denominator: usize) -> usize {
    (numerator + denominator - 1) / denominator
}
