// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Reassembling raw hardware blocks into caller rows.
//!
//! Raw data arrives in blocks of arbitrary size. Each raw line holds every column of channel 0,
//! then channel 1, then channel 2. The sensing elements for each channel are physically apart, so
//! channel `c` of an output row arrives `shift_c` lines after the first. At the motor's highest
//! resolution each line arrives twice, after two settle lines that are skipped.
use std::collections::VecDeque;

use bitvec::prelude::*;
use log::trace;

use crate::calibration::ShadingTable;
use crate::error::DecodeError;
use crate::geometry::ScanPlan;
use crate::image::ImageView;
use crate::profile::ColorMode;

/// Raw bytes received but not yet consumed, with the bookkeeping to find lines in them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockBuffer {
    data: Vec<u8>,

    /// Raw line index of the first line in `data`, counted after the ripple.
    first_line: usize,

    /// Ripple bytes still to be dropped.
    ripple_remaining: usize,

    received: usize,
    total: usize,
    block_size: usize,
    line_bytes: usize,
}

impl BlockBuffer {
    pub fn new(plan: &ScanPlan, block_size: usize) -> Self {
        Self {
            data: Vec::new(),
            first_line: 0,
            ripple_remaining: plan.ripple,
            received: 0,
            total: plan.total_bytes,
            block_size: block_size.max(1),
            line_bytes: plan.raw_bytes_per_line.max(1),
        }
    }

    /// Take a block of raw bytes.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if self.received + bytes.len() > self.total {
            return Err(DecodeError::Overrun {
                received: self.received + bytes.len(),
                total: self.total,
            });
        }
        self.received += bytes.len();
        let skip = self.ripple_remaining.min(bytes.len());
        self.ripple_remaining -= skip;
        self.data.extend_from_slice(&bytes[skip..]);
        Ok(())
    }

    /// How many bytes to ask the device for next. The last request shrinks to the remainder.
    pub fn next_request(&self) -> usize {
        self.block_size.min(self.total - self.received)
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    /// One past the last complete raw line held.
    pub fn lines_end(&self) -> usize {
        self.first_line + self.data.len() / self.line_bytes
    }

    pub fn line(&self, index: usize) -> Result<&[u8], DecodeError> {
        if index < self.first_line || index >= self.lines_end() {
            return Err(DecodeError::ShortBlock { line: index });
        }
        let start = (index - self.first_line) * self.line_bytes;
        Ok(&self.data[start..start + self.line_bytes])
    }

    /// Drop every line before `index`.
    pub fn release_before(&mut self, index: usize) {
        let count = index.saturating_sub(self.first_line).min(self.data.len() / self.line_bytes);
        if count > 0 {
            self.data.drain(..count * self.line_bytes);
            self.first_line += count;
        }
    }

    /// Bytes currently held.
    pub fn held(&self) -> usize {
        self.data.len()
    }
}

/// One side of a scan.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    Front,
    Back,
}

/// Finished caller bytes waiting to be read, one queue per side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutputChannels {
    front: VecDeque<u8>,
    back: VecDeque<u8>,

    /// Bytes ever written to each side.
    front_written: usize,
    back_written: usize,
}

impl OutputChannels {
    pub fn push(&mut self, side: Side, bytes: &[u8]) {
        match side {
            Side::Front => {
                self.front.extend(bytes);
                self.front_written += bytes.len();
            }
            Side::Back => {
                self.back.extend(bytes);
                self.back_written += bytes.len();
            }
        }
    }

    /// Remove up to `max_len` bytes from a side.
    pub fn take(&mut self, side: Side, max_len: usize) -> Vec<u8> {
        let queue = match side {
            Side::Front => &mut self.front,
            Side::Back => &mut self.back,
        };
        let count = max_len.min(queue.len());
        queue.drain(..count).collect()
    }

    pub fn available(&self, side: Side) -> usize {
        match side {
            Side::Front => self.front.len(),
            Side::Back => self.back.len(),
        }
    }

    pub fn written(&self, side: Side) -> usize {
        match side {
            Side::Front => self.front_written,
            Side::Back => self.back_written,
        }
    }
}

/// Bytes a call to [`Decoder::decode_block`] added to each side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Produced {
    pub front: usize,
    pub back: usize,
}

/// Turns raw blocks into finished rows.
#[derive(Clone, Debug)]
pub struct Decoder {
    plan: ScanPlan,

    /// Width of the column groups alternating between sides in duplex lines.
    group: usize,

    buffer: BlockBuffer,

    /// The next output row to produce.
    next_row: usize,

    /// Scratch space for one side of one row, channel-interleaved.
    row: Vec<Vec<u8>>,
}

/// Split a duplex hardware column into a side and a pixel index.
///
/// Columns alternate between `group` front pixels and `group` back pixels. When `group` does not
/// divide `width`, the last run on each side is short.
fn duplex_column(column: usize, width: usize, group: usize) -> (usize, usize) {
    let full = width / group * group;
    let boundary = 2 * full;
    if column < boundary {
        ((column / group) % 2, (column / (2 * group)) * group + column % group)
    } else {
        let tail = width - full;
        let offset = column - boundary;
        (offset / tail, full + offset % tail)
    }
}

impl Decoder {
    pub fn new(plan: &ScanPlan, duplex_group: usize, block_size: usize) -> Self {
        Self {
            plan: *plan,
            group: duplex_group.max(1),
            buffer: BlockBuffer::new(plan, block_size),
            next_row: 0,
            row: vec![vec![0u8; plan.width * plan.channels]; plan.sides],
        }
    }

    pub fn buffer(&self) -> &BlockBuffer {
        &self.buffer
    }

    pub fn rows_produced(&self) -> usize {
        self.next_row
    }

    pub fn is_done(&self) -> bool {
        self.next_row >= self.plan.lines
    }

    /// Which side and which pixel a hardware column belongs to.
    fn locate(&self, column: usize) -> (usize, usize) {
        if self.plan.sides == 1 {
            (0, column)
        } else {
            duplex_column(column, self.plan.width, self.group)
        }
    }

    /// Raw lines holding channel `channel` of output row `row`.
    fn raw_lines(&self, row: usize, channel: usize) -> (usize, usize) {
        let hardware_line = row + self.plan.shifts[channel];
        if self.plan.oversample {
            (2 * hardware_line, 2 * hardware_line + 1)
        } else {
            (hardware_line, hardware_line)
        }
    }

    /// Build output row `row` into the scratch rows.
    fn assemble(&mut self, row: usize, shading: &ShadingTable) -> Result<(), DecodeError> {
        let plan = self.plan;
        let columns = plan.hardware_columns();
        for channel in 0..plan.channels {
            let (first, second) = self.raw_lines(row, channel);
            let first = ImageView::new(self.buffer.line(first)?, columns, plan.channels);
            let second = ImageView::new(self.buffer.line(second)?, columns, plan.channels);
            let (first, second) = (first.plane(0, channel), second.plane(0, channel));
            for column in 0..columns {
                let sample = ((first[column] as u16 + second[column] as u16 + 1) / 2) as u8;
                let sample = shading.apply(sample, column, channel);
                let (side, index) = self.locate(column);
                if index < plan.width {
                    self.row[side][index * plan.channels + channel] = sample;
                }
            }
        }
        Ok(())
    }

    /// Pack a gray row into one bit per pixel, set for black.
    fn pack_lineart(gray: &[u8], threshold: u8) -> Vec<u8> {
        let mut bits: BitVec<u8, Msb0> = BitVec::with_capacity(gray.len());
        bits.extend(gray.iter().map(|sample| *sample < threshold));
        bits.into_vec()
    }

    /// Take a raw block, and produce every row it completes.
    pub fn decode_block(
        &mut self,
        raw: &[u8],
        shading: &ShadingTable,
        output: &mut OutputChannels,
    ) -> Result<Produced, DecodeError> {
        self.buffer.push(raw)?;
        let mut produced = Produced::default();
        while !self.is_done() {
            match self.assemble(self.next_row, shading) {
                Ok(()) => (),
                Err(DecodeError::ShortBlock { .. }) => break,
                Err(err) => return Err(err),
            }
            for (side_index, row) in self.row.iter().enumerate() {
                let side = if side_index == 0 {
                    Side::Front
                } else {
                    Side::Back
                };
                let bytes = match self.plan.mode {
                    ColorMode::Lineart => Self::pack_lineart(row, self.plan.threshold),
                    ColorMode::Gray | ColorMode::Color => row.clone(),
                };
                match side {
                    Side::Front => produced.front += bytes.len(),
                    Side::Back => produced.back += bytes.len(),
                }
                output.push(side, &bytes);
            }
            self.next_row += 1;
            // The least shifted channel of the next row is the earliest line still needed.
            let min_shift = self.plan.shifts.iter().copied().min().unwrap_or(0);
            self.buffer
                .release_before((self.next_row + min_shift) * self.plan.line_repeat());
        }
        trace!(
            "decoded up to row {}, {} raw bytes held",
            self.next_row,
            self.buffer.held()
        );
        Ok(produced)
    }

    /// Check the scan produced every row.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(DecodeError::Truncated {
                rows: self.next_row,
                expected: self.plan.lines,
            })
        }
    }
}

#[cfg(test)]
mod test {
    use super::{BlockBuffer, Decoder, OutputChannels, Side};
    use crate::calibration::ShadingTable;
    use crate::error::DecodeError;
    use crate::geometry::{resolve, ScanPlan, ScanRequest};
    use crate::profile::{ColorMode, Source, LS600, LS600D};

    fn plan(request: ScanRequest) -> ScanPlan {
        resolve(&request, &LS600D).unwrap()
    }

    /// Decode everything in blocks of `block` bytes, returning front and back.
    fn decode_all(plan: &ScanPlan, group: usize, raw: &[u8], block: usize) -> (Vec<u8>, Vec<u8>) {
        let mut decoder = Decoder::new(plan, group, block);
        let mut output = OutputChannels::default();
        let shading = ShadingTable::unity(plan.hardware_columns(), plan.channels);
        for chunk in raw.chunks(block) {
            decoder.decode_block(chunk, &shading, &mut output).unwrap();
        }
        decoder.finish().unwrap();
        let front = output.take(Side::Front, usize::MAX);
        let back = output.take(Side::Back, usize::MAX);
        (front, back)
    }

    #[test]
    fn line_shift_alignment() {
        let mut plan = plan(ScanRequest::new(4, 6, 300, ColorMode::Color));
        plan.shifts = [3, 0, 5];
        plan.hardware_lines = plan.lines + 5;
        plan.raw_lines = plan.hardware_lines;
        plan.total_bytes = plan.raw_lines * plan.raw_bytes_per_line;
        // Every channel of row `y` carries the marker `y * 10 + channel`, which means channel c
        // has to be placed `shift_c` lines later in the raw stream.
        let mut raw = vec![0xEEu8; plan.total_bytes];
        for y in 0..plan.lines {
            for channel in 0..3 {
                let line = y + plan.shifts[channel];
                let start = line * plan.raw_bytes_per_line + channel * plan.width;
                for value in &mut raw[start..start + plan.width] {
                    *value = (y * 10 + channel) as u8;
                }
            }
        }
        let (front, back) = decode_all(&plan, 1, &raw, 7);
        assert!(back.is_empty());
        assert_eq!(front.len(), plan.lines * plan.bytes_per_line);
        for (y, row) in front.chunks(plan.bytes_per_line).enumerate() {
            for pixel in row.chunks(3) {
                assert_eq!(pixel, &[(y * 10) as u8, (y * 10 + 1) as u8, (y * 10 + 2) as u8]);
            }
        }
    }

    #[test]
    fn oversampled_pairs_are_averaged() {
        let plan = resolve(&ScanRequest::new(2, 3, 600, ColorMode::Gray), &LS600).unwrap();
        assert!(plan.oversample);
        let mut raw = vec![0xFFu8; plan.ripple];
        for y in 0..plan.lines {
            raw.extend_from_slice(&[y as u8 * 10, 100]);
            raw.extend_from_slice(&[y as u8 * 10 + 1, 102]);
        }
        assert_eq!(raw.len(), plan.total_bytes);
        let (front, _) = decode_all(&plan, 1, &raw, 3);
        assert_eq!(front, vec![1, 101, 11, 101, 21, 101]);
    }

    #[test]
    fn duplex_conservation() {
        let plan = plan(
            ScanRequest::new(8, 2, 300, ColorMode::Gray).with_source(Source::AdfDuplex),
        );
        for group in [1, 2, 4] {
            // Number every hardware pixel uniquely
            let raw: Vec<u8> = (0..plan.total_bytes).map(|i| i as u8).collect();
            let (front, back) = decode_all(&plan, group, &raw, 5);
            assert_eq!(front.len() + back.len(), raw.len());
            let mut all: Vec<u8> = front.iter().chain(back.iter()).copied().collect();
            all.sort_unstable();
            let mut expected = raw.clone();
            expected.sort_unstable();
            assert_eq!(all, expected, "group {}", group);
        }
        // A short last run on each side when the group does not divide the width
        let plan = self::plan(
            ScanRequest::new(6, 1, 300, ColorMode::Gray).with_source(Source::AdfDuplex),
        );
        assert_eq!(plan.width, 6);
        let raw: Vec<u8> = (1..=12).collect();
        let (front, back) = decode_all(&plan, 4, &raw, 12);
        assert_eq!(front, vec![1, 2, 3, 4, 9, 10]);
        assert_eq!(back, vec![5, 6, 7, 8, 11, 12]);

        // With single columns, even columns are the front
        let plan = self::plan(
            ScanRequest::new(8, 2, 300, ColorMode::Gray).with_source(Source::AdfDuplex),
        );
        let raw: Vec<u8> = (0..plan.total_bytes).map(|i| i as u8).collect();
        let (front, back) = decode_all(&plan, 1, &raw, 64);
        assert_eq!(&front[..4], &[0, 2, 4, 6]);
        assert_eq!(&back[..4], &[1, 3, 5, 7]);
    }

    #[test]
    fn lineart_packing() {
        let plan = plan(ScanRequest::new(16, 1, 300, ColorMode::Lineart).with_threshold(100));
        assert_eq!(plan.width, 16);
        let mut raw = vec![200u8; 16];
        raw[0] = 10;
        raw[7] = 99;
        raw[8] = 100;
        raw[15] = 0;
        let (front, _) = decode_all(&plan, 1, &raw, 16);
        assert_eq!(front, vec![0b1000_0001, 0b0000_0001]);
    }

    #[test]
    fn shading_is_applied() {
        let plan = plan(ScanRequest::new(2, 1, 300, ColorMode::Gray));
        let reference = [100u8, 200];
        let shading = ShadingTable::from_reference(
            crate::image::ImageView::new(&reference, 2, 1),
            0,
            200,
            16,
            8,
        )
        .unwrap();
        let mut decoder = Decoder::new(&plan, 1, 16);
        let mut output = OutputChannels::default();
        let produced = decoder
            .decode_block(&[50, 50], &shading, &mut output)
            .unwrap();
        assert_eq!(produced.front, 2);
        assert_eq!(output.take(Side::Front, 16), vec![100, 50]);
    }

    #[test]
    fn partial_blocks_produce_nothing() {
        let plan = plan(ScanRequest::new(4, 2, 300, ColorMode::Gray));
        let mut decoder = Decoder::new(&plan, 1, 16);
        let mut output = OutputChannels::default();
        let shading = ShadingTable::unity(4, 1);
        let produced = decoder.decode_block(&[1, 2, 3], &shading, &mut output).unwrap();
        assert_eq!(produced.front, 0);
        let produced = decoder.decode_block(&[4, 5], &shading, &mut output).unwrap();
        assert_eq!(produced.front, 4);
        assert_eq!(output.available(Side::Front), 4);
        // A truncated scan is reported when finishing
        assert_eq!(
            decoder.finish(),
            Err(DecodeError::Truncated {
                rows: 1,
                expected: 2
            })
        );
    }

    #[test]
    fn overrun() {
        let plan = plan(ScanRequest::new(2, 1, 300, ColorMode::Gray));
        let mut decoder = Decoder::new(&plan, 1, 16);
        let mut output = OutputChannels::default();
        let shading = ShadingTable::unity(2, 1);
        assert_eq!(
            decoder.decode_block(&[1, 2, 3], &shading, &mut output),
            Err(DecodeError::Overrun {
                received: 3,
                total: 2
            })
        );
    }

    #[test]
    fn buffer_is_bounded() {
        let plan = plan(ScanRequest::new(100, 50, 300, ColorMode::Gray));
        let raw = vec![0u8; plan.total_bytes];
        let mut decoder = Decoder::new(&plan, 1, 250);
        let mut output = OutputChannels::default();
        let shading = ShadingTable::unity(100, 1);
        for chunk in raw.chunks(250) {
            decoder.decode_block(chunk, &shading, &mut output).unwrap();
            assert!(decoder.buffer().held() < plan.raw_bytes_per_line);
        }
        assert!(decoder.is_done());
        assert_eq!(output.written(Side::Front), plan.side_bytes());
    }

    #[test]
    fn short_final_request() {
        let plan = plan(ScanRequest::new(10, 10, 300, ColorMode::Gray));
        let mut buffer = BlockBuffer::new(&plan, 30);
        let mut requests = Vec::new();
        while !buffer.is_complete() {
            let request = buffer.next_request();
            requests.push(request);
            buffer.push(&vec![0; request]).unwrap();
        }
        assert_eq!(requests, vec![30, 30, 30, 10]);
        assert_eq!(buffer.received(), buffer.total());
        assert_eq!(buffer.next_request(), 0);
    }

    #[test]
    fn ripple_is_skipped() {
        let plan = resolve(&ScanRequest::new(2, 1, 600, ColorMode::Gray), &LS600).unwrap();
        let mut buffer = BlockBuffer::new(&plan, 64);
        buffer.push(&[9, 9, 9]).unwrap();
        assert_eq!(buffer.held(), 0);
        buffer.push(&[9, 1, 2, 3, 4]).unwrap();
        assert_eq!(buffer.line(0), Ok(&[1u8, 2][..]));
        assert_eq!(buffer.line(1), Ok(&[3u8, 4][..]));
        buffer.release_before(1);
        assert_eq!(buffer.line(0), Err(DecodeError::ShortBlock { line: 0 }));
        assert_eq!(buffer.lines_end(), 2);
    }
}
