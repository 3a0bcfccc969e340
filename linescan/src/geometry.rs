// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Turning a caller's scan request into hardware geometry.
use log::debug;

use crate::error::GeometryError;
use crate::profile::{ColorMode, DeviceProfile, Source};
use crate::util::div_ceil;

/// Raw lines the sensor emits before the first real line when oversampling.
const RIPPLE_LINES: usize = 2;

/// What the caller asked for. Positions and sizes are in pixels at the requested resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanRequest {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub xdpi: u16,
    pub ydpi: u16,
    pub mode: ColorMode,
    pub source: Source,

    /// Gray level below which a lineart pixel is black.
    pub threshold: u8,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 0,
            height: 0,
            xdpi: 300,
            ydpi: 300,
            mode: ColorMode::Gray,
            source: Source::Flatbed,
            threshold: 128,
        }
    }
}

impl ScanRequest {
    /// A request for a `width` by `height` area at the top left of the bed.
    pub fn new(width: u32, height: u32, dpi: u16, mode: ColorMode) -> Self {
        Self {
            width,
            height,
            xdpi: dpi,
            ydpi: dpi,
            mode,
            ..Self::default()
        }
    }

    pub fn with_origin(self, x: u32, y: u32) -> Self {
        Self { x, y, ..self }
    }

    pub fn with_source(self, source: Source) -> Self {
        Self { source, ..self }
    }

    pub fn with_threshold(self, threshold: u8) -> Self {
        Self { threshold, ..self }
    }
}

/// Everything the sequencer and decoder need to know about a scan, derived once per session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanPlan {
    pub mode: ColorMode,
    pub source: Source,

    /// Horizontal resolution the hardware samples at.
    pub xdpi: u16,

    /// Vertical resolution the hardware samples at.
    pub ydpi: u16,

    /// The sensor keeps every `x_divider`-th native column.
    pub x_divider: u16,

    /// Left edge of the window in native columns, relative to the left margin.
    pub x_native: usize,

    /// Top edge of the window in motor steps, relative to the document area.
    pub y_steps: u32,

    /// Motor steps per hardware line.
    pub y_step: u32,

    /// Pixels per line for each side.
    pub width: usize,

    /// Lines the caller receives.
    pub lines: usize,

    pub channels: usize,
    pub sides: usize,

    /// Bytes in one raw line, across every channel and side.
    pub raw_bytes_per_line: usize,

    /// How many lines later each channel sees a given row, in hardware lines.
    pub shifts: [usize; 3],

    /// Each hardware line arrives twice.
    pub oversample: bool,

    /// Settle bytes at the start of the transfer that carry no image data.
    pub ripple: usize,

    /// Lines the hardware scans, including the extra lines needed for the channel shifts.
    pub hardware_lines: usize,

    /// Lines the hardware transfers, after oversampling.
    pub raw_lines: usize,

    pub total_bytes: usize,

    /// Bytes per line the caller receives, for each side.
    pub bytes_per_line: usize,

    pub threshold: u8,
}

impl ScanPlan {
    /// Columns in one channel of a raw line.
    pub fn hardware_columns(&self) -> usize {
        self.width * self.sides
    }

    /// Raw lines transferred for each hardware line.
    pub fn line_repeat(&self) -> usize {
        if self.oversample {
            2
        } else {
            1
        }
    }

    pub fn max_shift(&self) -> usize {
        self.shifts.iter().copied().max().unwrap_or(0)
    }

    /// The byte distance a channel shift covers in the raw stream.
    pub fn shift_bytes(&self, channel: usize) -> usize {
        self.shifts[channel] * self.line_repeat() * self.raw_bytes_per_line
    }

    /// Bytes the caller receives from one side.
    pub fn side_bytes(&self) -> usize {
        self.bytes_per_line * self.lines
    }
}

fn clamp(value: u16, min: u16, max: u16) -> u16 {
    value.max(min).min(max)
}

/// Rescale `value` by `to / from`, rounding up.
fn rescale_up(value: usize, to: u16, from: u16) -> usize {
    div_ceil(value * to as usize, from.max(1) as usize)
}

/// Work out the hardware geometry for a request.
pub fn resolve(request: &ScanRequest, profile: &DeviceProfile) -> Result<ScanPlan, GeometryError> {
    if request.width == 0 || request.height == 0 || request.xdpi == 0 || request.ydpi == 0 {
        return Err(GeometryError::Empty);
    }
    if !profile.supports(request.source) {
        return Err(GeometryError::UnsupportedSource(request.source));
    }
    let mode = request.mode;

    // Vertical: snap to the nearest resolution with a template.
    let clamped_ydpi = clamp(request.ydpi, profile.min_ydpi, profile.max_ydpi);
    let ydpi = profile
        .snap_ydpi(clamped_ydpi, mode.purpose())
        .ok_or(GeometryError::Unsupported {
            mode,
            ydpi: clamped_ydpi,
        })?;
    let lines = if ydpi != request.ydpi {
        rescale_up(request.height as usize, ydpi, request.ydpi)
    } else {
        request.height as usize
    };

    // Horizontal: take every n-th native column.
    let clamped_xdpi = clamp(request.xdpi, profile.min_xdpi, profile.max_xdpi);
    let x_divider = (profile.native_dpi / clamped_xdpi.max(1)).max(1);
    let xdpi = profile.native_dpi / x_divider;
    let width = request.width as usize * xdpi as usize / request.xdpi as usize;
    let unit = match mode {
        ColorMode::Lineart => 8,
        ColorMode::Gray | ColorMode::Color => 2,
    };
    let width = (width / unit * unit).max(unit);

    let x_native = request.x as usize * profile.native_dpi as usize / request.xdpi as usize;
    let end = x_native + width * x_divider as usize;
    let limit = profile.usable_width();
    if end > limit {
        return Err(GeometryError::OutOfBounds { end, limit });
    }
    let y_steps = (request.y as u64 * profile.max_ydpi as u64 / request.ydpi as u64) as u32;

    // Channels are physically offset on the sensor. Only colour scans read more than one.
    let shifts = match mode {
        ColorMode::Color => {
            let raw = profile
                .channel_offsets
                .map(|offset| offset as usize * ydpi as usize / profile.max_ydpi as usize);
            let min = raw.iter().copied().min().unwrap_or(0);
            raw.map(|shift| shift - min)
        }
        ColorMode::Lineart | ColorMode::Gray => [0; 3],
    };
    let max_shift = shifts.iter().copied().max().unwrap_or(0);

    let channels = mode.channels();
    let sides = request.source.sides();
    let raw_bytes_per_line = width * channels * sides;
    let oversample = profile.double_sample_at_max && ydpi == profile.max_ydpi;
    let ripple = if oversample {
        RIPPLE_LINES * raw_bytes_per_line
    } else {
        0
    };
    let hardware_lines = lines + max_shift;
    let raw_lines = if oversample {
        hardware_lines * 2
    } else {
        hardware_lines
    };
    let plan = ScanPlan {
        mode,
        source: request.source,
        xdpi,
        ydpi,
        x_divider,
        x_native,
        y_steps,
        y_step: profile.steps_per_line(ydpi),
        width,
        lines,
        channels,
        sides,
        raw_bytes_per_line,
        shifts,
        oversample,
        ripple,
        hardware_lines,
        raw_lines,
        total_bytes: raw_lines * raw_bytes_per_line + ripple,
        bytes_per_line: mode.bytes_per_line(width),
        threshold: request.threshold,
    };
    debug!(
        "resolved {}x{} at {}x{} dpi to {}x{} at {}x{} dpi, {} raw bytes",
        request.width,
        request.height,
        request.xdpi,
        request.ydpi,
        plan.width,
        plan.lines,
        plan.xdpi,
        plan.ydpi,
        plan.total_bytes
    );
    Ok(plan)
}
