// SPDX-License-Identifier: Apache-2.0
// Copyright © 2021 Will Ross
//! Static descriptions of supported devices.
//!
//! Everything that differs between models lives in a [`DeviceProfile`]. Adding a model means
//! adding a profile, not a code path.
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::calibration::search::{Response, Target};
use crate::register::Register;

/// The image type the caller receives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ColorMode {
    /// One bit per pixel, thresholded from a gray scan.
    Lineart,

    /// Eight bits per pixel.
    Gray,

    /// Twenty-four bits per pixel, in red, green, blue order.
    Color,
}

impl ColorMode {
    /// The number of channels the sensor samples for this mode.
    pub fn channels(self) -> usize {
        match self {
            Self::Lineart | Self::Gray => 1,
            Self::Color => 3,
        }
    }

    /// The command template purpose used to scan in this mode.
    pub fn purpose(self) -> Purpose {
        match self {
            Self::Lineart | Self::Gray => Purpose::Gray,
            Self::Color => Purpose::Color,
        }
    }

    /// Bytes the caller receives for a line of `width` pixels.
    pub fn bytes_per_line(self, width: usize) -> usize {
        match self {
            Self::Lineart => (width + 7) / 8,
            Self::Gray => width,
            Self::Color => width * 3,
        }
    }
}

/// Paper path and sensor selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Source {
    Flatbed = 0,
    AdfFront = 1,
    AdfBack = 2,
    /// Both sides at once, with front and back columns interleaved in each raw line.
    AdfDuplex = 3,
}

impl Source {
    /// How many sides each raw line carries.
    pub fn sides(self) -> usize {
        match self {
            Self::AdfDuplex => 2,
            Self::Flatbed | Self::AdfFront | Self::AdfBack => 1,
        }
    }
}

/// Some models ship with one of two sensor/AFE combinations that can't be told apart until an
/// image is taken.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum SensorVariant {
    Primary,
    Alternate,
}

impl SensorVariant {
    pub fn other(self) -> Self {
        match self {
            Self::Primary => Self::Alternate,
            Self::Alternate => Self::Primary,
        }
    }
}

/// What a command template is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Purpose {
    /// Calibration and positioning strips.
    Calibration,
    Gray,
    Color,
}

/// Register values for scanning at one resolution for one purpose.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommandTemplate {
    pub ydpi: u16,
    pub purpose: Purpose,
    pub registers: &'static [(Register, u8)],
}

/// Targets and limits for the calibration engine.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationProfile {
    /// Lines in each dark/gain/offset strip.
    pub strip_lines: usize,

    /// Columns averaged for a channel mean, counted from the left margin.
    pub sample_columns: usize,

    /// Near-black level for the lamp-off offset search.
    pub dark: Target,

    /// White strip level for the gain search.
    pub bright: Target,

    /// Grey strip level for the offset refinement.
    pub grey: Target,

    pub gain_bounds: (u8, u8),
    pub offset_bounds: (u8, u8),
    pub gain_response: Response,
    pub offset_response: Response,
    pub default_gain: u8,
    pub default_offset: u8,

    /// Upper bound on the passes any search may take.
    pub max_passes: usize,

    /// Lines in the shading reference strip.
    pub shading_lines: usize,

    /// Lines dropped from each end of the shading strip.
    pub shading_discard: usize,

    /// The output code a white reference column is corrected to.
    pub shading_target: u8,

    /// Smallest reference average used as a divisor.
    pub shading_floor: u8,

    /// Weakest line-to-line transition accepted as the origin edge.
    pub edge_min: f32,

    /// Brightness a column must exceed to be past the frame.
    pub margin_threshold: u8,
}

/// Physical positions on the bed, in motor steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BedLayout {
    /// Lines scanned from home while looking for the origin edge.
    pub origin_search_lines: usize,

    /// Steps from the origin edge to the middle of the white strip.
    pub white_strip: u32,

    /// Steps from the origin edge to the middle of the grey strip.
    pub grey_strip: u32,

    /// Steps from the origin edge to the top of the document area.
    pub document_start: u32,

    /// The widest left frame the margin search accepts, in native columns.
    pub margin_allowance: u16,
}

/// Everything model-specific about a scanner.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceProfile {
    /// Identifier accepted by [`Scanner::open`][crate::Scanner::open].
    pub id: &'static str,
    pub name: &'static str,

    /// Optical resolution of the sensor.
    pub native_dpi: u16,

    /// Pixels across the sensor at the native resolution.
    pub sensor_pitch: usize,

    pub min_xdpi: u16,
    pub max_xdpi: u16,
    pub min_ydpi: u16,

    /// Highest motor resolution. One motor step is one line at this resolution.
    pub max_ydpi: u16,

    /// Physical distance of the red, green and blue sensing elements from the leading edge, in
    /// lines at `max_ydpi`.
    pub channel_offsets: [u16; 3],

    /// Whether the sensor samples every line twice at `max_ydpi`.
    pub double_sample_at_max: bool,

    pub sources: &'static [Source],

    /// Size of the column groups that alternate between front and back in duplex lines.
    pub duplex_group: usize,

    /// Vertical resolution used for positioning strips.
    pub calibration_ydpi: u16,

    pub templates: &'static [CommandTemplate],
    pub calibration: CalibrationProfile,
    pub layout: BedLayout,
}

impl DeviceProfile {
    pub fn template(&self, ydpi: u16, purpose: Purpose) -> Option<&CommandTemplate> {
        self.templates
            .iter()
            .find(|template| template.ydpi == ydpi && template.purpose == purpose)
    }

    /// The lowest resolution at or above `ydpi` that has a template for `purpose`.
    pub fn snap_ydpi(&self, ydpi: u16, purpose: Purpose) -> Option<u16> {
        self.templates
            .iter()
            .filter(|template| template.purpose == purpose && template.ydpi >= ydpi)
            .map(|template| template.ydpi)
            .min()
    }

    pub fn supports(&self, source: Source) -> bool {
        self.sources.contains(&source)
    }

    /// Native columns available to scans, once the worst-case frame is excluded.
    pub fn usable_width(&self) -> usize {
        self.sensor_pitch
            .saturating_sub(self.layout.margin_allowance as usize)
    }

    /// Motor steps per line at `ydpi`.
    pub fn steps_per_line(&self, ydpi: u16) -> u32 {
        (self.max_ydpi / ydpi.max(1)).max(1) as u32
    }
}

macro_rules! templates {
    ($( ($dpi:literal, $purpose:ident, $exposure:literal, $speed:literal) ),* $(,)?) => {
        &[$(
            CommandTemplate {
                ydpi: $dpi,
                purpose: Purpose::$purpose,
                registers: &[(Register::Exposure, $exposure), (Register::MotorSpeed, $speed)],
            },
        )*]
    };
}

const LS600_TEMPLATES: &[CommandTemplate] = templates![
    (300, Calibration, 0x20, 0x08),
    (75, Gray, 0x10, 0x02),
    (150, Gray, 0x18, 0x04),
    (300, Gray, 0x20, 0x08),
    (600, Gray, 0x40, 0x10),
    (75, Color, 0x18, 0x02),
    (150, Color, 0x20, 0x04),
    (300, Color, 0x30, 0x08),
    (600, Color, 0x60, 0x10),
];

/// A 600 dpi flatbed with a three-line colour CCD.
pub const LS600: DeviceProfile = DeviceProfile {
    id: "ls600",
    name: "LS-600 flatbed",
    native_dpi: 600,
    sensor_pitch: 5300,
    min_xdpi: 75,
    max_xdpi: 600,
    min_ydpi: 75,
    max_ydpi: 600,
    channel_offsets: [0, 8, 16],
    double_sample_at_max: true,
    sources: &[Source::Flatbed],
    duplex_group: 1,
    calibration_ydpi: 300,
    templates: LS600_TEMPLATES,
    calibration: CalibrationProfile {
        strip_lines: 4,
        sample_columns: 64,
        dark: Target { level: 8, margin: 2 },
        bright: Target {
            level: 200,
            margin: 4,
        },
        grey: Target {
            level: 110,
            margin: 3,
        },
        gain_bounds: (0, 63),
        offset_bounds: (0, 250),
        gain_response: Response::Rising,
        offset_response: Response::Rising,
        default_gain: 0,
        default_offset: 128,
        max_passes: 20,
        shading_lines: 32,
        shading_discard: 2,
        shading_target: 240,
        shading_floor: 16,
        edge_min: 40.0,
        margin_threshold: 40,
    },
    layout: BedLayout {
        origin_search_lines: 96,
        white_strip: 60,
        grey_strip: 160,
        document_start: 240,
        margin_allowance: 64,
    },
};

/// The LS-600 with the duplexing document feeder.
pub const LS600D: DeviceProfile = DeviceProfile {
    id: "ls600d",
    name: "LS-600 with duplex feeder",
    sources: &[
        Source::Flatbed,
        Source::AdfFront,
        Source::AdfBack,
        Source::AdfDuplex,
    ],
    ..LS600
};

/// Every built-in profile.
pub static PROFILES: &[&DeviceProfile] = &[&LS600, &LS600D];

/// Find a built-in profile by its id.
pub fn by_id(id: &str) -> Option<&'static DeviceProfile> {
    PROFILES.iter().copied().find(|profile| profile.id == id)
}

#[cfg(test)]
mod test {
    use super::{by_id, ColorMode, Purpose, Source, LS600};

    #[test]
    fn lookup() {
        assert_eq!(by_id("ls600").map(|p| p.name), Some(LS600.name));
        assert!(by_id("ls600d").unwrap().supports(Source::AdfDuplex));
        assert!(!LS600.supports(Source::AdfDuplex));
        assert!(by_id("nope").is_none());
    }

    #[test]
    fn snapping() {
        assert_eq!(LS600.snap_ydpi(300, Purpose::Color), Some(300));
        assert_eq!(LS600.snap_ydpi(200, Purpose::Color), Some(300));
        assert_eq!(LS600.snap_ydpi(601, Purpose::Color), None);
        assert_eq!(LS600.snap_ydpi(75, Purpose::Calibration), Some(300));
    }

    #[test]
    fn mode_packing() {
        assert_eq!(ColorMode::Lineart.bytes_per_line(16), 2);
        assert_eq!(ColorMode::Gray.bytes_per_line(16), 16);
        assert_eq!(ColorMode::Color.bytes_per_line(16), 48);
        assert_eq!(ColorMode::Color.channels(), 3);
    }

    #[test]
    fn steps() {
        assert_eq!(LS600.steps_per_line(600), 1);
        assert_eq!(LS600.steps_per_line(300), 2);
        assert_eq!(LS600.steps_per_line(75), 8);
    }
}
