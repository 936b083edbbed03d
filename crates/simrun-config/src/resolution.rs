//! Built-in spectral truncation presets.

use crate::error::{ConfigError, Result};
use crate::namelist::Section;

/// Namelist section the presets apply to.
pub const SPECTRAL_SECTION: &str = "spectral_dynamics_nml";

/// Horizontal grid for a triangular spectral truncation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub lon_max: i64,
    pub lat_max: i64,
    pub num_fourier: i64,
    pub num_spherical: i64,
}

const PRESETS: &[(&str, Resolution)] = &[
    (
        "T21",
        Resolution {
            lon_max: 64,
            lat_max: 32,
            num_fourier: 21,
            num_spherical: 22,
        },
    ),
    (
        "T42",
        Resolution {
            lon_max: 128,
            lat_max: 64,
            num_fourier: 42,
            num_spherical: 43,
        },
    ),
    (
        "T85",
        Resolution {
            lon_max: 256,
            lat_max: 128,
            num_fourier: 85,
            num_spherical: 86,
        },
    ),
    (
        "T170",
        Resolution {
            lon_max: 512,
            lat_max: 256,
            num_fourier: 170,
            num_spherical: 171,
        },
    ),
];

impl Resolution {
    /// Look up a preset by name, e.g. `"T42"`.
    pub fn preset(name: &str) -> Result<Self> {
        PRESETS
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, r)| *r)
            .ok_or_else(|| ConfigError::UnknownResolution(name.to_string()))
    }

    /// Namelist entries for this grid, optionally overriding the level count.
    pub fn to_section(&self, num_levels: Option<i64>) -> Section {
        let mut section = Section::new();
        section.insert("lon_max".into(), self.lon_max.into());
        section.insert("lat_max".into(), self.lat_max.into());
        section.insert("num_fourier".into(), self.num_fourier.into());
        section.insert("num_spherical".into(), self.num_spherical.into());
        if let Some(levels) = num_levels {
            section.insert("num_levels".into(), levels.into());
        }
        section
    }
}
