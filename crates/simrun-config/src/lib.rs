//! simrun-config: experiment configuration model
//!
//! Provides the two files every model run is driven by:
//! - [`Namelist`]: sectioned key/value parameters written as `input.nml`
//! - [`DiagTable`]: output file and field declarations written as `diag_table`

pub mod diag_table;
pub mod error;
pub mod namelist;
pub mod resolution;
pub mod value;

pub use diag_table::{DiagField, DiagTable, OutputFile, CALENDAR_SENTINEL};
pub use error::{ConfigError, Result};
pub use namelist::{Namelist, Section};
pub use resolution::{Resolution, SPECTRAL_SECTION};
pub use value::{coerce_token, NamelistValue};
