//! Fortran namelist configuration (`input.nml`).
//!
//! A [`Namelist`] maps section names (`main_nml`, `spectral_dynamics_nml`, ...)
//! to key/value sections. Updates merge into existing sections rather than
//! replacing them, so a run can be configured incrementally.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, Result};
use crate::value::NamelistValue;

/// Parameters of one namelist group, in lexicographic key order.
pub type Section = BTreeMap<String, NamelistValue>;

/// Sectioned key/value model configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namelist {
    sections: BTreeMap<String, Section>,
}

impl Namelist {
    /// Output column width. Most string parameters are 256 characters wide in
    /// the model, so this leaves room for indentation and the key itself.
    pub const COLUMN_WIDTH: usize = 350;

    pub fn new() -> Self {
        Self::default()
    }

    /// Merge each section's keys into the store, creating sections as needed.
    pub fn update<I, S>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (S, Section)>,
        S: Into<String>,
    {
        for (name, values) in updates {
            self.sections.entry(name.into()).or_default().extend(values);
        }
    }

    /// Merge loosely typed entries into a single section.
    pub fn update_section<I, K, V>(&mut self, section: &str, entries: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<NamelistValue>,
    {
        let target = self.sections.entry(section.to_string()).or_default();
        for (k, v) in entries {
            target.insert(k.into(), v.into());
        }
    }

    /// Set a single parameter.
    pub fn set(&mut self, section: &str, key: &str, value: impl Into<NamelistValue>) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&NamelistValue> {
        self.sections.get(section).and_then(|s| s.get(key))
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.get(name)
    }

    pub fn sections(&self) -> impl Iterator<Item = (&String, &Section)> {
        self.sections.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Render in Fortran namelist syntax.
    ///
    /// Values are never wrapped or truncated; a line that exceeds
    /// [`Self::COLUMN_WIDTH`] is written whole and logged.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, section) in &self.sections {
            out.push_str(&format!("&{}\n", name));
            for (key, value) in section {
                let line = format!("    {} = {}", key, value.to_fortran());
                if line.len() > Self::COLUMN_WIDTH {
                    warn!(
                        section = %name,
                        key = %key,
                        width = line.len(),
                        "namelist line exceeds column width"
                    );
                }
                out.push_str(&line);
                out.push('\n');
            }
            out.push_str("/\n\n");
        }
        out
    }

    /// Write the rendered namelist to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), sections = self.sections.len(), "writing namelist");
        std::fs::write(path, self.render()).map_err(|e| ConfigError::io("write namelist", path, e))
    }
}
