//! Diagnostics output table (`diag_table`).
//!
//! Declares which output files the model writes and which fields go into
//! each. The text format is a comma-separated record per line:
//!
//! ```text
//! "daily", 1, "days", 1, "days", "time",
//! "dynamics", "temp", "temp", "daily", "all", .false., "none", 2,
//! ```
//!
//! The trailing comma matters: a file record splits into 7 tokens and a
//! field record into 9.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, Result};
use crate::value::{coerce_token, NamelistValue};

/// Line marking a table written with a calendar.
pub const CALENDAR_SENTINEL: &str = "0001 1 1 0 0 0";
const NO_CALENDAR_LINE: &str = "0 0 0 0 0 0";
const FILE_RECORD_TOKENS: usize = 7;
const FIELD_RECORD_TOKENS: usize = 9;

/// One requested model field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagField {
    pub module: String,
    pub name: String,
    pub time_avg: bool,
}

/// One output file and its fields, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    pub freq: i64,
    pub units: String,
    pub time_units: String,
    pub fields: Vec<DiagField>,
}

/// Ordered set of output file declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiagTable {
    files: Vec<OutputFile>,
    #[serde(default)]
    calendar: Option<String>,
}

impl DiagTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an output file. Re-declaring a name replaces the earlier
    /// descriptor (and its fields) in place.
    pub fn add_file(&mut self, name: &str, freq: i64, units: &str, time_units: Option<&str>) {
        let file = OutputFile {
            name: name.to_string(),
            freq,
            units: units.to_string(),
            time_units: time_units.unwrap_or(units).to_string(),
            fields: Vec::new(),
        };
        match self.files.iter_mut().find(|f| f.name == name) {
            Some(existing) => *existing = file,
            None => self.files.push(file),
        }
    }

    /// Append a field to the named files, or to every declared file when
    /// `files` is `None`.
    ///
    /// Fails without modifying the table if any target is undeclared.
    pub fn add_field(
        &mut self,
        module: &str,
        name: &str,
        time_avg: bool,
        files: Option<&[&str]>,
    ) -> Result<()> {
        let targets: Vec<String> = match files {
            Some(names) => names.iter().map(|n| n.to_string()).collect(),
            None => self.file_names().map(str::to_string).collect(),
        };
        if let Some(missing) = targets.iter().find(|t| self.file(t).is_none()) {
            return Err(ConfigError::UnknownFile(missing.clone()));
        }
        for target in &targets {
            if let Some(file) = self.files.iter_mut().find(|f| &f.name == target) {
                file.fields.push(DiagField {
                    module: module.to_string(),
                    name: name.to_string(),
                    time_avg,
                });
            }
        }
        Ok(())
    }

    pub fn file(&self, name: &str) -> Option<&OutputFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn files(&self) -> &[OutputFile] {
        &self.files
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }

    /// A table with no output files cannot drive a run.
    pub fn is_valid(&self) -> bool {
        !self.files.is_empty()
    }

    pub fn calendar(&self) -> Option<&str> {
        self.calendar.as_deref()
    }

    pub fn set_calendar(&mut self, calendar: Option<String>) {
        self.calendar = calendar;
    }

    pub fn has_calendar(&self) -> bool {
        match &self.calendar {
            None => false,
            Some(c) => !c.eq_ignore_ascii_case("no_calendar"),
        }
    }

    /// Parse diag table text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut table = DiagTable::new();
        for (idx, line) in text.lines().enumerate() {
            let lx = line.trim();
            if lx.is_empty() || lx.starts_with('#') {
                continue;
            }
            if lx == CALENDAR_SENTINEL {
                table.calendar = Some("undefined".to_string());
                continue;
            }
            let vals: Vec<NamelistValue> = lx.split(',').map(coerce_token).collect();
            let line_no = idx + 1;
            match vals.len() {
                FILE_RECORD_TOKENS => {
                    let freq = vals[1].as_int().ok_or_else(|| ConfigError::InvalidRecord {
                        line: line_no,
                        reason: format!("output frequency '{}' is not an integer", vals[1]),
                    })?;
                    table.add_file(
                        &vals[0].to_string(),
                        freq,
                        &vals[2].to_string(),
                        Some(&vals[4].to_string()),
                    );
                }
                FIELD_RECORD_TOKENS => {
                    let time_avg = vals[5].as_bool().ok_or_else(|| ConfigError::InvalidRecord {
                        line: line_no,
                        reason: format!("time_avg '{}' is not a logical", vals[5]),
                    })?;
                    let target = vals[3].to_string();
                    table.add_field(
                        &vals[0].to_string(),
                        &vals[1].to_string(),
                        time_avg,
                        Some(&[target.as_str()]),
                    )?;
                }
                _ => {}
            }
        }
        Ok(table)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::io("read diag table", path, e))?;
        Self::parse(&text)
    }

    /// Render the table. Files and fields keep insertion order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("\"FMS Model results\"\n");
        if self.has_calendar() {
            out.push_str(CALENDAR_SENTINEL);
        } else {
            out.push_str(NO_CALENDAR_LINE);
        }
        out.push_str("\n# = output files =\n");
        out.push_str("# file_name, output_freq, output_units, format, time_units, long_name\n\n");
        for file in &self.files {
            out.push_str(&format!(
                "\"{}\", {}, \"{}\", 1, \"{}\", \"time\",\n",
                file.name, file.freq, file.units, file.time_units
            ));
        }
        out.push_str("\n# = diagnostic field entries =\n");
        out.push_str(
            "# module_name, field_name, output_name, file_name, time_sampling, time_avg, other_opts, precision\n\n",
        );
        for file in &self.files {
            for field in &file.fields {
                out.push_str(&format!(
                    "\"{}\", \"{}\", \"{}\", \"{}\", \"all\", {}, \"none\", 2,\n",
                    field.module,
                    field.name,
                    field.name,
                    file.name,
                    NamelistValue::Bool(field.time_avg).to_fortran()
                ));
            }
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        debug!(path = %path.display(), files = self.files.len(), "writing diag table");
        std::fs::write(path, self.render()).map_err(|e| ConfigError::io("write diag table", path, e))
    }
}
