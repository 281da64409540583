//! ETL calibration table.
//!
//! Maps a (wavelength, zoom) pair to the left/right ETL offset and amplitude.
//! The table lives in a `;`-delimited file with the header
//!
//! ```text
//! Objective;Wavelength;Zoom;ETL-Left-Offset;ETL-Left-Amp;ETL-Right-Offset;ETL-Right-Amp
//! ```
//!
//! Column order is taken from the header. Rows that cannot be parsed are
//! skipped with a warning. Writes go through [`rewrite_row`], which replaces a
//! single row and swaps the file in via a `<file>_tmp` sibling.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Terminator, Trim, WriterBuilder};
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};

const DELIMITER: u8 = b';';

const COL_OBJECTIVE: &str = "Objective";
const COL_WAVELENGTH: &str = "Wavelength";
const COL_ZOOM: &str = "Zoom";
const COL_LEFT_OFFSET: &str = "ETL-Left-Offset";
const COL_LEFT_AMP: &str = "ETL-Left-Amp";
const COL_RIGHT_OFFSET: &str = "ETL-Right-Offset";
const COL_RIGHT_AMP: &str = "ETL-Right-Amp";

/// Offset/amplitude pairs for both ETLs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EtlSettings {
    /// Left ETL offset in volts.
    pub left_offset: f64,
    /// Left ETL ramp amplitude in volts.
    pub left_amplitude: f64,
    /// Right ETL offset in volts.
    pub right_offset: f64,
    /// Right ETL ramp amplitude in volts.
    pub right_amplitude: f64,
}

/// One row of the calibration table.
#[derive(Debug, Clone, PartialEq)]
pub struct EtlCalibrationRow {
    /// Objective name, empty when the table has no `Objective` column.
    pub objective: String,
    /// Laser designation, e.g. `488 nm`.
    pub wavelength: String,
    /// Zoom designation, e.g. `2x`.
    pub zoom: String,
    /// ETL values for this combination.
    pub settings: EtlSettings,
}

// =============================================================================
// Column layout
// =============================================================================

/// Positions of the named columns, resolved from the header.
#[derive(Debug, Clone, Copy)]
struct Columns {
    objective: Option<usize>,
    wavelength: usize,
    zoom: usize,
    left_offset: usize,
    left_amp: usize,
    right_offset: usize,
    right_amp: usize,
}

impl Columns {
    fn from_header(header: &StringRecord) -> AppResult<Self> {
        let find = |name: &str| header.iter().position(|h| h == name);
        let require = |name: &str| {
            find(name).ok_or_else(|| {
                DaqError::Calibration(format!("calibration header is missing column '{name}'"))
            })
        };

        Ok(Self {
            objective: find(COL_OBJECTIVE),
            wavelength: require(COL_WAVELENGTH)?,
            zoom: require(COL_ZOOM)?,
            left_offset: require(COL_LEFT_OFFSET)?,
            left_amp: require(COL_LEFT_AMP)?,
            right_offset: require(COL_RIGHT_OFFSET)?,
            right_amp: require(COL_RIGHT_AMP)?,
        })
    }

    fn matches(&self, record: &StringRecord, wavelength: &str, zoom: &str) -> bool {
        record.get(self.wavelength) == Some(wavelength) && record.get(self.zoom) == Some(zoom)
    }

    fn parse_row(&self, record: &StringRecord) -> Result<EtlCalibrationRow, String> {
        let text = |idx: usize, name: &str| {
            record
                .get(idx)
                .map(str::to_owned)
                .ok_or_else(|| format!("missing field '{name}'"))
        };
        let number = |idx: usize, name: &str| -> Result<f64, String> {
            let raw = text(idx, name)?;
            raw.parse::<f64>()
                .map_err(|_| format!("field '{name}' is not a number: '{raw}'"))
        };

        Ok(EtlCalibrationRow {
            objective: self
                .objective
                .and_then(|idx| record.get(idx))
                .unwrap_or_default()
                .to_owned(),
            wavelength: text(self.wavelength, COL_WAVELENGTH)?,
            zoom: text(self.zoom, COL_ZOOM)?,
            settings: EtlSettings {
                left_offset: number(self.left_offset, COL_LEFT_OFFSET)?,
                left_amplitude: number(self.left_amp, COL_LEFT_AMP)?,
                right_offset: number(self.right_offset, COL_RIGHT_OFFSET)?,
                right_amplitude: number(self.right_amp, COL_RIGHT_AMP)?,
            },
        })
    }
}

// =============================================================================
// Table
// =============================================================================

/// Ordered calibration rows. Lookup is a linear scan; the first match wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EtlCalibrationTable {
    rows: Vec<EtlCalibrationRow>,
}

impl EtlCalibrationTable {
    /// Load the table from a calibration file.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path).map_err(|e| {
            DaqError::Calibration(format!(
                "cannot open calibration file {}: {e}",
                path.display()
            ))
        })?;
        let table = Self::from_reader(file)?;
        info!(
            path = %path.display(),
            rows = table.len(),
            "Loaded ETL calibration table"
        );
        Ok(table)
    }

    /// Parse a table from any reader. Malformed rows are skipped.
    pub fn from_reader<R: Read>(reader: R) -> AppResult<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(DELIMITER)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(reader);

        let columns = Columns::from_header(reader.headers()?)?;

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!(row = index + 1, error = %e, "Skipping unreadable calibration row");
                    continue;
                }
            };
            match columns.parse_row(&record) {
                Ok(row) => rows.push(row),
                Err(reason) => {
                    warn!(row = index + 1, %reason, "Skipping malformed calibration row");
                }
            }
        }

        Ok(Self { rows })
    }

    /// First row matching `(wavelength, zoom)`.
    pub fn lookup(&self, wavelength: &str, zoom: &str) -> Option<&EtlSettings> {
        self.rows
            .iter()
            .find(|row| row.wavelength == wavelength && row.zoom == zoom)
            .map(|row| &row.settings)
    }

    /// Replace the settings of the first matching row in memory.
    ///
    /// Returns `false` if no row matches.
    pub fn update(&mut self, wavelength: &str, zoom: &str, settings: EtlSettings) -> bool {
        match self
            .rows
            .iter_mut()
            .find(|row| row.wavelength == wavelength && row.zoom == zoom)
        {
            Some(row) => {
                row.settings = settings;
                true
            }
            None => false,
        }
    }

    pub fn rows(&self) -> &[EtlCalibrationRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// =============================================================================
// Atomic rewrite
// =============================================================================

fn temp_path(path: &Path) -> AppResult<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        DaqError::Calibration(format!("invalid calibration path {}", path.display()))
    })?;
    let mut tmp = name.to_os_string();
    tmp.push("_tmp");
    Ok(path.with_file_name(tmp))
}

fn parse_line(line: &[u8]) -> AppResult<Option<StringRecord>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(DELIMITER)
        .has_headers(false)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(line);
    let record = reader.records().next().transpose()?;
    Ok(record)
}

fn line_terminator(line: &[u8]) -> &[u8] {
    if line.ends_with(b"\r\n") {
        b"\r\n"
    } else if line.ends_with(b"\n") {
        b"\n"
    } else {
        b""
    }
}

fn render_row(
    original: &StringRecord,
    columns: &Columns,
    settings: &EtlSettings,
    terminator: &[u8],
) -> AppResult<Vec<u8>> {
    let mut fields: Vec<String> = original.iter().map(str::to_owned).collect();
    let width = [
        columns.left_offset,
        columns.left_amp,
        columns.right_offset,
        columns.right_amp,
    ]
    .into_iter()
    .max()
    .unwrap_or(0)
        + 1;
    if fields.len() < width {
        fields.resize(width, String::new());
    }
    fields[columns.left_offset] = settings.left_offset.to_string();
    fields[columns.left_amp] = settings.left_amplitude.to_string();
    fields[columns.right_offset] = settings.right_offset.to_string();
    fields[columns.right_amp] = settings.right_amplitude.to_string();

    let mut writer = WriterBuilder::new()
        .delimiter(DELIMITER)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer.write_record(&fields)?;
    let mut bytes = writer
        .into_inner()
        .map_err(|e| DaqError::Calibration(format!("cannot render calibration row: {e}")))?;
    bytes.pop();
    bytes.extend_from_slice(terminator);
    Ok(bytes)
}

/// Persist `settings` into the first row matching `(wavelength, zoom)`.
///
/// Every other line of the file, header included, is written back byte for
/// byte. The new content goes to `<file>_tmp`, the original is removed and the
/// temporary file is renamed into place.
///
/// # Errors
///
/// `Calibration` if the file has no matching row; the file is left untouched
/// in that case.
pub fn rewrite_row(
    path: impl AsRef<Path>,
    wavelength: &str,
    zoom: &str,
    settings: &EtlSettings,
) -> AppResult<()> {
    let path = path.as_ref();
    let content = fs::read(path)?;

    let mut lines = content.split_inclusive(|&b| b == b'\n');
    let header_line = lines
        .next()
        .ok_or_else(|| DaqError::Calibration(format!("{} is empty", path.display())))?;
    let header = parse_line(header_line)?
        .ok_or_else(|| DaqError::Calibration(format!("{} has no header", path.display())))?;
    let columns = Columns::from_header(&header)?;

    let mut output = Vec::with_capacity(content.len() + 64);
    output.extend_from_slice(header_line);

    let mut replaced = false;
    for line in lines {
        if !replaced {
            if let Some(record) = parse_line(line)? {
                if columns.matches(&record, wavelength, zoom) {
                    output.extend(render_row(
                        &record,
                        &columns,
                        settings,
                        line_terminator(line),
                    )?);
                    replaced = true;
                    continue;
                }
            }
        }
        output.extend_from_slice(line);
    }

    if !replaced {
        return Err(DaqError::Calibration(format!(
            "no calibration row for wavelength '{wavelength}' and zoom '{zoom}' in {}",
            path.display()
        )));
    }

    let tmp = temp_path(path)?;
    fs::write(&tmp, &output)?;
    fs::remove_file(path)?;
    fs::rename(&tmp, path)?;

    debug!(path = %path.display(), wavelength, zoom, "Rewrote calibration row");
    Ok(())
}
