/*
    Nyx, blazing fast astrodynamics
    Copyright (C) 2018-onwards Christopher Rabotin <christopher.rabotin@gmail.com>

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use crate::cosmic::EpochFormat;
use crate::linalg::{from_lower_triangle, lower_triangle, DMatrix, DVector};
use crate::time::Epoch;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const EPOCH_PREFIX: &str = "Epoch.";
const COVARIANCE_PREFIX: &str = "Covariance_";

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum WarmStartError {
    #[snafu(display("cannot open warm-start file {}: {source}", path.display()))]
    Open { path: PathBuf, source: csv::Error },
    #[snafu(display("warm-start file {} has no `Epoch.<format>` column", path.display()))]
    NoEpochColumn { path: PathBuf },
    #[snafu(display("warm-start epoch column `{column}` uses an unknown time format"))]
    UnknownEpochFormat { column: String },
    #[snafu(display("warm-start file {} has no covariance columns", path.display()))]
    NoCovarianceBlock { path: PathBuf },
    #[snafu(display("warm-start row {row} has {got} values but the header has {expected}"))]
    ColumnMismatch {
        row: usize,
        expected: usize,
        got: usize,
    },
    #[snafu(display("warm-start row {row} column `{column}` holds malformed value `{value}`"))]
    MalformedValue {
        row: usize,
        column: String,
        value: String,
    },
    #[snafu(display("no warm-start record satisfies {selector:?}"))]
    NoQualifyingRow { selector: RowSelector },
    #[snafu(display("failed to write warm-start file {}: {source}", path.display()))]
    Write { path: PathBuf, source: csv::Error },
}

impl PartialEq for WarmStartError {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// Which record of a warm-start file to restore.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RowSelector {
    /// The last row of the file.
    Last,
    /// The last row whose epoch is strictly before the provided epoch.
    StrictlyBefore(Epoch),
    /// The last row whose epoch is at or before the provided epoch.
    NotAfter(Epoch),
}

/// A single state and covariance snapshot.
#[derive(Clone, Debug, PartialEq)]
pub struct WarmStartRecord {
    pub epoch: Epoch,
    /// Names of the state components, in file order.
    pub names: Vec<String>,
    /// State values, in the order of `names`.
    pub state: DVector<f64>,
    /// Covariance, in the order of `names`.
    pub covar: DMatrix<f64>,
}

struct Layout {
    epoch_col: usize,
    format: EpochFormat,
    state_cols: Vec<(usize, String)>,
    // (column, row index, column index) in state component order
    covar_cols: Vec<(usize, usize, usize)>,
}

fn parse_layout(path: &Path, headers: &csv::StringRecord) -> Result<Layout, WarmStartError> {
    let (epoch_col, epoch_hdr) = headers
        .iter()
        .enumerate()
        .find(|(_, h)| h.starts_with(EPOCH_PREFIX))
        .context(NoEpochColumnSnafu { path })?;

    let format = EpochFormat::from_str(&epoch_hdr[EPOCH_PREFIX.len()..]).map_err(|_| {
        WarmStartError::UnknownEpochFormat {
            column: epoch_hdr.to_string(),
        }
    })?;

    let mut state_cols = Vec::new();
    let mut covar_cols = Vec::new();
    for (col, hdr) in headers.iter().enumerate() {
        if col == epoch_col {
            continue;
        }
        if let Some(indexes) = hdr.strip_prefix(COVARIANCE_PREFIX) {
            let parsed: Vec<usize> = indexes
                .split('_')
                .filter_map(|idx| usize::from_str(idx).ok())
                .collect();
            if parsed.len() == 2 && parsed[0] > 0 && parsed[1] > 0 {
                covar_cols.push((col, parsed[0] - 1, parsed[1] - 1));
            } else {
                warn!("ignoring malformed warm-start covariance column `{hdr}`");
            }
        } else {
            state_cols.push((col, hdr.to_string()));
        }
    }

    ensure!(!covar_cols.is_empty(), NoCovarianceBlockSnafu { path });

    Ok(Layout {
        epoch_col,
        format,
        state_cols,
        covar_cols,
    })
}

fn parse_value(row: usize, column: &str, value: &str) -> Result<f64, WarmStartError> {
    f64::from_str(value.trim()).map_err(|_| WarmStartError::MalformedValue {
        row,
        column: column.to_string(),
        value: value.to_string(),
    })
}

/// Reads the warm-start record selected by `selector` from a CSV file.
///
/// The header holds an `Epoch.<format>` column, the state component names, then the row-major lower triangle of the
/// covariance as `Covariance_i_j` (one-indexed in state component order). Every data row must have as many values as
/// the header, even those which are not selected.
pub fn read_warm_start<P: AsRef<Path>>(
    path: P,
    selector: RowSelector,
) -> Result<WarmStartRecord, WarmStartError> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .context(OpenSnafu { path })?;

    let headers = rdr.headers().context(OpenSnafu { path })?.clone();
    let layout = parse_layout(path, &headers)?;

    let mut selected: Option<(usize, Epoch, csv::StringRecord)> = None;

    for (row_idx, result) in rdr.records().enumerate() {
        // Header is row zero
        let row = row_idx + 1;
        let record = result.context(OpenSnafu { path })?;
        ensure!(
            record.len() == headers.len(),
            ColumnMismatchSnafu {
                row,
                expected: headers.len(),
                got: record.len()
            }
        );

        let epoch_str = &record[layout.epoch_col];
        let epoch = layout
            .format
            .parse(epoch_str)
            .map_err(|_| WarmStartError::MalformedValue {
                row,
                column: headers[layout.epoch_col].to_string(),
                value: epoch_str.to_string(),
            })?;

        let qualifies = match selector {
            RowSelector::Last => true,
            RowSelector::StrictlyBefore(target) => epoch < target,
            RowSelector::NotAfter(target) => epoch <= target,
        };
        if qualifies {
            selected = Some((row, epoch, record));
        }
    }

    let (row, epoch, record) = selected.context(NoQualifyingRowSnafu { selector })?;

    let n = layout.state_cols.len();
    let mut names = Vec::with_capacity(n);
    let mut state = DVector::zeros(n);
    for (i, (col, name)) in layout.state_cols.iter().enumerate() {
        state[i] = parse_value(row, name, &record[*col])?;
        names.push(name.clone());
    }

    let mut covar = DMatrix::zeros(n, n);
    for (col, i, j) in &layout.covar_cols {
        if *i >= n || *j >= n {
            warn!(
                "warm-start column `{}` is outside of the {n} state components",
                &headers[*col]
            );
            continue;
        }
        let value = parse_value(row, &headers[*col], &record[*col])?;
        covar[(*i, *j)] = value;
        covar[(*j, *i)] = value;
    }

    info!(
        "restoring warm-start record from {} at {} ({n} components)",
        path.display(),
        layout.format.format(epoch)
    );

    Ok(WarmStartRecord {
        epoch,
        names,
        state,
        covar,
    })
}

/// Writes warm-start records, one row per record, with the epoch in the provided format.
pub fn write_warm_start<'a, P, I>(
    path: P,
    names: &[String],
    format: EpochFormat,
    records: I,
) -> Result<(), WarmStartError>
where
    P: AsRef<Path>,
    I: IntoIterator<Item = (Epoch, &'a DVector<f64>, &'a DMatrix<f64>)>,
{
    let path = path.as_ref();
    let mut wtr = csv::Writer::from_path(path).context(WriteSnafu { path })?;

    let n = names.len();
    let mut headers = Vec::with_capacity(1 + n + n * (n + 1) / 2);
    headers.push(format!("{EPOCH_PREFIX}{format}"));
    headers.extend(names.iter().cloned());
    for i in 1..=n {
        for j in 1..=i {
            headers.push(format!("{COVARIANCE_PREFIX}{i}_{j}"));
        }
    }
    wtr.write_record(&headers).context(WriteSnafu { path })?;

    let mut count = 0;
    for (epoch, state, covar) in records {
        let mut row = Vec::with_capacity(headers.len());
        row.push(format.format(epoch));
        row.extend(state.iter().map(|v| format!("{v:.16e}")));
        row.extend(lower_triangle(covar).iter().map(|v| format!("{v:.16e}")));
        wtr.write_record(&row).context(WriteSnafu { path })?;
        count += 1;
    }

    wtr.flush()
        .map_err(csv::Error::from)
        .context(WriteSnafu { path })?;

    info!("wrote {count} warm-start records to {}", path.display());
    Ok(())
}

impl WarmStartRecord {
    /// Rebuilds the covariance from a flattened lower triangle, used when records are assembled by hand.
    pub fn from_lower_triangle(
        epoch: Epoch,
        names: Vec<String>,
        state: DVector<f64>,
        flat_covar: &[f64],
    ) -> Option<Self> {
        let covar = from_lower_triangle(names.len(), flat_covar)?;
        Some(Self {
            epoch,
            names,
            state,
            covar,
        })
    }
}
