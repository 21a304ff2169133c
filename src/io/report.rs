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

use super::{CsvSnafu, InputOutputError, StdIOSnafu};
use crate::cosmic::EpochFormat;
use crate::od::estimate::{FilterSummary, MeasurementRecord, SmoothedRecord, UpdateRecord};
use snafu::ResultExt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Receives every record as it is produced, and the summary at the end of a run.
pub trait ReportSink {
    fn filter_update(&mut self, record: &UpdateRecord) -> Result<(), InputOutputError>;

    fn smoother_update(&mut self, record: &SmoothedRecord) -> Result<(), InputOutputError>;

    fn run_complete(&mut self, summary: &FilterSummary) -> Result<(), InputOutputError>;
}

/// Discards everything.
#[derive(Copy, Clone, Debug, Default)]
pub struct NullReport;

impl ReportSink for NullReport {
    fn filter_update(&mut self, _record: &UpdateRecord) -> Result<(), InputOutputError> {
        Ok(())
    }

    fn smoother_update(&mut self, _record: &SmoothedRecord) -> Result<(), InputOutputError> {
        Ok(())
    }

    fn run_complete(&mut self, _summary: &FilterSummary) -> Result<(), InputOutputError> {
        Ok(())
    }
}

fn values_str(values: &[f64]) -> String {
    values
        .iter()
        .map(|v| format!("{v:>17.9e}"))
        .collect::<Vec<String>>()
        .join(" ")
}

fn scaled_str(msr: Option<&MeasurementRecord>) -> String {
    match msr.and_then(|msr| msr.scaled.as_ref()) {
        Some(scaled) => scaled
            .iter()
            .map(|v| format!("{v:>10.4}"))
            .collect::<Vec<String>>()
            .join(" "),
        None => format!("{:>10}", "-"),
    }
}

/// Human readable report, one line per record.
pub struct TextReport {
    out: BufWriter<File>,
    format: EpochFormat,
}

impl TextReport {
    pub fn new<P: AsRef<Path>>(path: P, format: EpochFormat) -> Result<Self, InputOutputError> {
        let file = File::create(path.as_ref()).context(StdIOSnafu {
            action: "creating text report",
        })?;
        info!("Saving report to {}", path.as_ref().display());
        Ok(Self {
            out: BufWriter::new(file),
            format,
        })
    }

    fn line(
        &mut self,
        epoch: String,
        tag: &str,
        state: String,
        scaled: String,
        vnb: String,
    ) -> Result<(), InputOutputError> {
        writeln!(self.out, "{epoch:<26} {tag:<6} {state}  | {scaled} | {vnb}").context(
            StdIOSnafu {
                action: "writing text report",
            },
        )
    }
}

impl ReportSink for TextReport {
    fn filter_update(&mut self, record: &UpdateRecord) -> Result<(), InputOutputError> {
        let tag = match record.edit_flag() {
            Some(flag) => flag.report_str(),
            None => "TU",
        };
        self.line(
            self.format.format(record.epoch),
            tag,
            values_str(record.state.as_slice()),
            scaled_str(record.measurement.as_ref()),
            format!(
                "{:.6e} {:.6e} {:.6e}",
                record.vnb_sigma[0], record.vnb_sigma[1], record.vnb_sigma[2]
            ),
        )
    }

    fn smoother_update(&mut self, record: &SmoothedRecord) -> Result<(), InputOutputError> {
        let tag = if record.combined { "S" } else { "S-FWD" };
        self.line(
            self.format.format(record.epoch),
            tag,
            values_str(record.state.as_slice()),
            scaled_str(record.measurement.as_ref()),
            format!(
                "{:.6e} {:.6e} {:.6e}",
                record.vnb_sigma[0], record.vnb_sigma[1], record.vnb_sigma[2]
            ),
        )
    }

    fn run_complete(&mut self, summary: &FilterSummary) -> Result<(), InputOutputError> {
        writeln!(self.out, "\n{summary}")
            .and_then(|_| self.out.flush())
            .context(StdIOSnafu {
                action: "finalizing text report",
            })
    }
}

/// Numeric CSV export. The header is written with the first record, whose state size sets the columns.
pub struct CsvExport {
    wtr: csv::Writer<File>,
    format: EpochFormat,
    num_states: Option<usize>,
}

impl CsvExport {
    pub fn new<P: AsRef<Path>>(path: P, format: EpochFormat) -> Result<Self, InputOutputError> {
        let wtr = csv::Writer::from_path(path.as_ref()).context(CsvSnafu {
            action: "creating CSV export",
        })?;
        info!("Saving export to {}", path.as_ref().display());
        Ok(Self {
            wtr,
            format,
            num_states: None,
        })
    }

    fn header(&mut self, n: usize) -> Result<(), InputOutputError> {
        if self.num_states.is_some() {
            return Ok(());
        }
        let mut hdr = vec![
            format!("Epoch:{}", self.format),
            "kind".to_string(),
            "record".to_string(),
            "flag".to_string(),
        ];
        hdr.extend((0..n).map(|i| format!("x_{i}")));
        hdr.extend((0..n).map(|i| format!("sigma_{i}")));
        hdr.extend(
            ["max_scaled_residual", "sigma_V", "sigma_N", "sigma_B"]
                .iter()
                .map(|s| s.to_string()),
        );
        self.wtr.write_record(&hdr).context(CsvSnafu {
            action: "writing CSV export header",
        })?;
        self.num_states = Some(n);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn row(
        &mut self,
        epoch: String,
        kind: &str,
        msr: Option<&MeasurementRecord>,
        state: &[f64],
        sigmas: &[f64],
        vnb: &[f64],
    ) -> Result<(), InputOutputError> {
        self.header(state.len())?;
        let mut row = vec![
            epoch,
            kind.to_string(),
            msr.map_or(String::new(), |msr| msr.record_num.to_string()),
            msr.map_or(String::new(), |msr| msr.edit_flag.to_string()),
        ];
        row.extend(state.iter().map(|v| format!("{v:.16e}")));
        row.extend(sigmas.iter().map(|v| format!("{v:.16e}")));
        row.push(
            msr.and_then(|msr| msr.max_scaled())
                .map_or(String::new(), |v| format!("{v:.6}")),
        );
        row.extend(vnb.iter().map(|v| format!("{v:.16e}")));
        self.wtr.write_record(&row).context(CsvSnafu {
            action: "writing CSV export row",
        })
    }
}

impl ReportSink for CsvExport {
    fn filter_update(&mut self, record: &UpdateRecord) -> Result<(), InputOutputError> {
        self.row(
            self.format.format(record.epoch),
            if record.is_obs { "filter-msr" } else { "filter-tu" },
            record.measurement.as_ref(),
            record.state.as_slice(),
            record.sigmas().as_slice(),
            record.vnb_sigma.as_slice(),
        )
    }

    fn smoother_update(&mut self, record: &SmoothedRecord) -> Result<(), InputOutputError> {
        self.row(
            self.format.format(record.epoch),
            if record.is_obs { "smoother-msr" } else { "smoother-tu" },
            record.measurement.as_ref(),
            record.state.as_slice(),
            record.sigmas().as_slice(),
            record.vnb_sigma.as_slice(),
        )
    }

    fn run_complete(&mut self, summary: &FilterSummary) -> Result<(), InputOutputError> {
        debug!("CSV export complete @ {}", summary.epoch);
        self.wtr
            .flush()
            .map_err(csv::Error::from)
            .context(CsvSnafu {
                action: "flushing CSV export",
            })
    }
}

#[cfg(test)]
mod ut_report {
    use super::*;
    use crate::linalg::{DMatrix, DVector, Matrix3, Vector3};
    use crate::od::estimate::EditFlag;
    use crate::time::Epoch;
    use std::collections::BTreeMap;

    fn record(epoch: Epoch) -> UpdateRecord {
        let covar = DMatrix::from_diagonal_element(6, 6, 4.0);
        UpdateRecord {
            is_obs: true,
            epoch,
            state_pre: DVector::zeros(6),
            state: DVector::from_element(6, 1.0),
            covar_bar: covar.clone(),
            covar,
            stm: DMatrix::identity(6, 6),
            process_noise: DMatrix::zeros(6, 6),
            vnb_covar: Matrix3::identity(),
            vnb_sigma: Vector3::new(1.0, 1.0, 1.0),
            measurement: Some(MeasurementRecord {
                record_num: 3,
                epoch,
                observed: DVector::from_element(1, 10.0),
                computed: Some(DVector::from_element(1, 9.0)),
                prefit: Some(DVector::from_element(1, 1.0)),
                postfit: Some(DVector::from_element(1, 0.5)),
                scaled: Some(DVector::from_element(1, -2.5)),
                noise_covar: DMatrix::identity(1, 1),
                innovation_covar: None,
                edit_flag: EditFlag::Normal,
                edited_component: None,
            }),
        }
    }

    #[test]
    fn csv_export_layout() {
        let path = std::env::temp_dir().join("seqod_ut_report.csv");
        let epoch = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
        let rec = record(epoch);
        let summary = FilterSummary {
            epoch,
            state: rec.state.clone(),
            keplerian: None,
            keplerian_covar: None,
            covar: rec.covar.clone(),
            information: None,
            iterations: 1,
            num_records: 1,
            edit_counts: BTreeMap::new(),
        };
        {
            let mut export = CsvExport::new(&path, EpochFormat::UTCGregorian).unwrap();
            export.filter_update(&rec).unwrap();
            export.run_complete(&summary).unwrap();
        }
        let mut rdr = csv::Reader::from_path(&path).unwrap();
        let headers = rdr.headers().unwrap().clone();
        assert_eq!(headers.len(), 4 + 12 + 4);
        let row = rdr.records().next().unwrap().unwrap();
        assert_eq!(&row[0], "01 Jan 2024 00:00:00.000");
        assert_eq!(&row[2], "3");
        assert_eq!(&row[3], "N");
        assert_eq!(&row[16], "2.500000");
        assert_eq!(row[10].parse::<f64>().unwrap(), 2.0);
    }

    #[test]
    fn text_report_lines() {
        let path = std::env::temp_dir().join("seqod_ut_report.txt");
        let epoch = Epoch::from_gregorian_utc_at_midnight(2024, 1, 1);
        {
            let mut report = TextReport::new(&path, EpochFormat::UTCGregorian).unwrap();
            report.filter_update(&record(epoch)).unwrap();
            report
                .run_complete(&FilterSummary {
                    epoch,
                    state: DVector::zeros(6),
                    keplerian: None,
                    keplerian_covar: None,
                    covar: DMatrix::zeros(6, 6),
                    information: None,
                    iterations: 1,
                    num_records: 1,
                    edit_counts: BTreeMap::new(),
                })
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let first = text.lines().next().unwrap();
        assert!(first.starts_with("01 Jan 2024 00:00:00.000"));
        assert!(first.contains("-2.5000"));
        assert!(text.contains("Final estimate"));
    }
}
