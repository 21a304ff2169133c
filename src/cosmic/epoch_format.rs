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

use crate::io::ConfigError;
use crate::time::{Duration, Epoch, TimeScale, TimeUnits, Unit};
use enum_iterator::Sequence;
use hifitime::efmt::{Format, Formatter};
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Two epochs closer than this many seconds are the same estimation epoch.
pub const ESTTIME_ROUNDOFF_S: f64 = 1.0e-6;

/// Julian date of the modified Julian reference, 05 Jan 1941 12:00:00.
const MJD_REFERENCE_JDE: f64 = 2_430_000.0;
/// A.1 runs ahead of TAI by this constant.
const A1_MINUS_TAI_S: f64 = 0.034_381_7;

const GREGORIAN: &str = "%d %b %Y %H:%M:%S.%f";
const GREGORIAN_WHOLE_SECONDS: &str = "%d %b %Y %H:%M:%S";

/// Epoch representations accepted in warm-start files and configuration values.
///
/// Modified Julian dates are counted from JD 2430000.0 (05 Jan 1941 12:00:00) in the format's own time scale.
/// Gregorian strings are formatted as `DD Mon YYYY HH:MM:SS.sss`.
#[allow(clippy::upper_case_acronyms)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Sequence)]
pub enum EpochFormat {
    A1ModJulian,
    TAIModJulian,
    UTCModJulian,
    TTModJulian,
    TDBModJulian,
    A1Gregorian,
    TAIGregorian,
    #[default]
    UTCGregorian,
    TTGregorian,
    TDBGregorian,
}

impl EpochFormat {
    pub fn is_gregorian(&self) -> bool {
        matches!(
            self,
            Self::A1Gregorian
                | Self::TAIGregorian
                | Self::UTCGregorian
                | Self::TTGregorian
                | Self::TDBGregorian
        )
    }

    /// Time scale in which the clock of this format is read. A.1 is read as TAI shifted by a constant.
    pub fn time_scale(&self) -> TimeScale {
        match self {
            Self::A1ModJulian | Self::A1Gregorian | Self::TAIModJulian | Self::TAIGregorian => {
                TimeScale::TAI
            }
            Self::UTCModJulian | Self::UTCGregorian => TimeScale::UTC,
            Self::TTModJulian | Self::TTGregorian => TimeScale::TT,
            Self::TDBModJulian | Self::TDBGregorian => TimeScale::TDB,
        }
    }

    fn clock_offset(&self) -> Duration {
        match self {
            Self::A1ModJulian | Self::A1Gregorian => A1_MINUS_TAI_S.seconds(),
            _ => Duration::ZERO,
        }
    }

    /// Epoch in `time_scale()` whose calendar reads what this format's clock reads at `epoch`.
    fn to_clock(&self, epoch: Epoch) -> Epoch {
        epoch.to_time_scale(self.time_scale()) + self.clock_offset()
    }

    fn from_clock(&self, reading: Epoch) -> Epoch {
        reading - self.clock_offset()
    }

    fn mjd_reference(&self) -> Epoch {
        Epoch::from_jde_in_time_scale(MJD_REFERENCE_JDE, self.time_scale())
    }

    /// Parses an epoch string written in this format.
    pub fn parse(&self, value: &str) -> Result<Epoch, ConfigError> {
        let invalid = || ConfigError::InvalidEpoch {
            value: value.to_string(),
            format: *self,
        };

        let value_trimmed = value.trim();
        if self.is_gregorian() {
            let layout = if value_trimmed.contains('.') {
                GREGORIAN
            } else {
                GREGORIAN_WHOLE_SECONDS
            };
            // Without a time scale token hifitime reads the calendar fields as UTC
            let as_utc = Format::from_str(layout)
                .map_err(|_| invalid())?
                .parse(value_trimmed)
                .map_err(|_| invalid())?;
            let reading = match self.time_scale() {
                TimeScale::UTC => as_utc,
                ts => {
                    let (y, mo, d, h, mi, s, ns) = as_utc.to_gregorian_utc();
                    Epoch::maybe_from_gregorian(y, mo, d, h, mi, s, ns, ts).map_err(|_| invalid())?
                }
            };
            Ok(self.from_clock(reading))
        } else {
            let mjd = f64::from_str(value_trimmed).map_err(|_| invalid())?;
            if !mjd.is_finite() {
                return Err(invalid());
            }
            Ok(self.from_clock(self.mjd_reference() + Unit::Day * mjd))
        }
    }

    /// Formats an epoch in this format.
    pub fn format(&self, epoch: Epoch) -> String {
        let reading = self.to_clock(epoch);
        if self.is_gregorian() {
            let rounded = reading.round(1.milliseconds());
            match Format::from_str(GREGORIAN) {
                Ok(layout) => {
                    // Sub-seconds are printed on nine digits, keep the milliseconds
                    let mut text = Formatter::new(rounded, layout).to_string();
                    text.truncate(text.len().saturating_sub(6));
                    text
                }
                Err(_) => rounded.to_gregorian_str(self.time_scale()),
            }
        } else {
            let days = (reading - self.mjd_reference()).to_unit(Unit::Day);
            format!("{days:.11}")
        }
    }
}

impl FromStr for EpochFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        enum_iterator::all::<EpochFormat>()
            .find(|fmt| fmt.to_string() == s.trim())
            .ok_or_else(|| ConfigError::InvalidTimeSystem {
                name: s.to_string(),
            })
    }
}

impl fmt::Display for EpochFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[cfg(test)]
mod ut_epoch_format {
    use super::*;

    #[test]
    fn names_round_trip() {
        for fmt in enum_iterator::all::<EpochFormat>() {
            assert_eq!(EpochFormat::from_str(&fmt.to_string()).unwrap(), fmt);
        }
        assert!(EpochFormat::from_str("GPSWeeks").is_err());
    }

    #[test]
    fn gregorian_utc() {
        let e = EpochFormat::UTCGregorian
            .parse("01 Jan 2000 11:58:55.816")
            .unwrap();
        assert_eq!(e, Epoch::from_gregorian_utc(2000, 1, 1, 11, 58, 55, 816_000_000));
        assert_eq!(
            EpochFormat::UTCGregorian.format(e),
            "01 Jan 2000 11:58:55.816"
        );
        assert_eq!(
            EpochFormat::UTCGregorian.parse("01 Jan 2000 11:58:55").unwrap(),
            Epoch::from_gregorian_utc(2000, 1, 1, 11, 58, 55, 0)
        );
        assert!(EpochFormat::UTCGregorian
            .parse("31 Feb 2000 11:58:55.816")
            .is_err());
        assert!(EpochFormat::UTCGregorian.parse("2000-01-01").is_err());
    }

    #[test]
    fn gregorian_in_dynamical_time() {
        let e = Epoch::from_gregorian(2020, 6, 1, 0, 0, 0, 0, TimeScale::TDB);
        assert_eq!(
            EpochFormat::TDBGregorian.format(e),
            "01 Jun 2020 00:00:00.000"
        );
        assert_eq!(EpochFormat::TDBGregorian.parse("01 Jun 2020 00:00:00.000").unwrap(), e);

        let tt = Epoch::from_gregorian_tai(2020, 6, 1, 0, 0, 0, 0) + 32.184.seconds();
        assert_eq!(
            EpochFormat::TTGregorian.format(tt),
            "01 Jun 2020 00:01:04.368"
        );
    }

    #[test]
    fn mod_julian_reference() {
        // J2000 in TAI is MJD 21545.0 in this convention.
        let j2000_tai = Epoch::from_gregorian_tai(2000, 1, 1, 12, 0, 0, 0);
        let mjd = EpochFormat::TAIModJulian.format(j2000_tai);
        assert_eq!(mjd, "21545.00000000000");
        let back = EpochFormat::TAIModJulian.parse(&mjd).unwrap();
        assert!((back - j2000_tai).abs() < 1.microseconds());

        let a1 = EpochFormat::A1ModJulian.parse("21545.0").unwrap();
        assert!((j2000_tai - a1 - A1_MINUS_TAI_S.seconds()).abs() < 1.microseconds());
    }

    #[test]
    fn scale_offsets() {
        let e = Epoch::from_gregorian_utc(2020, 6, 1, 0, 0, 0, 0);
        for fmt in enum_iterator::all::<EpochFormat>() {
            let text = fmt.format(e);
            let back = fmt.parse(&text).unwrap();
            assert!(
                (back - e).abs() < 2.milliseconds(),
                "{fmt}: {text} -> {back} vs {e}"
            );
        }
        let tt = EpochFormat::TTGregorian.format(e);
        let a1 = EpochFormat::A1Gregorian.format(e);
        assert_ne!(tt, a1);
    }
}
