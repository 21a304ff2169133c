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
use crate::time::Epoch;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::prelude::*;
use std::fmt::Debug;
use std::fs::File;
use std::io::BufReader;
use std::io::Error as IoError;
use std::path::Path;
use std::str::FromStr;

/// Reading and writing of warm-start state and covariance snapshots.
pub mod warmstart;

/// Sinks receiving per-update filter and smoother reports.
pub mod report;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ConfigError {
    #[snafu(display("failed to read configuration file: {source}"))]
    ReadError { source: IoError },

    #[snafu(display("failed to parse YAML configuration file: {source}"))]
    ParseError { source: serde_yaml::Error },

    #[snafu(display("{param} must be non-negative, got {value}"))]
    NegativeValue { param: &'static str, value: f64 },

    #[snafu(display("{param} must be strictly positive, got {value}"))]
    NonPositiveValue { param: &'static str, value: f64 },

    #[snafu(display("`{name}` is not a valid file name for {param}"))]
    InvalidFileName { param: &'static str, name: String },

    #[snafu(display("`{name}` is not a recognized epoch format"))]
    InvalidTimeSystem { name: String },

    #[snafu(display("`{value}` is not a valid {format} epoch"))]
    InvalidEpoch { value: String, format: EpochFormat },

    #[snafu(display("`{name}` is not a recognized {kind}"))]
    UnknownModel { kind: &'static str, name: String },

    #[snafu(display("`{value}` is not a valid value for {param}"))]
    InvalidParameter { param: &'static str, value: String },
}

impl PartialEq for ConfigError {
    /// No two configuration errors match
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InputOutputError {
    #[snafu(display("{action} encountered an IO error: {source}"))]
    StdIOError {
        source: IoError,
        action: &'static str,
    },
    #[snafu(display("{action} encountered a CSV error: {source}"))]
    CsvError {
        source: csv::Error,
        action: &'static str,
    },
}

impl PartialEq for InputOutputError {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

pub trait ConfigRepr: Debug + Sized + Serialize + DeserializeOwned {
    /// Builds the configuration representation from the path to a yaml
    fn load<P>(path: P) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
    {
        let file = File::open(path).context(ReadSnafu)?;
        let reader = BufReader::new(file);

        serde_yaml::from_reader(reader).context(ParseSnafu)
    }

    /// Builds the configuration representation from a yaml string
    fn loads(data: &str) -> Result<Self, ConfigError> {
        debug!("Loading YAML:\n{data}");
        serde_yaml::from_str(data).context(ParseSnafu)
    }
}

/// Checks that a name can be used as a file path: non-empty, no control characters, and no wildcard or redirection
/// characters.
pub(crate) fn validate_file_name(param: &'static str, name: &str) -> Result<(), ConfigError> {
    const FORBIDDEN: [char; 6] = ['*', '?', '<', '>', '|', '"'];
    let trimmed = name.trim();
    let path = Path::new(trimmed);
    ensure!(
        !trimmed.is_empty()
            && !trimmed.chars().any(|c| c.is_control() || FORBIDDEN.contains(&c))
            && !trimmed.ends_with('/')
            && !trimmed.ends_with('\\')
            && path.file_name().is_some(),
        InvalidFileNameSnafu {
            param,
            name: name.to_string()
        }
    );
    Ok(())
}

pub(crate) fn maybe_epoch_to_str<S>(epoch: &Option<Epoch>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match epoch {
        Some(epoch) => serializer.serialize_str(&format!("{epoch}")),
        None => serializer.serialize_none(),
    }
}

/// A deserializer from an optional Epoch string
pub(crate) fn maybe_epoch_from_str<'de, D>(deserializer: D) -> Result<Option<Epoch>, D::Error>
where
    D: Deserializer<'de>,
{
    let s: Option<String> = Option::deserialize(deserializer)?;
    match s {
        Some(s) => Epoch::from_str(&s)
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
