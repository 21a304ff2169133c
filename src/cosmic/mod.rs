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

mod epoch_format;
pub use epoch_format::{EpochFormat, ESTTIME_ROUNDOFF_S};

mod frames;
mod orbitdual;
pub use orbitdual::OrbitDual;
pub use frames::{vnb_rotation, CartesianGateway, FrameGateway, EARTH_GM_KM3_S2};

use crate::time::Epoch;

/// Returns whether two epochs are equal within the estimation time roundoff.
pub fn epochs_match(a: Epoch, b: Epoch) -> bool {
    (a - b).abs().to_seconds() <= ESTTIME_ROUNDOFF_S
}
