// SPDX-License-Identifier: MPL-2.0

use crate::error::Error;

pub type Result<T> = core::result::Result<T, Error>;
