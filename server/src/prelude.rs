// SPDX-License-Identifier: MPL-2.0

pub(crate) use std::sync::{Arc, Weak};

pub(crate) use log::{debug, error, info, warn};

pub use crate::error::{Errno, Error};
pub(crate) use crate::{return_errno, return_errno_with_message};

pub type Result<T> = core::result::Result<T, Error>;
