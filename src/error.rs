/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::error::Error;
use std::fmt::{Debug, Display};

/// Failure to obtain backing memory for a buffer or region.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// The heap could not satisfy an allocation or reallocation request.
    AllocFailed,
    /// Size arithmetic overflowed while computing a requested capacity.
    CapacityOverflow,
}

impl Display for BufferError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllocFailed => f.write_str("memory allocation failed"),
            Self::CapacityOverflow => f.write_str("requested capacity overflows"),
        }
    }
}

impl Debug for BufferError {
    #[inline(always)]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as Display>::fmt(self, f)
    }
}

impl Error for BufferError {}

impl From<BufferError> for std::io::Error {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::AllocFailed => std::io::Error::new(std::io::ErrorKind::OutOfMemory, "memory allocation failed"),
            BufferError::CapacityOverflow => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "requested capacity overflows")
            }
        }
    }
}
