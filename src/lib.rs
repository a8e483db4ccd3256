/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Buffered-output region pool for gathering many small writes into one
//! backing store and draining them with vectored I/O.

pub mod contig;
pub mod error;
pub mod iovec;
pub mod pool;

pub use contig::ContigBuf;
pub use error::BufferError;
pub use iovec::{IoVec, IOV_MAX};
pub use pool::{Region, RegionFlags, RegionPool};

#[cold]
#[inline(never)]
pub(crate) fn unlikely_branch() {}
