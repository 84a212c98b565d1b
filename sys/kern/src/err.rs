// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate that
//! concern using `Result`.

use abi::{ErrorCode, HmErrorId};

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error, indicated to the errant task by returning the
    /// code in its first return register.
    Recoverable(ErrorCode),
    /// The call itself was a fault. It is not returned to the caller but
    /// raised as a synchronous HM error against it.
    Fault(HmErrorId),
}

/// Convenience conversion from `ErrorCode`, so `?` works on typed
/// operations inside the dispatcher.
impl From<ErrorCode> for UserError {
    fn from(e: ErrorCode) -> Self {
        Self::Recoverable(e)
    }
}
