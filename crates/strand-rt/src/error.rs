// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Awaiter-side failures.
//!
//! Task faults, spawn refusals, and post-shutdown submissions are policy
//! (logged or silently dropped); only the two recoverable await failures
//! surface as values.

use thiserror::Error;

/// A resumed `await_event` could not produce the payload it was promised.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AwaitError {
    /// The stored payload is not of the awaited type.
    #[error("payload for event `{event}` is not a `{expected}`")]
    TypeMismatch {
        event: String,
        expected: &'static str,
    },

    /// The payload was cleared before this resumption observed it, which
    /// can happen when emissions race on the same event name.
    #[error("payload for event `{event}` was cleared before this resumption")]
    MissingPayload { event: String },
}
