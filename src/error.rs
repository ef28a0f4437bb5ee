// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors

use thiserror::Error;

/// Error taxonomy shared by the broker, reader, client and config layers.
///
/// Each variant maps to a stable negative ACK code via [`LcapError::ack_code`],
/// reusing the errno magnitudes the wire protocol already standardizes on so a
/// client observes the same codes regardless of which component raised them.
#[derive(Debug, Error)]
pub enum LcapError {
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("out of memory")]
    OutOfMemory,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("source error: {0}")]
    Source(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("try again")]
    TryAgain,

    #[error("end of stream")]
    EndOfStream,

    #[error("fatal: {0}")]
    Fatal(String),
}

impl LcapError {
    /// Negative errno-style code surfaced in an ACK reply.
    ///
    /// These magnitudes match the original wire protocol's use of raw
    /// `errno` values so existing clients see identical codes.
    pub fn ack_code(&self) -> i32 {
        match self {
            LcapError::Protocol(_) => -71,       // EPROTO
            LcapError::InvalidArgument(_) => -22, // EINVAL
            LcapError::NotAvailable(_) => -19,    // ENODEV
            LcapError::OutOfMemory => -12,        // ENOMEM
            LcapError::Transport(_) => -5,        // EIO
            LcapError::Source(_) => -5,           // EIO
            LcapError::AlreadyExists(_) => -17,   // EEXIST
            LcapError::TryAgain => -11,            // EAGAIN
            LcapError::EndOfStream => 1,
            LcapError::Fatal(_) => -1,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LcapError::Fatal(_))
    }

    /// Reverse of [`LcapError::ack_code`], used by clients turning a
    /// received ACK retcode back into a typed error. `0` has no inverse
    /// (callers check for success before calling this).
    pub fn from_ack_code(code: i32) -> LcapError {
        match code {
            -71 => LcapError::Protocol("server reported a protocol error".into()),
            -22 => LcapError::InvalidArgument("server rejected the request".into()),
            -19 => LcapError::NotAvailable("server has no reader for this device".into()),
            -12 => LcapError::OutOfMemory,
            -17 => LcapError::AlreadyExists("client already registered".into()),
            -11 => LcapError::TryAgain,
            1 => LcapError::EndOfStream,
            other => LcapError::Fatal(format!("server returned code {other}")),
        }
    }
}

pub type LcapResult<T> = Result<T, LcapError>;
