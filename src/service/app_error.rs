// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// network errors
    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("read deadline elapsed")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection closed by peer: {0}")]
    PeerClosed(String),

    #[error("send error: {0}")]
    SendFailed(#[source] io::Error),

    #[error("Accept error = {0}")]
    Accept(String),

    /// framing errors
    #[error("malformed protocol : {0}")]
    MalformedProtocol(String),

    #[error("message too large: {0}")]
    MessageTooLarge(String),

    /// general errors
    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),
}

impl AppError {
    /// Whether the failed operation may be retried on the same connection.
    ///
    /// Only deadline expiry and the retryable `io::ErrorKind`s are transient.
    /// Everything else (peer reset, end of stream, bad framing, local close)
    /// leaves the connection closed.
    pub fn is_temporary(&self) -> bool {
        match self {
            AppError::Timeout => true,
            AppError::IoError(err) => is_temporary_io_error(err),
            _ => false,
        }
    }
}

pub fn is_temporary_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
    )
}

/// Classification predicate for callers driving their own retry loops:
/// retry on `true`, close the connection on `false`.
pub fn is_temporary_net_error(err: &AppError) -> bool {
    err.is_temporary()
}
