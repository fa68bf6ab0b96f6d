// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use num_enum::TryFromPrimitiveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("pdu too small: {0} bytes")]
    TooSmall(usize),

    #[error("pdu too large: {0} bytes")]
    TooLarge(u32),

    #[error("pdu length field {length} does not match body")]
    LengthMismatch { length: u32 },

    #[error("unsupported pdu type {0}")]
    UnsupportedPduType(u8),

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("unexpected protocol version {got}, session negotiated {want}")]
    VersionMismatch { want: u8, got: u8 },

    #[error("pdu type {0} is not a valid request")]
    InvalidRequest(u8),

    #[error("pdu type error")]
    PduType(#[from] TryFromPrimitiveError<crate::messages::PduType>),

    #[error("error code error")]
    ErrorCode(#[from] TryFromPrimitiveError<crate::messages::ErrorCode>),

    #[error("invalid utf-8 in error report text")]
    BadErrorText,

    #[error("io {0}")]
    Io(#[from] std::io::Error),

    #[error("disconnected")]
    Disconnected,

    #[error("backpressure: outbound queue full")]
    Backpressure,

    #[error("channel send {0}")]
    ChannelSend(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("tls {0}")]
    Tls(#[from] rustls::Error),

    #[error("ssh {0}")]
    Ssh(String),

    #[error("connection limit reached")]
    TooManyClients,
}
