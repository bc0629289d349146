//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;

use tracing::{error, warn};

use crate::packet::DecodeError;

// Spark errors.
#[derive(Debug)]
pub enum Error {
    // I/O errors
    IoError(IoError),
    // Configuration
    InvalidTimerConfig(&'static str),
    AreaWithoutRegexes(String),
    InvalidAreaRegex(String, regex::Error),
    // Interface updates
    NodeNameMismatch(String, String),
    // Packet input
    HopLimitTooLow(Ipv6Addr, u8),
    InterfaceNotFound(u32),
    PacketDecodeError(DecodeError),
    // Label allocation
    LabelExhausted,
}

// Spark I/O errors.
#[derive(Debug)]
pub enum IoError {
    SocketError(std::io::Error),
    MulticastJoinError(std::io::Error),
    MulticastLeaveError(std::io::Error),
    RecvError(std::io::Error),
    RecvMissingAncillaryData,
    SendError(std::io::Error),
    PacketTooBig(usize),
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::IoError(error) => {
                error.log();
            }
            Error::InvalidTimerConfig(reason) => {
                error!(%reason, "{}", self);
            }
            Error::AreaWithoutRegexes(area_id) => {
                error!(%area_id, "{}", self);
            }
            Error::InvalidAreaRegex(area_id, error) => {
                error!(%area_id, %error, "{}", self);
            }
            Error::NodeNameMismatch(expected, received) => {
                error!(%expected, %received, "{}", self);
            }
            Error::HopLimitTooLow(src, hop_limit) => {
                warn!(%src, %hop_limit, "{}", self);
            }
            Error::InterfaceNotFound(ifindex) => {
                warn!(%ifindex, "{}", self);
            }
            Error::PacketDecodeError(error) => {
                warn!(error = %error, "{}", self);
            }
            Error::LabelExhausted => {
                error!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(error) => error.fmt(f),
            Error::InvalidTimerConfig(..) => {
                write!(f, "invalid timer configuration")
            }
            Error::AreaWithoutRegexes(..) => {
                write!(
                    f,
                    "area entry needs at least one neighbor or interface regex"
                )
            }
            Error::InvalidAreaRegex(..) => {
                write!(f, "failed to compile area regex")
            }
            Error::NodeNameMismatch(..) => {
                write!(f, "interface database node name isn't ours")
            }
            Error::HopLimitTooLow(..) => {
                write!(f, "rejecting packet with insufficient hop limit")
            }
            Error::InterfaceNotFound(..) => {
                write!(f, "received packet on unknown interface")
            }
            Error::PacketDecodeError(..) => {
                write!(f, "failed to decode packet")
            }
            Error::LabelExhausted => {
                write!(f, "ran out of local label allocation space")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(error) => Some(error),
            Error::PacketDecodeError(error) => Some(error),
            Error::InvalidAreaRegex(_, error) => Some(error),
            _ => None,
        }
    }
}

impl From<IoError> for Error {
    fn from(error: IoError) -> Error {
        Error::IoError(error)
    }
}

// ===== impl IoError =====

impl IoError {
    pub(crate) fn log(&self) {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::MulticastLeaveError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => {
                warn!(error = %with_source(error), "{}", self);
            }
            IoError::RecvMissingAncillaryData => {
                warn!("{}", self);
            }
            IoError::PacketTooBig(len) => {
                warn!(%len, "{}", self);
            }
        }
    }
}

impl std::fmt::Display for IoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoError::SocketError(..) => {
                write!(f, "failed to create UDP socket")
            }
            IoError::MulticastJoinError(..) => {
                write!(f, "failed to join multicast group")
            }
            IoError::MulticastLeaveError(..) => {
                write!(f, "failed to leave multicast group")
            }
            IoError::RecvError(..) => {
                write!(f, "failed to receive UDP packet")
            }
            IoError::RecvMissingAncillaryData => {
                write!(
                    f,
                    "failed to retrieve ancillary data from received packet"
                )
            }
            IoError::SendError(..) => {
                write!(f, "failed to send UDP packet")
            }
            IoError::PacketTooBig(..) => {
                write!(f, "packet length exceeds the minimum IPv6 MTU")
            }
        }
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            IoError::SocketError(error)
            | IoError::MulticastJoinError(error)
            | IoError::MulticastLeaveError(error)
            | IoError::RecvError(error)
            | IoError::SendError(error) => Some(error),
            _ => None,
        }
    }
}

// ===== global functions =====

fn with_source<E: std::error::Error>(error: E) -> String {
    if let Some(source) = error.source() {
        format!("{} ({})", error, with_source(source))
    } else {
        error.to_string()
    }
}
