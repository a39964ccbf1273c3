//! Protocol Stack Layers Library
//!
//! This crate implements the NR sidelink UE protocol layers according to 3GPP Release 16.

pub mod mac;
pub mod rlc;

use common::SfnSfError;
use thiserror::Error;

/// Common errors for protocol layers
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LayerError {
    #[error("Invalid protocol data unit")]
    InvalidPdu,

    #[error("Resource unavailable")]
    ResourceUnavailable,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unknown destination: {0}")]
    UnknownDestination(u32),

    #[error("Unknown logical channel {lcid} for destination {dst}")]
    UnknownLogicalChannel { dst: u32, lcid: u8 },

    #[error("Duplicate logical channel {lcid} for destination {dst}")]
    DuplicateLogicalChannel { dst: u32, lcid: u8 },

    #[error("No HARQ process available for destination {0}")]
    HarqProcessUnavailable(u32),

    #[error("Slot error: {0}")]
    Slot(#[from] SfnSfError),
}
