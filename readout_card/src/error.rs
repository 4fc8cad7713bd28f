// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Error taxonomy for the readout-card driver.

use crate::parameters::DataSource;
use crate::parameters::ResetLevel;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by channel construction and the transfer state machine.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user input (page size, data source, channel number, superpage
    /// geometry).
    #[error("invalid parameter: {0}")]
    Parameter(String),

    /// The per-channel interprocess lock could not be taken.
    #[error("channel lock unavailable ({path})")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Scatter/gather or buffer registration failure.
    #[error("DMA setup failed: {0}")]
    DmaSetup(String),

    /// The card is in a state it should not be in.
    #[error("hardware error")]
    Hardware(#[source] Hardware),

    /// A ready-FIFO status word was malformed or carried the error bit.
    #[error(
        "{message} (status {status:#010x}, length {length} words, slot {slot}, \
         reset level {reset_level:?}, data source {data_source:?})"
    )]
    DataArrival {
        message: &'static str,
        status: u32,
        length: u32,
        slot: usize,
        reset_level: ResetLevel,
        data_source: DataSource,
    },

    /// `push_superpage` on a full transfer queue or descriptor ring.
    #[error("transfer queue full")]
    QueueFull,

    /// `get_superpage`/`pop_superpage` on an empty ready queue.
    #[error("ready queue empty")]
    QueueEmpty,
}

/// Hardware-level failures, always wrapped in [`Error::Hardware`].
#[derive(Debug, Error)]
pub enum Hardware {
    #[error("optical link is down")]
    LinkDown,

    #[error("SIU in no-signal state (probably not connected)")]
    SiuNoSignal,

    /// A DDL status read ran out its response window. Reported explicitly
    /// rather than as a status-word sentinel.
    #[error("{endpoint:?} not responding to DDL read within {timeout_usec} us")]
    DdlTimeout {
        endpoint: DdlEndpoint,
        timeout_usec: u64,
    },

    #[error("free FIFO not empty after reset")]
    FreeFifoNotEmpty,

    #[error("card did not come out of reset")]
    ResetTimeout,
}

/// The two endpoints of the optical link.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DdlEndpoint {
    Diu,
    Siu,
}

impl From<Hardware> for Error {
    fn from(value: Hardware) -> Self {
        Error::Hardware(value)
    }
}
