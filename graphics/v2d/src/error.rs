// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Error types for the V2D pipeline

use core::fmt;

/// V2D result type
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// V2D error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Task descriptor failed validation
    InvalidTask(&'static str),
    /// Buffer handle is not known to the exporter
    InvalidBuffer(u32),
    /// The buffer exporter refused an operation
    Exporter(&'static str),
    /// Scatter segment offset is not page aligned
    Misaligned { offset: u64 },
    /// Target address lies outside the bound translation window
    OutOfWindow { iova: u64 },
    /// TBU instance index out of range
    InvalidInstance(usize),
    /// Mapping would run past the end of the translation table
    TableOverflow { tbu: usize, index: usize },
    /// Coherent memory for a translation table could not be allocated
    TableAlloc,
    /// Device has been shut down
    Shutdown,
    /// Global reset never completed; the device refuses new work
    DeviceUnusable,
    /// Register window request is out of range or misaligned
    InvalidWindow { offset: u64, len: u64 },
    /// Configuration rejected
    InvalidConfig(&'static str),
    /// A pipeline thread could not be started
    ThreadSpawn(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidTask(why) => write!(f, "Invalid task: {}", why),
            Error::InvalidBuffer(fd) => write!(f, "Invalid buffer handle {}", fd),
            Error::Exporter(why) => write!(f, "Buffer exporter error: {}", why),
            Error::Misaligned { offset } => {
                write!(f, "Scatter segment offset {:#x} is not page aligned", offset)
            }
            Error::OutOfWindow { iova } => {
                write!(f, "Address {:#x} is outside the translation window", iova)
            }
            Error::InvalidInstance(id) => write!(f, "Invalid TBU instance {}", id),
            Error::TableOverflow { tbu, index } => {
                write!(f, "TBU {} table overflow at entry {}", tbu, index)
            }
            Error::TableAlloc => write!(f, "Failed to allocate translation table"),
            Error::Shutdown => write!(f, "Device shut down"),
            Error::DeviceUnusable => write!(f, "Device unusable after failed reset"),
            Error::InvalidWindow { offset, len } => {
                write!(f, "Invalid register window {:#x}+{:#x}", offset, len)
            }
            Error::InvalidConfig(why) => write!(f, "Invalid configuration: {}", why),
            Error::ThreadSpawn(name) => write!(f, "Failed to spawn thread {}", name),
        }
    }
}

impl std::error::Error for Error {}
