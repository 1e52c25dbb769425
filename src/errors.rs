//! floatradix error types.

use std::fmt;

#[derive(Debug, Clone)]
pub enum SortError {
    NoAdapter,
    Device(String),
    Allocation(String),
    EmptyInput,
    NotConfigured,
    NoResult,
    SizeMismatch { expected: usize, got: usize },
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoAdapter => write!(f, "NoAdapter: no compatible GPU adapter found"),
            Self::Device(msg) => write!(f, "DeviceError: {msg}"),
            Self::Allocation(msg) => write!(f, "AllocationError: {msg}"),
            Self::EmptyInput => write!(f, "EmptyInput: cannot sort zero elements"),
            Self::NotConfigured => write!(f, "NotConfigured: sorter has no device buffers"),
            Self::NoResult => write!(f, "NoResult: no completed sort to read back"),
            Self::SizeMismatch { expected, got } => {
                write!(f, "SizeMismatch: expected {expected}, got {got}")
            }
        }
    }
}

impl std::error::Error for SortError {}

pub type Result<T> = std::result::Result<T, SortError>;
