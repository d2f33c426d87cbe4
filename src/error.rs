// Error types for splat loading, rendering and editing
//
// Every failure is handled at the call boundary: render passes log and skip,
// edit operations return the error so callers can retry or report it.

use thiserror::Error;

/// Result type for splat operations
pub type SplatResult<T> = Result<T, SplatError>;

/// Broad class of a [`SplatError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SplatErrorKind {
    /// Missing or incompatible shader / compute resources
    Configuration,
    /// Missing, empty, version-mismatched or incomplete asset
    Asset,
    /// Operation invoked in a state that cannot support it
    State,
    /// Invalid element count or range
    Bounds,
}

/// Which gesture-start snapshot an operation depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Selection,
    Position,
    Other,
}

impl std::fmt::Display for SnapshotKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotKind::Selection => write!(f, "selection"),
            SnapshotKind::Position => write!(f, "position"),
            SnapshotKind::Other => write!(f, "other-data"),
        }
    }
}

/// Errors that can occur while loading, rendering or editing splats
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SplatError {
    #[error("Missing shader resource '{0}', splat rendering is disabled for this collection")]
    MissingShader(&'static str),

    #[error("Compute kernels are unavailable on this device")]
    ComputeUnsupported,

    #[error("No splat asset assigned")]
    NoAsset,

    #[error("Splat asset contains no splats")]
    EmptyAsset,

    #[error("Splat asset format version {found} does not match expected {expected}, re-import the asset")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Splat asset is missing {0} data")]
    MissingData(&'static str),

    #[error("Splat asset {name} data has {found} words, expected {expected}")]
    DataSizeMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error("Splat asset uses chunk-relative {0} format but carries no chunk data")]
    MissingChunks(&'static str),

    #[error("Collection has no valid render setup")]
    InvalidRenderSetup,

    #[error("Collection has no loaded splat data")]
    NotLoaded,

    #[error("Operation requires a stored {0} snapshot")]
    MissingSnapshot(SnapshotKind),

    #[error("Chunk-quantized splat data cannot be rewritten in place")]
    ChunkedAsset,

    #[error("Chunked splat assets have a fixed layout and cannot be resized")]
    ChunkedResize,

    #[error("Splat count {requested} is outside the supported range 1..={max}")]
    InvalidCount { requested: u32, max: u32 },

    #[error("Range {start}..{end} exceeds splat count {count}")]
    RangeOutOfBounds { start: u32, end: u32, count: u32 },

    #[error("Destination buffer holds {capacity} records, {required} required")]
    DestinationTooSmall { capacity: u32, required: u32 },

    #[error("Splat compute pipelines are not compiled yet")]
    PipelinesNotReady,

    #[error("GPU resource '{0}' does not live on this device backend")]
    BackendMismatch(String),

    #[error("Buffer '{0}' cannot be mapped for reading")]
    NotMappable(String),

    #[error("Reading back buffer '{0}' failed")]
    ReadbackFailed(String),

    #[error("Draw recorded without a composite target")]
    NoRenderTarget,
}

impl SplatError {
    pub fn kind(&self) -> SplatErrorKind {
        match self {
            SplatError::MissingShader(_)
            | SplatError::ComputeUnsupported
            | SplatError::BackendMismatch(_)
            | SplatError::NotMappable(_) => SplatErrorKind::Configuration,
            SplatError::NoAsset
            | SplatError::EmptyAsset
            | SplatError::VersionMismatch { .. }
            | SplatError::MissingData(_)
            | SplatError::DataSizeMismatch { .. }
            | SplatError::MissingChunks(_) => SplatErrorKind::Asset,
            SplatError::InvalidRenderSetup
            | SplatError::NotLoaded
            | SplatError::MissingSnapshot(_)
            | SplatError::ChunkedAsset
            | SplatError::PipelinesNotReady
            | SplatError::ReadbackFailed(_)
            | SplatError::NoRenderTarget => SplatErrorKind::State,
            SplatError::InvalidCount { .. }
            | SplatError::ChunkedResize
            | SplatError::RangeOutOfBounds { .. }
            | SplatError::DestinationTooSmall { .. } => SplatErrorKind::Bounds,
        }
    }
}
