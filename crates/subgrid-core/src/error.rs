//! Error types for subgrid construction and subgrid file I/O.

use thiserror::Error;

/// Errors that abort a build, save or load.
///
/// Recoverable conditions (data gaps, flat or empty cells) are not errors;
/// they are reported through [`crate::BuildWarning`].
#[derive(Debug, Error)]
pub enum SubgridError {
    /// Invalid grid, mask or build parameters. Raised before any block is processed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subgrid file does not match the mask it is loaded against.
    #[error("format mismatch in {field} at byte {offset}: expected {expected}, found {found}")]
    FormatMismatch {
        /// Header field or section that disagreed.
        field: &'static str,
        /// Value implied by the mask (or by the header for byte lengths).
        expected: i64,
        /// Value found in the file.
        found: i64,
        /// Byte offset of the field in the file.
        offset: usize,
    },

    /// I/O error reading or writing a file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The raster merge collaborator failed for a block.
    #[error("raster merge failed for block {block}: {reason}")]
    Merge {
        /// Row-major block number.
        block: usize,
        /// Reason reported by the merger.
        reason: String,
    },

    /// The build was aborted between blocks.
    #[error("build cancelled before block {block}")]
    Cancelled {
        /// First block that was not processed.
        block: usize,
    },
}

impl SubgridError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        SubgridError::Config(msg.into())
    }
}
