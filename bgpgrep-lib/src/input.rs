//! Input layer: plain files, standard input, and transparent
//! decompression selected by file extension.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::error::{GrepError, Result};

/// Label used for standard input in diagnostics and output.
pub const STDIN_LABEL: &str = "(stdin)";

/// Open an input for MRT reading. `None` means standard input. Files
/// ending in `.gz`/`.z`, `.bz2`, or `.xz` are decompressed on the fly.
/// Returns the display label and the reader.
pub fn open_input(path: Option<&Path>) -> Result<(String, Box<dyn Read>)> {
    let Some(path) = path else {
        return Ok((STDIN_LABEL.to_string(), Box::new(std::io::stdin())));
    };

    let label = path.display().to_string();
    let file = BufReader::new(File::open(path)?);
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let reader: Box<dyn Read> = match ext.as_deref() {
        Some("gz") | Some("z") => Box::new(flate2::bufread::GzDecoder::new(file)),
        Some("bz2") => Box::new(bzip2_rs::DecoderReader::new(file)),
        #[cfg(feature = "xz")]
        Some("xz") => Box::new(xz2::bufread::XzDecoder::new(file)),
        #[cfg(not(feature = "xz"))]
        Some("xz") => {
            return Err(GrepError::Unsupported(format!(
                "{label}: xz input requires a build with the 'xz' feature"
            )));
        }
        _ => Box::new(file),
    };
    Ok((label, reader))
}
