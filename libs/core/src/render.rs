//! Rendering/transcoding boundary. Real deployments wire in an external
//! converter; the gateway only needs paths and page counts back.

use std::fs;
use std::path::Path;

use crate::error::FaxError;

pub trait Renderer: Send + Sync {
    /// Renders a plain-text document to a fax-ready PDF.
    fn txt_to_pdf(&self, src: &Path, dst: &Path) -> Result<(), FaxError>;
    /// Encodes a PDF to fax TIFF, returning the page count.
    fn pdf_to_tiff(&self, src: &Path, dst: &Path) -> Result<u32, FaxError>;
    /// Converts a received TIFF to PDF, returning the page count.
    fn tiff_to_pdf(&self, src: &Path, dst: &Path) -> Result<u32, FaxError>;
}

/// Placeholder renderer for disabled/test configurations: emits minimal
/// artifacts without invoking any external converter.
pub struct PassthroughRenderer;

impl Renderer for PassthroughRenderer {
    fn txt_to_pdf(&self, _src: &Path, dst: &Path) -> Result<(), FaxError> {
        fs::write(dst, b"%PDF-1.4\n% rendered text\n%%EOF")?;
        Ok(())
    }

    fn pdf_to_tiff(&self, _src: &Path, dst: &Path) -> Result<u32, FaxError> {
        fs::write(dst, b"II*\0")?;
        Ok(1)
    }

    fn tiff_to_pdf(&self, _src: &Path, dst: &Path) -> Result<u32, FaxError> {
        fs::write(dst, b"%PDF-1.4\n% converted tiff\n%%EOF")?;
        Ok(1)
    }
}
