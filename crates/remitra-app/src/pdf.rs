//! PDF helpers for counting pages and rendering page images.

use std::env;
use std::path::PathBuf;

use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use pdfium_render::prelude::{PdfRenderConfig, Pdfium, PdfiumError};
use thiserror::Error;

/// Errors emitted while inspecting or rendering PDF documents.
#[derive(Debug, Error)]
pub enum PdfError {
    #[error("failed to load Pdfium runtime: {0}")]
    Library(#[from] PdfiumError),

    #[error("failed to load PDF document: {0}")]
    Document(#[source] PdfiumError),

    #[error("failed to render page {page_index}: {source}")]
    PageRender {
        page_index: usize,
        #[source]
        source: PdfiumError,
    },

    #[error("failed to encode page {page_index} as PNG: {source}")]
    Encode {
        page_index: usize,
        #[source]
        source: image::ImageError,
    },
}

/// In-memory representation of a rendered page.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub page_index: usize,
    pub width: u32,
    pub height: u32,
    pub png_data: Vec<u8>,
}

/// Number of pages in the document, without rendering anything.
pub fn page_count(bytes: &[u8]) -> Result<u32, PdfError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(PdfError::Document)?;
    Ok(document.pages().len() as u32)
}

/// Renders each page into a PNG image with the requested target width.
pub fn render_pages_to_png(bytes: &[u8], target_width: u32) -> Result<Vec<PageImage>, PdfError> {
    let pdfium = load_pdfium()?;
    let document = pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(PdfError::Document)?;

    let mut images = Vec::with_capacity(document.pages().len() as usize);

    for (page_index, page) in document.pages().iter().enumerate() {
        let render_config = PdfRenderConfig::new().set_target_width(target_width as i32);

        let bitmap = page
            .render_with_config(&render_config)
            .map_err(|source| PdfError::PageRender { page_index, source })?;

        let width = bitmap.width() as u32;
        let height = bitmap.height() as u32;
        let rgba = bitmap.as_rgba_bytes();

        let mut encoded = Vec::new();
        let encoder = PngEncoder::new(&mut encoded);
        encoder
            .write_image(&rgba, width, height, ColorType::Rgba8.into())
            .map_err(|source| PdfError::Encode { page_index, source })?;

        images.push(PageImage {
            page_index,
            width,
            height,
            png_data: encoded,
        });
    }

    Ok(images)
}

fn load_pdfium() -> Result<Pdfium, PdfError> {
    if let Ok(explicit) = env::var("PDFIUM_DYNAMIC_LIB_PATH") {
        let path = PathBuf::from(explicit);
        let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(&path))?;
        return Ok(Pdfium::new(bindings));
    }

    let bindings = Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
        .or_else(|_| Pdfium::bind_to_system_library())?;
    Ok(Pdfium::new(bindings))
}
