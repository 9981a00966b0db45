//! Collaborator seams: the image object store and the PDF rasterizer.
//!
//! The core never owns image files or rasterization; it consumes both
//! through these traits. The default `ObjectStore` implementation reads
//! from the `images` table, which is where the upload collaborator puts
//! blobs in the single-node deployment.

use async_trait::async_trait;
use docgrid_db::{NewImage, Store};
use thiserror::Error;

use crate::error::ExtractError;

/// Image bytes plus the metadata the pipelines need.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub id: String,
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub ocr_text: String,
}

/// Returns image bytes and OCR text given an image id.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn load_image(&self, image_id: &str) -> Result<LoadedImage, ExtractError>;
}

/// Object store backed by the shared database.
#[derive(Clone)]
pub struct DbObjectStore {
    store: Store,
}

impl DbObjectStore {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ObjectStore for DbObjectStore {
    async fn load_image(&self, image_id: &str) -> Result<LoadedImage, ExtractError> {
        let record = self
            .store
            .batches()
            .get_image(image_id)
            .await?
            .ok_or_else(|| ExtractError::InvalidBatch(format!("image {image_id} not found")))?;
        Ok(LoadedImage {
            id: record.id,
            bytes: record.content,
            mime_type: record.mime_type,
            ocr_text: record.ocr_text,
        })
    }
}

// ============================================================================
// PDF rasterization (interface only)
// ============================================================================

#[derive(Debug, Error)]
#[error("rasterization failed: {0}")]
pub struct RasterizeError(pub String);

/// Options passed through to the rasterizer; output format is an image
/// mime type the rasterizer supports.
#[derive(Debug, Clone)]
pub struct RasterizeOptions {
    pub dpi: u32,
    pub format: String,
}

impl Default for RasterizeOptions {
    fn default() -> Self {
        Self {
            dpi: 150,
            format: "image/png".to_string(),
        }
    }
}

/// One rasterized page. The core treats `content` as opaque image bytes.
#[derive(Debug, Clone)]
pub struct PageImage {
    pub content: Vec<u8>,
    pub mime_type: String,
    /// Per-page extracted text; may be empty.
    pub text: String,
}

/// External PDF rasterizer collaborator.
#[async_trait]
pub trait PdfRasterizer: Send + Sync {
    async fn rasterize(
        &self,
        pdf_bytes: &[u8],
        options: &RasterizeOptions,
    ) -> Result<Vec<PageImage>, RasterizeError>;
}

/// Rasterize a PDF and append its pages to a batch, continuing the batch's
/// image ordering. Used by upload adapters; the engine itself only reads
/// the resulting images.
pub async fn append_pdf_pages(
    store: &Store,
    batch_id: &str,
    rasterizer: &dyn PdfRasterizer,
    pdf_bytes: &[u8],
    options: &RasterizeOptions,
) -> Result<usize, ExtractError> {
    let pages = rasterizer
        .rasterize(pdf_bytes, options)
        .await
        .map_err(|e| ExtractError::InvalidBatch(e.to_string()))?;

    let batches = store.batches();
    let next_position = batches
        .primary_images(batch_id)
        .await?
        .last()
        .map(|image| image.position + 1)
        .unwrap_or(0);

    for (offset, page) in pages.iter().enumerate() {
        let image = NewImage::page(batch_id, next_position + offset as i64, page.content.clone())
            .with_mime_type(page.mime_type.clone())
            .with_ocr_text(page.text.clone());
        batches.insert_image(&image).await?;
    }
    Ok(pages.len())
}
