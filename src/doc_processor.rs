//! PDF ingestion: per-page text and raster images of the first pages of a
//! document, written to the store.
//!
//! - Primary: lopdf, page by page
//! - Fallback for text: pdf-extract over the whole file, split on form feeds

use std::cell::OnceCell;
use std::collections::BTreeMap;
use std::path::Path;

use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Object, ObjectId, Stream};
use thiserror::Error;

use crate::db::Store;

/// Pages past this one are never looked at.
pub const MAX_PAGES: u32 = 5;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Unable to open PDF: {0}")]
    Open(String),

    #[error("Failed to extract page {page}: {message}")]
    Page { page: u32, message: String },

    #[error("Failed to decode image: {0}")]
    Image(String),

    #[error("Unsupported image: {0}")]
    UnsupportedImage(String),
}

/// Encoded pixels of an embedded image.
#[derive(Debug, Clone)]
pub enum ImageData {
    Jpeg(Vec<u8>),
    /// Uncompressed samples, `components` per pixel, row-major.
    Raw {
        width: u32,
        height: u32,
        bits_per_component: u8,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
pub struct PageImage {
    /// Colour components excluding any alpha channel.
    pub components: u8,
    pub data: ImageData,
}

impl PageImage {
    /// CMYK and other 4+ component images are not rendered reliably downstream.
    pub fn is_renderable(&self) -> bool {
        self.components < 4
    }

    pub fn to_dynamic(&self) -> Result<DynamicImage, ExtractionError> {
        match &self.data {
            ImageData::Jpeg(bytes) => image::load_from_memory_with_format(bytes, ImageFormat::Jpeg)
                .map_err(|e| ExtractionError::Image(e.to_string())),
            ImageData::Raw {
                width,
                height,
                bits_per_component,
                data,
            } => {
                if *bits_per_component != 8 {
                    return Err(ExtractionError::UnsupportedImage(format!(
                        "{} bits per component",
                        bits_per_component
                    )));
                }
                let len = (*width as usize)
                    .checked_mul(*height as usize)
                    .and_then(|n| n.checked_mul(self.components as usize))
                    .ok_or_else(|| {
                        ExtractionError::Image(format!("image dimensions {}x{} overflow", width, height))
                    })?;
                if data.len() < len {
                    return Err(ExtractionError::Image(format!(
                        "expected {} bytes of samples, found {}",
                        len,
                        data.len()
                    )));
                }
                let samples = data[..len].to_vec();
                let image = match self.components {
                    1 => GrayImage::from_raw(*width, *height, samples).map(DynamicImage::ImageLuma8),
                    3 => RgbImage::from_raw(*width, *height, samples).map(DynamicImage::ImageRgb8),
                    n => {
                        return Err(ExtractionError::UnsupportedImage(format!("{} components", n)))
                    }
                };
                image.ok_or_else(|| ExtractionError::Image("sample buffer size mismatch".into()))
            }
        }
    }
}

/// The PDF capability ingestion relies on. Pages are 1-based.
pub trait PdfSource {
    fn page_count(&self) -> u32;

    fn page_text(&self, page: u32) -> Result<String, ExtractionError>;

    /// Outer error: the page's images could not be listed at all.
    /// Inner errors: one image could not be read.
    fn page_images(&self, page: u32) -> Result<Vec<Result<PageImage, ExtractionError>>, ExtractionError>;
}

/// [`PdfSource`] over an in-memory PDF parsed with lopdf.
pub struct LopdfSource {
    doc: lopdf::Document,
    pages: BTreeMap<u32, ObjectId>,
    bytes: Vec<u8>,
    fallback_text: OnceCell<Option<Vec<String>>>,
}

impl LopdfSource {
    pub fn open(path: &Path) -> Result<Self, ExtractionError> {
        let bytes = std::fs::read(path).map_err(|e| ExtractionError::Open(e.to_string()))?;
        Self::from_bytes(bytes)
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ExtractionError> {
        let doc = lopdf::Document::load_mem(&bytes).map_err(|e| ExtractionError::Open(e.to_string()))?;
        let pages = doc.get_pages();
        Ok(Self {
            doc,
            pages,
            bytes,
            fallback_text: OnceCell::new(),
        })
    }

    fn page_id(&self, page: u32) -> Result<ObjectId, ExtractionError> {
        self.pages.get(&page).copied().ok_or(ExtractionError::Page {
            page,
            message: "no such page".into(),
        })
    }

    /// Whole-document text from pdf-extract, one entry per page, if the page
    /// breaks line up with the page tree.
    fn fallback_pages(&self) -> Option<&Vec<String>> {
        self.fallback_text
            .get_or_init(|| {
                let text = match pdf_extract::extract_text_from_mem(&self.bytes) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(error = %e, "pdf-extract fallback failed");
                        return None;
                    }
                };
                let pages: Vec<String> = text.split('\x0C').map(str::to_string).collect();
                if pages.len() == self.pages.len() {
                    Some(pages)
                } else if self.pages.len() == 1 {
                    Some(vec![text])
                } else {
                    None
                }
            })
            .as_ref()
    }

    fn deref<'a>(&'a self, object: &'a Object) -> Result<&'a Object, lopdf::Error> {
        self.doc.dereference(object).map(|(_, obj)| obj)
    }

    /// Resources of a page, inherited from the page tree when absent.
    fn resources(&self, page_id: ObjectId) -> Result<Option<&Dictionary>, lopdf::Error> {
        let mut node = self.doc.get_dictionary(page_id)?;
        loop {
            if let Ok(res) = node.get(b"Resources") {
                return Ok(Some(self.deref(res)?.as_dict()?));
            }
            match node.get(b"Parent").and_then(Object::as_reference) {
                Ok(parent) => node = self.doc.get_dictionary(parent)?,
                Err(_) => return Ok(None),
            }
        }
    }

    fn color_components(&self, color_space: &Object) -> Result<u8, ExtractionError> {
        let cs = self.deref(color_space).map_err(|e| ExtractionError::Image(e.to_string()))?;
        match cs {
            Object::Name(name) => match name.as_slice() {
                b"DeviceGray" | b"CalGray" | b"G" => Ok(1),
                b"DeviceRGB" | b"CalRGB" | b"RGB" => Ok(3),
                b"DeviceCMYK" | b"CMYK" => Ok(4),
                other => Err(ExtractionError::UnsupportedImage(format!(
                    "colour space {}",
                    String::from_utf8_lossy(other)
                ))),
            },
            Object::Array(parts) => {
                let family = parts
                    .first()
                    .and_then(|p| p.as_name().ok())
                    .unwrap_or_default();
                match family {
                    b"ICCBased" => {
                        let profile = parts
                            .get(1)
                            .ok_or_else(|| ExtractionError::Image("ICCBased without profile".into()))?;
                        let n = self
                            .deref(profile)
                            .and_then(Object::as_stream)
                            .and_then(|s| s.dict.get(b"N"))
                            .and_then(Object::as_i64)
                            .map_err(|e| ExtractionError::Image(e.to_string()))?;
                        u8::try_from(n).map_err(|_| ExtractionError::Image(format!("N = {}", n)))
                    }
                    b"CalGray" => Ok(1),
                    b"CalRGB" => Ok(3),
                    other => Err(ExtractionError::UnsupportedImage(format!(
                        "colour space {}",
                        String::from_utf8_lossy(other)
                    ))),
                }
            }
            _ => Err(ExtractionError::Image("malformed colour space".into())),
        }
    }

    fn read_image(&self, stream: &Stream) -> Result<PageImage, ExtractionError> {
        let dict = &stream.dict;
        let color_space = dict
            .get(b"ColorSpace")
            .map_err(|_| ExtractionError::UnsupportedImage("no colour space (image mask)".into()))?;
        let components = self.color_components(color_space)?;

        let int = |key: &[u8]| -> Result<i64, ExtractionError> {
            dict.get(key)
                .and_then(|o| self.deref(o))
                .and_then(Object::as_i64)
                .map_err(|e| ExtractionError::Image(format!("{}: {}", String::from_utf8_lossy(key), e)))
        };

        let data = match filters(dict).as_slice() {
            [] => raw_data(stream.content.clone(), &int)?,
            [f] if f.as_slice() == b"FlateDecode" => {
                let content = stream
                    .decompressed_content()
                    .map_err(|e| ExtractionError::Image(e.to_string()))?;
                raw_data(content, &int)?
            }
            [f] if f.as_slice() == b"DCTDecode" => ImageData::Jpeg(stream.content.clone()),
            other => {
                let names: Vec<_> = other.iter().map(|f| String::from_utf8_lossy(f)).collect();
                return Err(ExtractionError::UnsupportedImage(format!("filters {:?}", names)));
            }
        };

        Ok(PageImage { components, data })
    }
}

fn filters(dict: &Dictionary) -> Vec<Vec<u8>> {
    match dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|o| o.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn raw_data(
    data: Vec<u8>,
    int: &dyn Fn(&[u8]) -> Result<i64, ExtractionError>,
) -> Result<ImageData, ExtractionError> {
    let dim = |v: i64| u32::try_from(v).map_err(|_| ExtractionError::Image(format!("bad dimension {}", v)));
    Ok(ImageData::Raw {
        width: dim(int(b"Width")?)?,
        height: dim(int(b"Height")?)?,
        bits_per_component: u8::try_from(int(b"BitsPerComponent")?)
            .map_err(|_| ExtractionError::Image("bad BitsPerComponent".into()))?,
        data,
    })
}

impl PdfSource for LopdfSource {
    fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    fn page_text(&self, page: u32) -> Result<String, ExtractionError> {
        self.page_id(page)?;
        match self.doc.extract_text(&[page]) {
            Ok(text) => Ok(text),
            Err(e) => {
                tracing::debug!(page, error = %e, "lopdf text extraction failed, trying pdf-extract");
                self.fallback_pages()
                    .and_then(|pages| pages.get(page as usize - 1).cloned())
                    .ok_or_else(|| ExtractionError::Page {
                        page,
                        message: e.to_string(),
                    })
            }
        }
    }

    fn page_images(&self, page: u32) -> Result<Vec<Result<PageImage, ExtractionError>>, ExtractionError> {
        let page_err = |e: lopdf::Error| ExtractionError::Page {
            page,
            message: e.to_string(),
        };
        let page_id = self.page_id(page)?;
        let Some(resources) = self.resources(page_id).map_err(page_err)? else {
            return Ok(Vec::new());
        };
        let xobjects = match resources.get(b"XObject") {
            Ok(obj) => self.deref(obj).and_then(Object::as_dict).map_err(page_err)?,
            Err(_) => return Ok(Vec::new()),
        };

        let mut images = Vec::new();
        for (_, entry) in xobjects.iter() {
            let stream = match self.deref(entry).and_then(Object::as_stream) {
                Ok(s) => s,
                Err(e) => {
                    images.push(Err(ExtractionError::Image(e.to_string())));
                    continue;
                }
            };
            let is_image = matches!(
                stream.dict.get(b"Subtype").and_then(Object::as_name),
                Ok(b"Image")
            );
            if is_image {
                images.push(self.read_image(stream));
            }
        }
        Ok(images)
    }
}

/// Counts of what one ingestion run stored.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: usize,
    pub images: usize,
    pub skipped_images: usize,
}

/// Extract and store the text and images of the first [`MAX_PAGES`] pages.
///
/// Returns false only when the file cannot be opened as a PDF; failures on
/// individual pages or images are logged and skipped.
pub fn ingest(store: &Store, images_dir: &Path, document_id: &str, file_path: &Path) -> bool {
    let source = match LopdfSource::open(file_path) {
        Ok(source) => source,
        Err(e) => {
            tracing::error!(document_id, path = %file_path.display(), error = %e, "PDF ingestion failed");
            return false;
        }
    };
    let report = ingest_source(store, &source, images_dir, document_id);
    tracing::info!(
        document_id,
        pages = report.pages,
        images = report.images,
        skipped_images = report.skipped_images,
        "PDF ingested"
    );
    true
}

/// Ingest from any [`PdfSource`]. Images land in `images_dir/{document_id}/`.
pub fn ingest_source<S: PdfSource>(
    store: &Store,
    source: &S,
    images_dir: &Path,
    document_id: &str,
) -> IngestReport {
    let mut report = IngestReport::default();
    let doc_dir = images_dir.join(document_id);

    for page in 1..=source.page_count().min(MAX_PAGES) {
        match source.page_text(page) {
            Ok(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    match store.add_page_text(document_id, page, text) {
                        Ok(_) => report.pages += 1,
                        Err(e) => tracing::warn!(document_id, page, error = %e, "failed to store page text"),
                    }
                }
            }
            Err(e) => tracing::warn!(document_id, page, error = %e, "skipping page text"),
        }

        let images = match source.page_images(page) {
            Ok(images) => images,
            Err(e) => {
                tracing::warn!(document_id, page, error = %e, "skipping page images");
                continue;
            }
        };

        for (i, image) in images.into_iter().enumerate() {
            let image_name = format!("page_{}_img_{}.png", page, i + 1);
            let result = image.and_then(|img| {
                if !img.is_renderable() {
                    return Ok(false);
                }
                save_image(store, &doc_dir, document_id, page, &image_name, &img).map(|_| true)
            });
            match result {
                Ok(true) => report.images += 1,
                Ok(false) => {
                    tracing::debug!(document_id, page, image = %image_name, "skipping image with 4+ colour components");
                    report.skipped_images += 1;
                }
                Err(e) => {
                    tracing::warn!(document_id, page, image = %image_name, error = %e, "skipping image");
                    report.skipped_images += 1;
                }
            }
        }
    }

    report
}

fn save_image(
    store: &Store,
    doc_dir: &Path,
    document_id: &str,
    page: u32,
    image_name: &str,
    image: &PageImage,
) -> Result<(), ExtractionError> {
    let decoded = image.to_dynamic()?;
    std::fs::create_dir_all(doc_dir).map_err(|e| ExtractionError::Image(e.to_string()))?;
    let path = doc_dir.join(image_name);
    decoded
        .save_with_format(&path, ImageFormat::Png)
        .map_err(|e| ExtractionError::Image(e.to_string()))?;
    store
        .add_image(document_id, page, image_name, &path.to_string_lossy(), None)
        .map_err(|e| ExtractionError::Image(e.to_string()))?;
    Ok(())
}
