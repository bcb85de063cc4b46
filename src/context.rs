//! Builds the turn list sent to the model for one chat message.
//!
//! The persisted session history is replayed as-is, then a bounded digest of
//! the newest documents (page text excerpts plus an image list) is appended
//! to the final user turn.

use crate::db::models::{Document, ExtractedImage, PageText, Role};
use crate::db::Store;
use crate::llm::ChatMessage;

pub const MAX_DOCUMENTS: u32 = 5;
pub const MAX_PAGE_ROWS: u32 = 20;
pub const MAX_IMAGES: u32 = 10;
pub const PAGE_EXCERPT_CHARS: usize = 500;
pub const DIGEST_MAX_CHARS: usize = 4000;
pub const TRUNCATION_MARKER: &str = "...";

/// An image the annotator may reference in a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    pub document_id: String,
    pub page_number: u32,
    pub image_name: String,
    pub description: Option<String>,
}

impl CatalogImage {
    pub fn url(&self) -> String {
        image_url(&self.document_id, &self.image_name)
    }

    pub fn alt_text(&self) -> String {
        match &self.description {
            Some(d) if !d.trim().is_empty() => d.clone(),
            _ => format!("Página {}", self.page_number),
        }
    }

    pub fn markdown(&self) -> String {
        format!("![{}]({})", self.alt_text(), self.url())
    }
}

impl From<ExtractedImage> for CatalogImage {
    fn from(image: ExtractedImage) -> Self {
        Self {
            document_id: image.document_id,
            page_number: image.page_number,
            image_name: image.image_name,
            description: image.description,
        }
    }
}

/// Public path under which an extracted image is served.
pub fn image_url(document_id: &str, image_name: &str) -> String {
    format!("/api/image/{}/{}", document_id, image_name)
}

#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub turns: Vec<ChatMessage>,
    pub catalog: Vec<CatalogImage>,
}

/// Persist `user_message`, then build the turns and image catalog for the session.
///
/// The message is stored before anything else so it survives a failed
/// completion call.
pub fn assemble(store: &Store, session_id: &str, user_message: &str) -> rusqlite::Result<AssembledContext> {
    store.add_message(session_id, Role::User, user_message)?;

    let mut turns: Vec<ChatMessage> = store
        .get_messages(session_id)?
        .into_iter()
        .map(|m| ChatMessage {
            role: m.role,
            content: m.content,
        })
        .collect();

    let documents = store.recent_documents(MAX_DOCUMENTS)?;
    let pages = store.recent_page_texts(MAX_DOCUMENTS, MAX_PAGE_ROWS)?;
    let catalog: Vec<CatalogImage> = store
        .recent_images(MAX_DOCUMENTS, MAX_IMAGES)?
        .into_iter()
        .map(CatalogImage::from)
        .collect();

    let digest = build_digest(&documents, &pages, &catalog);
    if !digest.is_empty() && !attach_digest(&mut turns, &digest) {
        tracing::warn!(session_id, "last turn is not from the user; dropping document context");
    }

    tracing::debug!(
        session_id,
        turns = turns.len(),
        documents = documents.len(),
        images = catalog.len(),
        digest_chars = digest.chars().count(),
        "assembled chat context"
    );

    Ok(AssembledContext { turns, catalog })
}

/// Text summary of the available documents, at most
/// `DIGEST_MAX_CHARS` characters plus the truncation marker.
pub fn build_digest(documents: &[Document], pages: &[PageText], images: &[CatalogImage]) -> String {
    if documents.is_empty() {
        return String::new();
    }

    let mut digest = String::from("Contexto de los documentos PDF disponibles:\n");
    for doc in documents {
        digest.push_str(&format!("\nDocumento: {}\n", doc.filename));
        for page in pages.iter().filter(|p| p.document_id == doc.id) {
            let excerpt: String = page.text.chars().take(PAGE_EXCERPT_CHARS).collect();
            digest.push_str(&format!("Página {}: {}...\n", page.page_number, excerpt));
        }
    }

    if !images.is_empty() {
        digest.push_str("\nImágenes disponibles:\n");
        for image in images {
            digest.push_str(&image.markdown());
            digest.push('\n');
        }
    }

    truncate_digest(digest)
}

fn truncate_digest(digest: String) -> String {
    match digest.char_indices().nth(DIGEST_MAX_CHARS) {
        Some((cut, _)) => {
            let mut truncated = digest[..cut].to_string();
            truncated.push_str(TRUNCATION_MARKER);
            truncated
        }
        None => digest,
    }
}

/// Append `digest` to the last turn if it is a user turn. Returns whether it was attached.
pub fn attach_digest(turns: &mut [ChatMessage], digest: &str) -> bool {
    match turns.last_mut() {
        Some(last) if last.role == Role::User => {
            last.content.push_str("\n\n");
            last.content.push_str(digest);
            true
        }
        _ => false,
    }
}
