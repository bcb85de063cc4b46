use std::path::PathBuf;

use crate::db::models::{Document, PageText};
use crate::db::Database;
use crate::doc_processor;
use crate::error::AppError;
use crate::server::AppState;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReply {
    pub success: bool,
    pub pdf_id: String,
    pub filename: String,
    pub processed: bool,
}

/// Reduce an uploaded file name to a safe single path component.
pub fn secure_filename(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    cleaned.trim_start_matches(['.', '_']).to_string()
}

fn is_pdf_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".pdf")
}

/// `POST /api/upload-pdf` — store the file, record it, then ingest it.
///
/// Ingestion failure is reported through `processed` and does not fail the upload.
pub async fn upload_pdf(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadReply>, AppError> {
    let invalid = |e: axum::extract::multipart::MultipartError| {
        AppError::Validation(format!("Invalid upload: {}", e.body_text()))
    };

    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(invalid)? {
        if field.name() != Some("file") {
            continue;
        }
        let original = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(invalid)?;
        upload = Some((original, bytes));
        break;
    }

    let (original, bytes) = upload.ok_or_else(|| AppError::Validation("No file provided".into()))?;
    if original.trim().is_empty() {
        return Err(AppError::Validation("No file selected".into()));
    }
    if !is_pdf_name(&original) {
        return Err(AppError::Validation("The file must be a PDF".into()));
    }
    let filename = secure_filename(&original);
    if !is_pdf_name(&filename) {
        return Err(AppError::Validation("Invalid file name".into()));
    }

    let pdf_id = uuid::Uuid::new_v4().to_string();
    let uploads_dir = state.config.uploads_dir();
    let storage_path = store_upload(&state.db, &uploads_dir, &pdf_id, &filename, &bytes).await?;
    tracing::info!(pdf_id = %pdf_id, filename = %filename, bytes = bytes.len(), "PDF uploaded");

    let db = state.db.clone();
    let images_dir = state.config.images_dir();
    let doc_id = pdf_id.clone();
    let processed = tokio::task::spawn_blocking(move || -> Result<bool, AppError> {
        let store = db.open()?;
        Ok(doc_processor::ingest(&store, &images_dir, &doc_id, &storage_path))
    })
    .await??;

    Ok(Json(UploadReply {
        success: true,
        pdf_id,
        filename,
        processed,
    }))
}

/// Write the upload to `uploads_dir/{id}_{filename}` and record it. The file
/// is removed again if the row cannot be inserted.
async fn store_upload(
    db: &Database,
    uploads_dir: &std::path::Path,
    pdf_id: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf, AppError> {
    let storage_path = uploads_dir.join(format!("{}_{}", pdf_id, filename));
    tokio::fs::write(&storage_path, bytes).await?;

    let inserted = db
        .open()
        .and_then(|store| store.create_document(pdf_id, filename, &storage_path.to_string_lossy()));
    if let Err(e) = inserted {
        if let Err(rm) = tokio::fs::remove_file(&storage_path).await {
            tracing::warn!(pdf_id, error = %rm, "failed to remove orphaned upload");
        }
        return Err(e.into());
    }
    Ok(storage_path)
}

/// `GET /api/documents`
pub async fn list_documents(State(state): State<AppState>) -> Result<Json<Vec<Document>>, AppError> {
    let store = state.db.open()?;
    Ok(Json(store.list_documents()?))
}

/// `GET /api/documents/{id}/pages`
pub async fn document_pages(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<PageText>>, AppError> {
    let store = state.db.open()?;
    if store.get_document(&id)?.is_none() {
        return Err(AppError::NotFound(format!("Document not found: {}", id)));
    }
    Ok(Json(store.get_page_texts(&id)?))
}

/// `DELETE /api/documents/{id}` — rows cascade; files are removed best-effort.
pub async fn delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let document = {
        let store = state.db.open()?;
        let document = store
            .get_document(&id)?
            .ok_or_else(|| AppError::NotFound(format!("Document not found: {}", id)))?;
        store.delete_document(&id)?;
        document
    };

    if let Err(e) = tokio::fs::remove_file(&document.storage_path).await {
        tracing::warn!(document_id = %id, error = %e, "failed to remove uploaded file");
    }
    let images = state.config.document_images_dir(&id);
    if images.exists() {
        if let Err(e) = tokio::fs::remove_dir_all(&images).await {
            tracing::warn!(document_id = %id, error = %e, "failed to remove image directory");
        }
    }
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /api/image/{document_id}/{image_name}`
pub async fn image(
    State(state): State<AppState>,
    Path((document_id, image_name)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let not_found = || AppError::NotFound(format!("Image not found: {}/{}", document_id, image_name));

    let record = {
        let store = state.db.open()?;
        store.get_image(&document_id, &image_name)?
    }
    .ok_or_else(not_found)?;

    let bytes = match tokio::fs::read(&record.image_path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => return Err(e.into()),
    };
    Ok(([(header::CONTENT_TYPE, "image/png")], bytes).into_response())
}
