pub mod models;

use chrono::{SecondsFormat, Utc};
use models::{ChatSession, Document, ExtractedImage, Message, PageText, Role};
use rusqlite::{params, Connection, OptionalExtension, Result, Row};
use std::path::{Path, PathBuf};

/// Fixed-width UTC timestamp; lexical order matches chronological order.
pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Location of the SQLite file. Hands out one [`Store`] per request.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Self {
            path: path.to_path_buf(),
        };
        db.open()?.migrate()?;
        Ok(db)
    }

    /// Open a connection scoped to the caller. It is closed when the `Store` drops.
    pub fn open(&self) -> Result<Store> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        Ok(Store { conn })
    }
}

pub struct Store {
    conn: Connection,
}

impl Store {
    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                storage_path TEXT NOT NULL,
                uploaded_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS page_texts (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                page_number INTEGER NOT NULL CHECK (page_number >= 1),
                text TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS extracted_images (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL,
                page_number INTEGER NOT NULL CHECK (page_number >= 1),
                image_name TEXT NOT NULL,
                image_path TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL,
                FOREIGN KEY (document_id) REFERENCES documents(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS chat_sessions (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
                content TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (session_id) REFERENCES chat_sessions(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_page_texts_document ON page_texts(document_id, page_number);
            CREATE INDEX IF NOT EXISTS idx_images_document ON extracted_images(document_id, page_number);
            CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);
            ",
        )?;
        Ok(())
    }

    // ── Documents ──

    pub fn create_document(&self, id: &str, filename: &str, storage_path: &str) -> Result<Document> {
        let doc = Document {
            id: id.to_string(),
            filename: filename.to_string(),
            storage_path: storage_path.to_string(),
            uploaded_at: now(),
        };
        self.conn.execute(
            "INSERT INTO documents (id, filename, storage_path, uploaded_at) VALUES (?1, ?2, ?3, ?4)",
            params![doc.id, doc.filename, doc.storage_path, doc.uploaded_at],
        )?;
        Ok(doc)
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        self.conn
            .query_row(
                "SELECT id, filename, storage_path, uploaded_at FROM documents WHERE id = ?1",
                params![id],
                document_from_row,
            )
            .optional()
    }

    pub fn list_documents(&self) -> Result<Vec<Document>> {
        self.recent_documents(u32::MAX)
    }

    /// Most recently uploaded documents first.
    pub fn recent_documents(&self, limit: u32) -> Result<Vec<Document>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, filename, storage_path, uploaded_at FROM documents
             ORDER BY uploaded_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], document_from_row)?;
        rows.collect()
    }

    /// Returns whether a row was removed. Pages and images go with it.
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM documents WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Page texts ──

    pub fn add_page_text(&self, document_id: &str, page_number: u32, text: &str) -> Result<PageText> {
        let page = PageText {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            page_number,
            text: text.to_string(),
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO page_texts (id, document_id, page_number, text, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![page.id, page.document_id, page.page_number, page.text, page.created_at],
        )?;
        Ok(page)
    }

    pub fn get_page_texts(&self, document_id: &str) -> Result<Vec<PageText>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page_number, text, created_at FROM page_texts
             WHERE document_id = ?1 ORDER BY page_number ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![document_id], page_text_from_row)?;
        rows.collect()
    }

    /// Page texts of the `doc_limit` newest documents: newest document first,
    /// ascending page number within a document, at most `limit` rows.
    pub fn recent_page_texts(&self, doc_limit: u32, limit: u32) -> Result<Vec<PageText>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.id, p.document_id, p.page_number, p.text, p.created_at
             FROM page_texts p
             JOIN (SELECT id, uploaded_at, rowid AS seq FROM documents
                   ORDER BY uploaded_at DESC, rowid DESC LIMIT ?1) d ON p.document_id = d.id
             ORDER BY d.uploaded_at DESC, d.seq DESC, p.page_number ASC, p.rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![doc_limit, limit], page_text_from_row)?;
        rows.collect()
    }

    // ── Images ──

    pub fn add_image(
        &self,
        document_id: &str,
        page_number: u32,
        image_name: &str,
        image_path: &str,
        description: Option<&str>,
    ) -> Result<ExtractedImage> {
        let image = ExtractedImage {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            page_number,
            image_name: image_name.to_string(),
            image_path: image_path.to_string(),
            description: description.map(str::to_string),
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO extracted_images (id, document_id, page_number, image_name, image_path, description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                image.id,
                image.document_id,
                image.page_number,
                image.image_name,
                image.image_path,
                image.description,
                image.created_at
            ],
        )?;
        Ok(image)
    }

    pub fn get_image(&self, document_id: &str, image_name: &str) -> Result<Option<ExtractedImage>> {
        self.conn
            .query_row(
                "SELECT id, document_id, page_number, image_name, image_path, description, created_at
                 FROM extracted_images WHERE document_id = ?1 AND image_name = ?2",
                params![document_id, image_name],
                image_from_row,
            )
            .optional()
    }

    pub fn get_images(&self, document_id: &str) -> Result<Vec<ExtractedImage>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page_number, image_name, image_path, description, created_at
             FROM extracted_images WHERE document_id = ?1 ORDER BY page_number ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![document_id], image_from_row)?;
        rows.collect()
    }

    /// Same ordering and bounds as [`Store::recent_page_texts`].
    pub fn recent_images(&self, doc_limit: u32, limit: u32) -> Result<Vec<ExtractedImage>> {
        let mut stmt = self.conn.prepare(
            "SELECT i.id, i.document_id, i.page_number, i.image_name, i.image_path, i.description, i.created_at
             FROM extracted_images i
             JOIN (SELECT id, uploaded_at, rowid AS seq FROM documents
                   ORDER BY uploaded_at DESC, rowid DESC LIMIT ?1) d ON i.document_id = d.id
             ORDER BY d.uploaded_at DESC, d.seq DESC, i.page_number ASC, i.rowid ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![doc_limit, limit], image_from_row)?;
        rows.collect()
    }

    // ── Sessions ──

    pub fn create_session(&self, title: &str) -> Result<ChatSession> {
        let ts = now();
        let session = ChatSession {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.to_string(),
            created_at: ts.clone(),
            updated_at: ts,
        };
        self.conn.execute(
            "INSERT INTO chat_sessions (id, title, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![session.id, session.title, session.created_at, session.updated_at],
        )?;
        Ok(session)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        self.conn
            .query_row(
                "SELECT id, title, created_at, updated_at FROM chat_sessions WHERE id = ?1",
                params![id],
                session_from_row,
            )
            .optional()
    }

    pub fn list_sessions(&self) -> Result<Vec<ChatSession>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, created_at, updated_at FROM chat_sessions ORDER BY updated_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([], session_from_row)?;
        rows.collect()
    }

    pub fn delete_session(&self, id: &str) -> Result<bool> {
        let n = self
            .conn
            .execute("DELETE FROM chat_sessions WHERE id = ?1", params![id])?;
        Ok(n > 0)
    }

    // ── Messages ──

    pub fn add_message(&self, session_id: &str, role: Role, content: &str) -> Result<Message> {
        let msg = Message {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now(),
        };
        self.conn.execute(
            "INSERT INTO messages (id, session_id, role, content, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![msg.id, msg.session_id, msg.role, msg.content, msg.created_at],
        )?;
        // Touch session updated_at
        self.conn.execute(
            "UPDATE chat_sessions SET updated_at = ?1 WHERE id = ?2",
            params![msg.created_at, session_id],
        )?;
        Ok(msg)
    }

    /// Full history of a session in insertion order.
    pub fn get_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, session_id, role, content, created_at FROM messages
             WHERE session_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(Message {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;
        rows.collect()
    }
}

fn document_from_row(row: &Row<'_>) -> Result<Document> {
    Ok(Document {
        id: row.get(0)?,
        filename: row.get(1)?,
        storage_path: row.get(2)?,
        uploaded_at: row.get(3)?,
    })
}

fn page_text_from_row(row: &Row<'_>) -> Result<PageText> {
    Ok(PageText {
        id: row.get(0)?,
        document_id: row.get(1)?,
        page_number: row.get(2)?,
        text: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn image_from_row(row: &Row<'_>) -> Result<ExtractedImage> {
    Ok(ExtractedImage {
        id: row.get(0)?,
        document_id: row.get(1)?,
        page_number: row.get(2)?,
        image_name: row.get(3)?,
        image_path: row.get(4)?,
        description: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn session_from_row(row: &Row<'_>) -> Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        title: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
    })
}
