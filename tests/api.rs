//! End-to-end tests through the axum router, with a wiremock server standing
//! in for the completion API.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use lopdf::content::{Content, Operation};
use lopdf::{dictionary, Dictionary, Object, Stream};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use pdf_chat::config::Config;
use pdf_chat::server::{router, AppState};

const BOUNDARY: &str = "pdf-chat-test-boundary";

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn setup(server: &MockServer) -> (tempfile::TempDir, Router) {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::with_data_dir(dir.path().join("data"));
    config.llm.base_url = server.uri();
    let state = AppState::new(config).expect("app state");
    (dir, router(state))
}

/// Single-page PDF with `text` and, optionally, one 2x2 RGB image.
fn one_page_pdf(text: &str, with_image: bool) -> Vec<u8> {
    let mut doc = lopdf::Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });

    let mut operations = vec![
        Operation::new("BT", vec![]),
        Operation::new("Tf", vec!["F1".into(), 24.into()]),
        Operation::new("Td", vec![100.into(), 600.into()]),
        Operation::new("Tj", vec![Object::string_literal(text)]),
        Operation::new("ET", vec![]),
    ];
    let mut xobjects = Dictionary::new();
    if with_image {
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 2,
                "Height" => 2,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![255u8, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255],
        ));
        xobjects.set("Im1", image_id);
        operations.push(Operation::new("Do", vec![Object::Name(b"Im1".to_vec())]));
    }

    let content = Content { operations };
    let content_id = doc.add_object(Stream::new(dictionary! {}, content.encode().unwrap()));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "Contents" => content_id,
        "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
        "Resources" => dictionary! {
            "Font" => dictionary! { "F1" => font_id },
            "XObject" => xobjects,
        },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![Object::Reference(page_id)],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).unwrap();
    bytes
}

fn upload_request(field: &str, filename: &str, content: &[u8]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/pdf\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(content);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/api/upload-pdf")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

fn chat_request(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Vec<u8>) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

async fn send_json(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send(app, req).await;
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

fn completion(text: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "choices": [{"message": {"role": "assistant", "content": text}}]
    }))
}

// ---------------------------------------------------------------------------
// Upload
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_upload_ingests_single_page_text() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, upload_request("file", "hello.pdf", &one_page_pdf("Hello", false))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["processed"], true);
    assert_eq!(body["filename"], "hello.pdf");
    let pdf_id = body["pdfId"].as_str().unwrap().to_string();

    let (status, pages) = send_json(&app, get(&format!("/api/documents/{}/pages", pdf_id))).await;
    assert_eq!(status, StatusCode::OK);
    let pages = pages.as_array().unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0]["pageNumber"], 1);
    assert_eq!(pages[0]["text"], "Hello");
}

#[tokio::test]
async fn test_upload_rejects_non_pdf_name() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, upload_request("file", "notes.txt", b"hello")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("PDF"));

    let (_, docs) = send_json(&app, get("/api/documents")).await;
    assert_eq!(docs.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_upload_requires_file_field() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, upload_request("other", "a.pdf", b"%PDF")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_upload_of_broken_pdf_still_succeeds() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, upload_request("file", "broken.pdf", b"not really a pdf")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["processed"], false);

    let (_, docs) = send_json(&app, get("/api/documents")).await;
    assert_eq!(docs.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_extracted_image_is_served() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (_, body) = send_json(&app, upload_request("file", "pic.pdf", &one_page_pdf("Figura", true))).await;
    let pdf_id = body["pdfId"].as_str().unwrap().to_string();

    let resp = app
        .clone()
        .oneshot(get(&format!("/api/image/{}/page_1_img_1.png", pdf_id)))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[header::CONTENT_TYPE], "image/png");
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.starts_with(b"\x89PNG"));

    let (status, body) = send_json(&app, get(&format!("/api/image/{}/missing.png", pdf_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_delete_document_removes_pages() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (_, body) = send_json(&app, upload_request("file", "a.pdf", &one_page_pdf("Hola", false))).await;
    let pdf_id = body["pdfId"].as_str().unwrap().to_string();

    let req = Request::builder()
        .method("DELETE")
        .uri(format!("/api/documents/{}", pdf_id))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send_json(&app, get(&format!("/api/documents/{}/pages", pdf_id))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_chat_requires_message() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, chat_request(json!({ "sessionId": null }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string());

    let (_, history) = send_json(&app, get("/api/history")).await;
    assert_eq!(history["sessions"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_chat_round_trip_and_history() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("¡Hola! Soy tu asistente."))
        .mount(&server)
        .await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, chat_request(json!({ "message": "Hola" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"], "¡Hola! Soy tu asistente.");
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    let (status, body) = send_json(
        &app,
        chat_request(json!({ "message": "¿Sigues ahí?", "sessionId": session_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sessionId"], session_id.as_str());

    let (_, history) = send_json(&app, get(&format!("/api/history?sessionId={}", session_id))).await;
    let roles: Vec<_> = history["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant"]);

    let (_, sessions) = send_json(&app, get("/api/history")).await;
    let sessions = sessions["sessions"].as_array().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["title"], "Hola");

    // The second request replayed the whole conversation.
    let requests = server.received_requests().await.unwrap();
    let last: Value = serde_json::from_slice(&requests.last().unwrap().body).unwrap();
    assert_eq!(last["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_chat_injects_pdf_context_and_annotates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("En la página 1 aparece una figura."))
        .mount(&server)
        .await;
    let (_dir, app) = setup(&server).await;

    let (_, body) = send_json(&app, upload_request("file", "fig.pdf", &one_page_pdf("Hello", true))).await;
    let pdf_id = body["pdfId"].as_str().unwrap().to_string();

    let (status, body) = send_json(&app, chat_request(json!({ "message": "¿Qué hay en el PDF?" }))).await;
    assert_eq!(status, StatusCode::OK);
    let expected = format!("página 1\n\n![Página 1](/api/image/{}/page_1_img_1.png)", pdf_id);
    assert!(body["response"].as_str().unwrap().contains(&expected));

    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let user_turn = sent["messages"][0]["content"].as_str().unwrap();
    assert!(user_turn.starts_with("¿Qué hay en el PDF?"));
    assert!(user_turn.contains("Documento: fig.pdf"));
    assert!(user_turn.contains("Página 1: Hello..."));
}

#[tokio::test]
async fn test_chat_api_error_is_visible_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
        .mount(&server)
        .await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(&app, chat_request(json!({ "message": "Hola" }))).await;
    assert_eq!(status, StatusCode::OK);
    let response = body["response"].as_str().unwrap();
    assert!(response.contains("429"));
    assert!(response.contains("rate limited"));
}

#[tokio::test]
async fn test_chat_unknown_session_is_404() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;

    let (status, body) = send_json(
        &app,
        chat_request(json!({ "message": "Hola", "sessionId": "does-not-exist" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("does-not-exist"));
}

#[tokio::test]
async fn test_delete_session_then_404() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("Hola"))
        .mount(&server)
        .await;
    let (_dir, app) = setup(&server).await;

    let (_, body) = send_json(&app, chat_request(json!({ "message": "Hola" }))).await;
    let session_id = body["sessionId"].as_str().unwrap().to_string();

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri(format!("/api/sessions/{}", session_id))
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, delete()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, history) = send_json(&app, get(&format!("/api/history?sessionId={}", session_id))).await;
    assert!(history["messages"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health() {
    let server = MockServer::start().await;
    let (_dir, app) = setup(&server).await;
    let (status, body) = send_json(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
