// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP upload intake.
//
// Routes:
//
//   POST /upload           multipart form, field `file`
//                            200  stored and queued
//                            400  not multipart, or no `file` field
//                            500  could not be written to the upload directory
//                            405  any other method (router method filter)
//   GET  /                 overview page: configured printers and an upload form
//   GET  /printer_states   poll every printer once and report its status
//   GET  /queue            files waiting for a printer, oldest first
//
// Uploads are streamed to disk chunk by chunk through `UploadStore`; a
// request only returns once the file is durably stored and queued.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::multipart::{Field, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use printfarm_core::error::{PrintFarmError, Result};
use printfarm_core::types::{FileId, PendingFile, PrinterEndpoint, PrinterStatus, ServerStatus};

use crate::intake::UploadStore;
use crate::printer_client::PrinterApi;

/// Path of the upload route.
pub const UPLOAD_ROUTE: &str = "/upload";

/// Largest accepted request body.  G-code for long prints runs to hundreds of
/// megabytes.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024; // 1 GiB

/// Multipart field carrying the file.
const FILE_FIELD: &str = "file";

/// State shared by all request handlers.
#[derive(Clone)]
struct IntakeState<C> {
    store: UploadStore,
    client: C,
    endpoints: Arc<Vec<PrinterEndpoint>>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: String,
    file_id: FileId,
    file_name: String,
    size_bytes: u64,
    pending: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Serialize)]
struct PrinterStateEntry {
    url: String,
    status: PrinterStatus,
    hostname: Option<String>,
    message: String,
}

#[derive(Debug, Serialize)]
struct QueueEntry {
    file_id: FileId,
    file_name: String,
    arrival_time: DateTime<Utc>,
    size_bytes: u64,
    send_attempts: u32,
}

impl From<PendingFile> for QueueEntry {
    fn from(file: PendingFile) -> Self {
        Self {
            file_id: file.id,
            file_name: file.file_name,
            arrival_time: file.arrival_time,
            size_bytes: file.size_bytes,
            send_attempts: file.send_attempts,
        }
    }
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            message: message.into(),
        }),
    )
        .into_response()
}

/// Build the intake router.
///
/// `client` and `endpoints` back the `/printer_states` report; uploads only
/// touch `store`.
pub fn router<C>(store: UploadStore, client: C, endpoints: Arc<Vec<PrinterEndpoint>>) -> Router
where
    C: PrinterApi + Clone + 'static,
{
    let state = IntakeState {
        store,
        client,
        endpoints,
    };

    Router::new()
        .route("/", get(index::<C>))
        .route(UPLOAD_ROUTE, post(upload::<C>))
        .route("/printer_states", get(printer_states::<C>))
        .route("/queue", get(queue::<C>))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

async fn index<C>(State(state): State<IntakeState<C>>) -> Html<String>
where
    C: PrinterApi + Clone + 'static,
{
    let printers: String = state
        .endpoints
        .iter()
        .map(|ep| {
            let url = escape_html(&ep.base_url);
            format!(
                "<li><a href=\"{url}\">{}</a></li>\n",
                escape_html(ep.label())
            )
        })
        .collect();

    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Printfarm</title></head>\n<body>\n\
         <h1>Printfarm</h1>\n\
         <h2>Printers</h2>\n<ul>\n{printers}</ul>\n\
         <h2>Upload</h2>\n\
         <form action=\"{UPLOAD_ROUTE}\" method=\"post\" enctype=\"multipart/form-data\">\n\
         <input type=\"file\" name=\"{FILE_FIELD}\">\n\
         <input type=\"submit\" value=\"Upload\">\n\
         </form>\n</body>\n</html>\n"
    ))
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

async fn upload<C>(
    State(state): State<IntakeState<C>>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response
where
    C: PrinterApi + Clone + 'static,
{
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rejection) => {
            debug!(error = %rejection, "upload without a multipart body");
            return error_response(StatusCode::BAD_REQUEST, format!("Error retrieving file: {rejection}"));
        }
    };

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "malformed multipart body");
                return error_response(StatusCode::BAD_REQUEST, format!("Error retrieving file: {e}"));
            }
        };

        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        return match store_field(&state.store, field).await {
            Ok(file) => {
                let pending = state.store.queue().len();
                (
                    StatusCode::OK,
                    Json(UploadResponse {
                        message: format!("File '{}' uploaded successfully!", file.file_name),
                        file_id: file.id,
                        file_name: file.file_name,
                        size_bytes: file.size_bytes,
                        pending,
                    }),
                )
                    .into_response()
            }
            Err(UploadFailure::Client(message)) => error_response(StatusCode::BAD_REQUEST, message),
            Err(UploadFailure::Storage(e)) => {
                error!(error = %e, "could not store upload");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
    }

    error_response(StatusCode::BAD_REQUEST, "No file was received.")
}

enum UploadFailure {
    /// The client's body broke off or was malformed.
    Client(String),
    /// We could not write the bytes.
    Storage(PrintFarmError),
}

async fn store_field(
    store: &UploadStore,
    mut field: Field<'_>,
) -> std::result::Result<PendingFile, UploadFailure> {
    let original_name = field.file_name().unwrap_or_default().to_string();
    let mut upload = store.begin(&original_name).await.map_err(UploadFailure::Storage)?;

    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if let Err(e) = upload.write_chunk(&chunk).await {
                    upload.abort().await;
                    return Err(UploadFailure::Storage(e));
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(name = %upload.file_name(), written = upload.written(), error = %e, "upload interrupted");
                upload.abort().await;
                return Err(UploadFailure::Client(format!("Error retrieving file: {e}")));
            }
        }
    }

    upload.finish().await.map_err(UploadFailure::Storage)
}

async fn printer_states<C>(State(state): State<IntakeState<C>>) -> Json<Vec<PrinterStateEntry>>
where
    C: PrinterApi + Clone + 'static,
{
    let mut entries = Vec::with_capacity(state.endpoints.len());
    for endpoint in state.endpoints.iter() {
        let entry = match state.client.get_status(endpoint).await {
            Ok(printer) => PrinterStateEntry {
                url: endpoint.base_url.clone(),
                status: printer.status,
                hostname: printer.hostname,
                message: printer.raw_message,
            },
            Err(e) => PrinterStateEntry {
                url: endpoint.base_url.clone(),
                status: PrinterStatus::Unreachable,
                hostname: None,
                message: e.to_string(),
            },
        };
        entries.push(entry);
    }
    Json(entries)
}

async fn queue<C>(State(state): State<IntakeState<C>>) -> Json<Vec<QueueEntry>>
where
    C: PrinterApi + Clone + 'static,
{
    Json(
        state
            .store
            .queue()
            .snapshot()
            .into_iter()
            .map(QueueEntry::from)
            .collect(),
    )
}

// ---------------------------------------------------------------------------
// IntakeServer
// ---------------------------------------------------------------------------

/// Upload intake listener.
///
/// Created `Stopped`; [`start`](Self::start) binds and serves on a Tokio task,
/// [`stop`](Self::stop) stops accepting new connections and lets uploads in
/// flight finish.
pub struct IntakeServer {
    /// Address to bind; port 0 picks a free port.
    bind_addr: SocketAddr,
    /// Address actually bound, once running.
    local_addr: Option<SocketAddr>,
    status: ServerStatus,
    shutdown_signal: Arc<Notify>,
    task_handle: Option<JoinHandle<()>>,
    router: Router,
}

impl IntakeServer {
    pub fn new<C>(
        bind_addr: SocketAddr,
        store: UploadStore,
        client: C,
        endpoints: Arc<Vec<PrinterEndpoint>>,
    ) -> Self
    where
        C: PrinterApi + Clone + 'static,
    {
        Self {
            bind_addr,
            local_addr: None,
            status: ServerStatus::Stopped,
            shutdown_signal: Arc::new(Notify::new()),
            task_handle: None,
            router: router(store, client, endpoints),
        }
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Bind the listener and start serving.  Returns the bound address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let (ServerStatus::Running, Some(addr)) = (self.status, self.local_addr) {
            debug!(addr = %addr, "intake server already running");
            return Ok(addr);
        }

        self.status = ServerStatus::Starting;

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.status = ServerStatus::Error;
                return Err(PrintFarmError::IntakeServer(format!("bind {}: {e}", self.bind_addr)));
            }
        };
        let local_addr = listener
            .local_addr()
            .map_err(|e| PrintFarmError::IntakeServer(format!("local address: {e}")))?;

        info!(addr = %local_addr, route = UPLOAD_ROUTE, "file upload server listening");

        let shutdown = Arc::clone(&self.shutdown_signal);
        let app = self.router.clone();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown.notified().await;
                    debug!("intake server received shutdown signal");
                })
                .await;
            if let Err(e) = served {
                error!(error = %e, "intake server stopped with error");
            }
        });

        self.task_handle = Some(handle);
        self.local_addr = Some(local_addr);
        self.status = ServerStatus::Running;
        Ok(local_addr)
    }

    /// Stop accepting uploads and wait for requests in flight to complete.
    pub async fn stop(&mut self) -> Result<()> {
        if self.status != ServerStatus::Running {
            return Ok(());
        }

        info!(addr = ?self.local_addr, "stopping intake server");
        self.shutdown_signal.notify_one();

        if let Some(handle) = self.task_handle.take() {
            handle
                .await
                .map_err(|e| PrintFarmError::IntakeServer(format!("task join: {e}")))?;
        }

        self.status = ServerStatus::Stopped;
        self.local_addr = None;
        info!("intake server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, header};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::queue::PendingFileQueue;

    use super::*;

    const BOUNDARY: &str = "printfarm-test-boundary";

    /// Printer that always answers with a fixed status, or is unreachable.
    #[derive(Clone)]
    struct FixedPrinter(Option<PrinterStatus>);

    impl PrinterApi for FixedPrinter {
        async fn get_status(&self, endpoint: &PrinterEndpoint) -> Result<printfarm_core::PrinterState> {
            match self.0 {
                Some(status) => Ok(printfarm_core::PrinterState {
                    endpoint: endpoint.clone(),
                    status,
                    hostname: Some("voron".into()),
                    raw_message: "Printer is ready".into(),
                }),
                None => Err(PrintFarmError::Unreachable("connection refused".into())),
            }
        }

        async fn send_file(&self, _endpoint: &PrinterEndpoint, _file: &PendingFile) -> Result<()> {
            Ok(())
        }
    }

    fn app(dir: &std::path::Path, printer: FixedPrinter) -> (Router, UploadStore) {
        let store = UploadStore::new(dir, Arc::new(PendingFileQueue::new()));
        let endpoints = Arc::new(vec![
            PrinterEndpoint::parse("http://p1").expect("endpoint"),
        ]);
        (router(store.clone(), printer, endpoints), store)
    }

    fn multipart_body(field: &str, file_name: &str, contents: &str) -> String {
        format!(
            "--{BOUNDARY}\r\n\
             Content-Disposition: form-data; name=\"{field}\"; filename=\"{file_name}\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\
             {contents}\r\n\
             --{BOUNDARY}--\r\n"
        )
    }

    fn upload_request(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(UPLOAD_ROUTE)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn upload_stores_and_queues_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, store) = app(dir.path(), FixedPrinter(Some(PrinterStatus::Busy)));

        let response = app
            .oneshot(upload_request(multipart_body("file", "benchy.gcode", "G28\nG1 X5")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["file_name"], "benchy.gcode");
        assert_eq!(json["pending"], 1);
        assert_eq!(json["message"], "File 'benchy.gcode' uploaded successfully!");

        let queued = store.queue().try_pop().expect("queued");
        assert_eq!(std::fs::read(&queued.path).expect("read"), b"G28\nG1 X5");
    }

    #[tokio::test]
    async fn missing_file_field_is_bad_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, store) = app(dir.path(), FixedPrinter(None));

        let response = app
            .oneshot(upload_request(multipart_body("document", "a.gcode", "G28")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.queue().is_empty());
    }

    #[tokio::test]
    async fn non_multipart_body_is_bad_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, _) = app(dir.path(), FixedPrinter(None));

        let request = Request::builder()
            .method("POST")
            .uri(UPLOAD_ROUTE)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{}"))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn wrong_method_is_not_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, _) = app(dir.path(), FixedPrinter(None));

        let request = Request::builder()
            .method("GET")
            .uri(UPLOAD_ROUTE)
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn unwritable_upload_dir_is_server_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        // A regular file where the upload directory should be.
        let blocked = dir.path().join("uploads");
        std::fs::write(&blocked, b"not a directory").expect("write");
        let (app, store) = app(&blocked, FixedPrinter(None));

        let response = app
            .oneshot(upload_request(multipart_body("file", "a.gcode", "G28")))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(store.queue().is_empty());
    }

    #[tokio::test]
    async fn index_lists_configured_printers() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, _) = app(dir.path(), FixedPrinter(None));

        let request = Request::builder().uri("/").body(Body::empty()).expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.expect("body").to_bytes();
        let page = String::from_utf8(bytes.to_vec()).expect("utf8");
        assert!(page.contains("<a href=\"http://p1\">http://p1</a>"));
        assert!(page.contains("action=\"/upload\""));
    }

    #[test]
    fn escape_html_neutralises_markup() {
        assert_eq!(escape_html("<b>\"a&b\"</b>"), "&lt;b&gt;&quot;a&amp;b&quot;&lt;/b&gt;");
    }

    #[tokio::test]
    async fn printer_states_reports_each_printer() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, _) = app(dir.path(), FixedPrinter(Some(PrinterStatus::Ready)));

        let request = Request::builder()
            .uri("/printer_states")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json[0]["url"], "http://p1");
        assert_eq!(json[0]["status"], "ready");
        assert_eq!(json[0]["hostname"], "voron");
    }

    #[tokio::test]
    async fn printer_states_marks_unreachable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, _) = app(dir.path(), FixedPrinter(None));

        let request = Request::builder()
            .uri("/printer_states")
            .body(Body::empty())
            .expect("request");
        let json = json_body(app.oneshot(request).await.expect("response")).await;

        assert_eq!(json[0]["status"], "unreachable");
    }

    #[tokio::test]
    async fn queue_lists_pending_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (app, store) = app(dir.path(), FixedPrinter(None));
        store.store_bytes("a.gcode", b"G28").await.expect("store");
        store.store_bytes("b.gcode", b"G28").await.expect("store");

        let request = Request::builder()
            .uri("/queue")
            .body(Body::empty())
            .expect("request");
        let json = json_body(app.oneshot(request).await.expect("response")).await;

        assert_eq!(json[0]["file_name"], "a.gcode");
        assert_eq!(json[1]["file_name"], "b.gcode");
        assert_eq!(json[1]["send_attempts"], 0);
    }

    #[tokio::test]
    async fn server_accepts_uploads_until_stopped() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = UploadStore::new(dir.path(), Arc::new(PendingFileQueue::new()));
        let mut server = IntakeServer::new(
            ([127, 0, 0, 1], 0).into(),
            store.clone(),
            FixedPrinter(None),
            Arc::new(Vec::new()),
        );

        let addr = server.start().await.expect("start");
        assert_eq!(server.status(), ServerStatus::Running);

        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(b"G28".to_vec()).file_name("cube.gcode"),
        );
        let response = reqwest::Client::new()
            .post(format!("http://{addr}{UPLOAD_ROUTE}"))
            .multipart(form)
            .send()
            .await
            .expect("upload");
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(store.queue().len(), 1);
        drop(response);

        server.stop().await.expect("stop");
        assert_eq!(server.status(), ServerStatus::Stopped);

        let after = reqwest::Client::new()
            .post(format!("http://{addr}{UPLOAD_ROUTE}"))
            .send()
            .await;
        assert!(after.is_err());
    }
}
