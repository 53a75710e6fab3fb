// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Async HTTP client for Klipper/Moonraker style printer controllers.
//
// Two calls only:
//   - status  `GET  {base}/printer/info`          -> `result.state`
//   - upload  `POST {base}/server/files/upload`   multipart, part `file`
//
// The client is stateless and never retries; what to do after a failure is
// up to the coordinator.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, RequestBuilder};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use printfarm_core::error::{PrintFarmError, Result};
use printfarm_core::types::{PendingFile, PrinterEndpoint, PrinterState, PrinterStatus};

/// Header carrying the printer API key (OctoPrint and Moonraker both accept it).
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Multipart part name the printer expects the file under.
const FILE_PART: &str = "file";

/// Default timeout for a complete upload.
const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Operations the coordinator needs from a printer.
///
/// `PrinterClient` is the network implementation; tests substitute scripted
/// printers.
pub trait PrinterApi: Send + Sync {
    /// Poll the printer once and classify its state.
    fn get_status(
        &self,
        endpoint: &PrinterEndpoint,
    ) -> impl Future<Output = Result<PrinterState>> + Send;

    /// Transfer a stored file to the printer.
    fn send_file(
        &self,
        endpoint: &PrinterEndpoint,
        file: &PendingFile,
    ) -> impl Future<Output = Result<()>> + Send;
}

impl<T: PrinterApi> PrinterApi for Arc<T> {
    fn get_status(
        &self,
        endpoint: &PrinterEndpoint,
    ) -> impl Future<Output = Result<PrinterState>> + Send {
        (**self).get_status(endpoint)
    }

    fn send_file(
        &self,
        endpoint: &PrinterEndpoint,
        file: &PendingFile,
    ) -> impl Future<Output = Result<()>> + Send {
        (**self).send_file(endpoint, file)
    }
}

/// `result` envelope of the status response.
#[derive(Debug, Deserialize)]
struct PrinterInfoResponse {
    result: PrinterInfo,
}

/// The fields of `result` we use.  Everything else is ignored.
#[derive(Debug, Deserialize)]
struct PrinterInfo {
    state: String,
    #[serde(default)]
    state_message: Option<String>,
    #[serde(default)]
    hostname: Option<String>,
}

/// HTTP implementation of [`PrinterApi`].  Cheap to clone.
#[derive(Debug, Clone)]
pub struct PrinterClient {
    http: Client,
    request_timeout: Duration,
    upload_timeout: Duration,
    start_print: bool,
}

impl PrinterClient {
    /// Build a client whose status calls time out after `request_timeout`.
    ///
    /// Connection setup is bounded by the same timeout for uploads too.
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(request_timeout)
            .user_agent(concat!("printfarm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PrintFarmError::ConfigInvalid(format!("HTTP client: {e}")))?;

        Ok(Self {
            http,
            request_timeout,
            upload_timeout: DEFAULT_UPLOAD_TIMEOUT,
            start_print: false,
        })
    }

    /// Bound a whole upload (connect, body and response) by `timeout`.
    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Ask the printer to start the job as soon as the upload lands
    /// (Moonraker's `print=true` form field).
    pub fn with_start_print(mut self, start_print: bool) -> Self {
        self.start_print = start_print;
        self
    }

    fn authorize(builder: RequestBuilder, endpoint: &PrinterEndpoint) -> RequestBuilder {
        match endpoint.api_key.as_deref() {
            Some(key) => builder.header(API_KEY_HEADER, key),
            None => builder,
        }
    }
}

impl PrinterApi for PrinterClient {
    #[instrument(skip(self, endpoint), fields(uri = %endpoint.base_url))]
    async fn get_status(&self, endpoint: &PrinterEndpoint) -> Result<PrinterState> {
        let url = endpoint.status_url();
        debug!(url = %url, "querying printer status");

        let request = Self::authorize(self.http.get(&url), endpoint).timeout(self.request_timeout);
        let response = request
            .send()
            .await
            .map_err(|e| PrintFarmError::Unreachable(format!("GET {url}: {e}")))?;

        let code = response.status();
        if !code.is_success() {
            warn!(status = code.as_u16(), "status query rejected");
            return Err(PrintFarmError::BadStatus(code.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PrintFarmError::Unreachable(format!("read body of {url}: {e}")))?;

        let info: PrinterInfoResponse = serde_json::from_slice(&body)
            .map_err(|e| PrintFarmError::MalformedResponse(format!("{url}: {e}")))?;

        let status = PrinterStatus::from_vendor_state(&info.result.state);
        debug!(state = %info.result.state, status = ?status, "printer status received");

        Ok(PrinterState {
            endpoint: endpoint.clone(),
            status,
            hostname: info.result.hostname,
            raw_message: info.result.state_message.unwrap_or(info.result.state),
        })
    }

    #[instrument(
        skip(self, endpoint, file),
        fields(uri = %endpoint.base_url, file = %file.file_name)
    )]
    async fn send_file(&self, endpoint: &PrinterEndpoint, file: &PendingFile) -> Result<()> {
        let handle = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| PrintFarmError::OpenFailed(format!("{}: {e}", file.path.display())))?;
        let length = handle
            .metadata()
            .await
            .map_err(|e| PrintFarmError::OpenFailed(format!("{}: {e}", file.path.display())))?
            .len();

        // Streamed straight from disk; the file is never held in memory whole.
        let body = Body::wrap_stream(ReaderStream::new(handle));
        let part = Part::stream_with_length(body, length)
            .file_name(file.file_name.clone())
            .mime_str("application/octet-stream")
            .map_err(|e| PrintFarmError::TransferFailed(format!("multipart part: {e}")))?;

        let mut form = Form::new().part(FILE_PART, part);
        if self.start_print {
            form = form.text("print", "true");
        }

        let url = endpoint.upload_url();
        info!(url = %url, bytes = length, "uploading file to printer");

        let request = Self::authorize(self.http.post(&url), endpoint)
            .multipart(form)
            .timeout(self.upload_timeout);
        let response = request
            .send()
            .await
            .map_err(|e| PrintFarmError::TransferFailed(format!("POST {url}: {e}")))?;

        let code = response.status();
        if !code.is_success() {
            warn!(status = code.as_u16(), "printer rejected upload");
            return Err(PrintFarmError::RejectedByPrinter(code.as_u16()));
        }

        debug!(status = code.as_u16(), "upload accepted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use axum::Router;
    use axum::extract::{Multipart, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};

    use printfarm_core::error::ErrorKind;

    use super::*;

    /// What the mock printer saw on its upload endpoint.
    #[derive(Debug, Default, Clone)]
    struct Received {
        file_name: Option<String>,
        bytes: Vec<u8>,
        api_key: Option<String>,
        print_field: Option<String>,
    }

    #[derive(Clone)]
    struct MockPrinter {
        status_body: Arc<Mutex<(StatusCode, String)>>,
        upload_status: Arc<Mutex<StatusCode>>,
        received: Arc<Mutex<Vec<Received>>>,
        /// `X-Api-Key` of each status request, in arrival order.
        status_keys: Arc<Mutex<Vec<Option<String>>>>,
    }

    impl MockPrinter {
        fn new(state: &str) -> Self {
            Self {
                status_body: Arc::new(Mutex::new((StatusCode::OK, info_body(state)))),
                upload_status: Arc::new(Mutex::new(StatusCode::CREATED)),
                received: Arc::new(Mutex::new(Vec::new())),
                status_keys: Arc::new(Mutex::new(Vec::new())),
            }
        }

        async fn serve(self) -> SocketAddr {
            let app = Router::new()
                .route("/printer/info", get(mock_info))
                .route("/server/files/upload", post(mock_upload))
                .with_state(self);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let addr = listener.local_addr().expect("addr");
            tokio::spawn(async move {
                axum::serve(listener, app).await.expect("serve");
            });
            addr
        }
    }

    fn info_body(state: &str) -> String {
        serde_json::json!({
            "result": {
                "state": state,
                "state_message": format!("Printer is {state}"),
                "hostname": "voron",
                "software_version": "v0.12.0"
            }
        })
        .to_string()
    }

    fn api_key(headers: &HeaderMap) -> Option<String> {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    }

    async fn mock_info(
        State(mock): State<MockPrinter>,
        headers: HeaderMap,
    ) -> (StatusCode, String) {
        mock.status_keys.lock().expect("lock").push(api_key(&headers));
        mock.status_body.lock().expect("lock").clone()
    }

    async fn mock_upload(
        State(mock): State<MockPrinter>,
        headers: HeaderMap,
        mut multipart: Multipart,
    ) -> StatusCode {
        let mut received = Received {
            api_key: api_key(&headers),
            ..Default::default()
        };
        while let Some(field) = multipart.next_field().await.expect("field") {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("file") => {
                    received.file_name = field.file_name().map(String::from);
                    received.bytes = field.bytes().await.expect("bytes").to_vec();
                }
                Some("print") => {
                    received.print_field = Some(field.text().await.expect("text"));
                }
                _ => {}
            }
        }
        mock.received.lock().expect("lock").push(received);
        *mock.upload_status.lock().expect("lock")
    }

    fn endpoint(addr: SocketAddr) -> PrinterEndpoint {
        PrinterEndpoint::parse(&format!("http://{addr}")).expect("endpoint")
    }

    fn client() -> PrinterClient {
        PrinterClient::new(Duration::from_secs(5)).expect("client")
    }

    fn gcode_file(dir: &std::path::Path, contents: &[u8]) -> PendingFile {
        let path = dir.join("job.gcode");
        std::fs::write(&path, contents).expect("write");
        PendingFile::new(path, "job.gcode".into(), contents.len() as u64)
    }

    #[tokio::test]
    async fn ready_printer_is_classified_ready() {
        let addr = MockPrinter::new("ready").serve().await;
        let state = client().get_status(&endpoint(addr)).await.expect("status");

        assert_eq!(state.status, PrinterStatus::Ready);
        assert_eq!(state.hostname.as_deref(), Some("voron"));
        assert_eq!(state.raw_message, "Printer is ready");
    }

    #[tokio::test]
    async fn other_tokens_are_not_ready() {
        let addr = MockPrinter::new("startup").serve().await;
        let state = client().get_status(&endpoint(addr)).await.expect("status");
        assert_eq!(state.status, PrinterStatus::Busy);
    }

    #[tokio::test]
    async fn non_success_status_is_bad_status() {
        let mock = MockPrinter::new("ready");
        *mock.status_body.lock().expect("lock") =
            (StatusCode::SERVICE_UNAVAILABLE, "klippy down".into());
        let addr = mock.serve().await;

        let err = client().get_status(&endpoint(addr)).await.expect_err("should fail");
        assert!(matches!(err, PrintFarmError::BadStatus(503)));
    }

    #[tokio::test]
    async fn missing_state_is_malformed() {
        let mock = MockPrinter::new("ready");
        *mock.status_body.lock().expect("lock") =
            (StatusCode::OK, r#"{"result": {"hostname": "voron"}}"#.into());
        let addr = mock.serve().await;

        let err = client().get_status(&endpoint(addr)).await.expect_err("should fail");
        assert!(matches!(err, PrintFarmError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let err = client().get_status(&endpoint(addr)).await.expect_err("should fail");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn silent_printer_times_out_as_unreachable() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = PrinterClient::new(Duration::from_millis(300)).expect("client");
        let err = client.get_status(&endpoint(addr)).await.expect_err("should time out");
        assert_eq!(err.kind(), ErrorKind::Unreachable);
    }

    #[tokio::test]
    async fn status_request_carries_api_key() {
        let mock = MockPrinter::new("ready");
        let keys = Arc::clone(&mock.status_keys);
        let addr = mock.serve().await;

        client()
            .get_status(&endpoint(addr).with_api_key("secret"))
            .await
            .expect("status");
        client().get_status(&endpoint(addr)).await.expect("status");

        let keys = keys.lock().expect("lock");
        assert_eq!(*keys, vec![Some("secret".to_string()), None]);
    }

    #[tokio::test]
    async fn stalled_upload_times_out_as_transfer_failed() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        let dir = tempfile::tempdir().expect("tempdir");
        let file = gcode_file(dir.path(), b"G28\n");

        let err = client()
            .with_upload_timeout(Duration::from_millis(300))
            .send_file(&endpoint(addr), &file)
            .await
            .expect_err("should time out");
        assert!(matches!(err, PrintFarmError::TransferFailed(_)));
    }

    #[tokio::test]
    async fn send_file_streams_multipart_with_api_key() {
        let mock = MockPrinter::new("ready");
        let received = Arc::clone(&mock.received);
        let addr = mock.serve().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let file = gcode_file(dir.path(), b"G28\nG1 X10\n");

        let endpoint = endpoint(addr).with_api_key("secret");
        client()
            .with_start_print(true)
            .send_file(&endpoint, &file)
            .await
            .expect("send");

        let received = received.lock().expect("lock");
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].file_name.as_deref(), Some("job.gcode"));
        assert_eq!(received[0].bytes, b"G28\nG1 X10\n");
        assert_eq!(received[0].api_key.as_deref(), Some("secret"));
        assert_eq!(received[0].print_field.as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn no_api_key_header_without_credential() {
        let mock = MockPrinter::new("ready");
        let received = Arc::clone(&mock.received);
        let addr = mock.serve().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let file = gcode_file(dir.path(), b"G28\n");

        client().send_file(&endpoint(addr), &file).await.expect("send");

        let received = received.lock().expect("lock");
        assert!(received[0].api_key.is_none());
        assert!(received[0].print_field.is_none());
    }

    #[tokio::test]
    async fn rejected_upload_reports_code() {
        let mock = MockPrinter::new("ready");
        *mock.upload_status.lock().expect("lock") = StatusCode::CONFLICT;
        let addr = mock.serve().await;
        let dir = tempfile::tempdir().expect("tempdir");
        let file = gcode_file(dir.path(), b"G28\n");

        let err = client().send_file(&endpoint(addr), &file).await.expect_err("rejected");
        assert!(matches!(err, PrintFarmError::RejectedByPrinter(409)));
    }

    #[tokio::test]
    async fn missing_file_is_open_failed() {
        let addr = MockPrinter::new("ready").serve().await;
        let file = PendingFile::new("/nonexistent/job.gcode".into(), "job.gcode".into(), 0);

        let err = client().send_file(&endpoint(addr), &file).await.expect_err("missing");
        assert!(matches!(err, PrintFarmError::OpenFailed(_)));
    }
}
