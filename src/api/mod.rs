use crate::config::{PipelineConfig, DEFAULT_HTTP_ADDR, DEFAULT_SOURCE_URI};
use crate::detect::SharedDetector;
use crate::pipeline::{CancelToken, FrameStream, InferenceStats, MULTIPART_CONTENT_TYPE};
use crate::telemetry::EventHub;
use crate::telemetry::TelemetryEmitter;
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const MAX_REQUEST_BYTES: usize = 8192;
const SSE_BUFFER: usize = 64;
const SSE_POLL: Duration = Duration::from_millis(250);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

const INDEX_PAGE: &str = "<!doctype html>\n<html><head><title>roadwatch</title></head>\n<body>\n<h1>roadwatch</h1>\n<img src=\"/video_feed\" alt=\"live detections\">\n<p>Telemetry: <a href=\"/events\">/events</a> &middot; Counters: <a href=\"/stats\">/stats</a></p>\n</body></html>\n";

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Source opened by every `/video_feed` request.
    pub source_uri: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_HTTP_ADDR.to_string(),
            source_uri: DEFAULT_SOURCE_URI.to_string(),
        }
    }
}

/// Everything request handlers share: the pipeline template (including the
/// live rate control), the detector, and the telemetry side channel.
#[derive(Clone)]
pub struct ApiState {
    pub pipeline: PipelineConfig,
    pub detector: SharedDetector,
    pub telemetry: TelemetryEmitter,
    pub hub: EventHub,
    stats: Arc<InferenceStats>,
    active_streams: Arc<AtomicUsize>,
}

impl ApiState {
    pub fn new(
        pipeline: PipelineConfig,
        detector: SharedDetector,
        telemetry: TelemetryEmitter,
        hub: EventHub,
    ) -> Self {
        Self {
            pipeline,
            detector,
            telemetry,
            hub,
            stats: Arc::new(InferenceStats::new()),
            active_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Inference counters summed over every stream served so far.
    pub fn stats(&self) -> Arc<InferenceStats> {
        self.stats.clone()
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    /// Stop accepting, cancel open streams and wait for their threads.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid http address {:?}", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let cfg = self.cfg;
        let state = self.state;
        let join = std::thread::Builder::new()
            .name("http-accept".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, cfg, state, shutdown_thread) {
                    log::error!("http api stopped: {}", err);
                }
            })
            .context("spawn http accept thread")?;

        log::info!("http api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

/// A long-lived response running on its own thread.
struct Streaming {
    cancel: CancelToken,
    join: JoinHandle<()>,
}

fn run_api(
    listener: TcpListener,
    cfg: ApiConfig,
    state: ApiState,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let mut streaming: Vec<Streaming> = Vec::new();
    let outcome = loop {
        if shutdown.load(Ordering::SeqCst) {
            break Ok(());
        }
        streaming.retain(|s| !s.join.is_finished());
        match listener.accept() {
            Ok((stream, _)) => match handle_connection(stream, &cfg, &state) {
                Ok(Some(spawned)) => streaming.push(spawned),
                Ok(None) => {}
                Err(err) => log::warn!("http request rejected: {}", err),
            },
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => break Err(err.into()),
        }
    };

    for s in &streaming {
        s.cancel.cancel();
    }
    for s in streaming {
        if s.join.join().is_err() {
            log::warn!("http streaming thread panicked");
        }
    }
    outcome
}

fn handle_connection(
    mut stream: TcpStream,
    cfg: &ApiConfig,
    state: &ApiState,
) -> Result<Option<Streaming>> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(None);
    }

    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, &json!({"error": "bad_request"}))?;
            return Err(err);
        }
    };
    log::debug!("{} {} from {}", request.method, request.path, peer);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/") => {
            write_response(&mut stream, 200, "text/html; charset=utf-8", INDEX_PAGE.as_bytes())?;
        }
        ("GET", "/health") => {
            let body = json!({
                "status": "ok",
                "target_fps": state.pipeline.rate.get(),
                "active_streams": state.active_streams(),
            });
            write_json_response(&mut stream, 200, &body)?;
        }
        ("GET", "/stats") => {
            let body = json!({
                "inference": state.stats.snapshot(),
                "telemetry": state.telemetry.stats(),
                "target_fps": state.pipeline.rate.get(),
                "active_streams": state.active_streams(),
            });
            write_json_response(&mut stream, 200, &body)?;
        }
        ("POST", "/set_fps") => set_fps(&mut stream, &request, state)?,
        ("GET", "/video_feed") => return spawn_video_feed(stream, cfg, state).map(Some),
        ("GET", "/events") => return spawn_event_stream(stream, state).map(Some),
        (_, "/" | "/health" | "/stats" | "/set_fps" | "/video_feed" | "/events") => {
            write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"}))?;
        }
        _ => {
            write_json_response(&mut stream, 404, &json!({"error": "not_found"}))?;
        }
    }
    Ok(None)
}

fn set_fps(stream: &mut TcpStream, request: &HttpRequest, state: &ApiState) -> Result<()> {
    let outcome = requested_fps(&request.body)
        .ok_or_else(|| "fps must be an integer".to_string())
        .and_then(|fps| state.pipeline.rate.set(fps).map_err(|e| e.to_string()));
    match outcome {
        Ok(fps) => {
            log::info!("target fps set to {}", fps);
            write_json_response(stream, 200, &json!({"success": true, "fps": fps}))
        }
        Err(reason) => {
            log::warn!("rejected fps update: {}", reason);
            write_json_response(
                stream,
                400,
                &json!({"success": false, "error": "Invalid FPS"}),
            )
        }
    }
}

/// `{"fps": 12}` or `{"fps": "12"}`.
fn requested_fps(body: &[u8]) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    match value.get("fps")? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Decrements the active-stream gauge when a streaming response ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_video_feed(mut stream: TcpStream, cfg: &ApiConfig, state: &ApiState) -> Result<Streaming> {
    let cancel = CancelToken::new();
    let mut frames = FrameStream::new(
        state.detector.clone(),
        state.pipeline.clone(),
        state.telemetry.clone(),
    )
    .with_parent_stats(state.stats.clone())
    .with_cancel(cancel.clone());

    if let Err(err) = frames.start(&cfg.source_uri) {
        write_json_response(
            &mut stream,
            503,
            &json!({"error": "source_unavailable", "detail": err.to_string()}),
        )?;
        return Err(err.into());
    }

    let guard = ActiveGuard::enter(&state.active_streams);
    let thread_cancel = cancel.clone();
    let join = std::thread::Builder::new()
        .name("video-feed".into())
        .spawn(move || {
            let _guard = guard;
            if let Err(err) = stream_frames(&mut stream, &mut frames) {
                log::info!("video feed client gone: {}", err);
            }
            thread_cancel.cancel();
        })
        .context("spawn video feed thread")?;
    Ok(Streaming { cancel, join })
}

fn stream_frames(stream: &mut TcpStream, frames: &mut FrameStream) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    write_stream_head(stream, MULTIPART_CONTENT_TYPE)?;
    for chunk in frames {
        stream.write_all(&chunk)?;
        stream.flush()?;
    }
    Ok(())
}

fn spawn_event_stream(stream: TcpStream, state: &ApiState) -> Result<Streaming> {
    let cancel = CancelToken::new();
    let thread_cancel = cancel.clone();
    let events = state.hub.subscribe(SSE_BUFFER);
    let join = std::thread::Builder::new()
        .name("event-stream".into())
        .spawn(move || {
            let mut stream = stream;
            if let Err(err) = stream_events(&mut stream, &events, &thread_cancel) {
                log::debug!("event stream client gone: {}", err);
            }
            thread_cancel.cancel();
        })
        .context("spawn event stream thread")?;
    Ok(Streaming { cancel, join })
}

fn stream_events(
    stream: &mut TcpStream,
    events: &Receiver<String>,
    cancel: &CancelToken,
) -> Result<()> {
    stream.set_write_timeout(Some(WRITE_TIMEOUT))?;
    write_stream_head(stream, "text/event-stream")?;
    while !cancel.is_cancelled() {
        match events.recv_timeout(SSE_POLL) {
            Ok(frame) => {
                stream.write_all(frame.as_bytes())?;
                stream.flush()?;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let head_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..head_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_REQUEST_BYTES.saturating_sub(head_end + 4) {
        return Err(anyhow!("request too large"));
    }
    let mut body = data.split_off(head_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    write_response(stream, status, "application/json", body.to_string().as_bytes())
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

/// Head of an open-ended response; the body runs until the connection closes.
fn write_stream_head(stream: &mut TcpStream, content_type: &str) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(200),
        content_type = content_type,
    );
    stream.write_all(header.as_bytes())?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fps_body_accepts_numbers_and_numeric_strings() {
        assert_eq!(requested_fps(br#"{"fps": 12}"#), Some(12));
        assert_eq!(requested_fps(br#"{"fps": " 7 "}"#), Some(7));
        assert_eq!(requested_fps(br#"{"fps": -3}"#), Some(-3));
        assert_eq!(requested_fps(br#"{"fps": 2.5}"#), None);
        assert_eq!(requested_fps(br#"{"fps": "fast"}"#), None);
        assert_eq!(requested_fps(br#"{"rate": 10}"#), None);
        assert_eq!(requested_fps(b"not json"), None);
    }

    #[test]
    fn unknown_status_codes_map_to_500() {
        assert_eq!(status_line(418), "HTTP/1.1 500 Internal Server Error");
        assert_eq!(status_line(405), "HTTP/1.1 405 Method Not Allowed");
    }
}
