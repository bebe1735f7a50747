use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::{Duration, Instant};

use roadwatch::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use roadwatch::detect::{share_detector, BoundingBox, Detection, ScriptedBackend};
use roadwatch::telemetry::EventHub;
use roadwatch::{PipelineConfig, RateControl, TelemetryPublisher};

const SOURCE: &str = "stub://road?width=48&height=32&fps=0";

struct TestApi {
    api_handle: Option<ApiHandle>,
    publisher: Option<TelemetryPublisher>,
}

impl TestApi {
    fn new(source_uri: &str) -> Result<Self> {
        let hub = EventHub::new();
        let publisher = TelemetryPublisher::spawn(hub.clone(), 64)?;
        let pipeline = PipelineConfig {
            rate: RateControl::new(30)?,
            input_width: 48,
            input_height: 32,
            ..PipelineConfig::default()
        };
        let detection = Detection::new(BoundingBox::new(2.0, 2.0, 20.0, 16.0), 1, 0.8);
        let detector = share_detector(Box::new(ScriptedBackend::new(vec![detection])));
        let state = ApiState::new(pipeline, detector, publisher.emitter(), hub);

        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            source_uri: source_uri.to_string(),
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            api_handle: Some(api_handle),
            publisher: Some(publisher),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(self.handle().addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        Ok(stream)
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<(String, String)> {
        let mut stream = self.connect()?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }

    fn get_json(&self, path: &str) -> Result<Value> {
        let (headers, body) = self.request("GET", path, None)?;
        assert!(headers.contains("200 OK"), "{}", headers);
        Ok(serde_json::from_str(&body)?)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
        if let Some(publisher) = self.publisher.take() {
            publisher.stop();
        }
    }
}

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut response = String::new();
    stream.read_to_string(&mut response)?;
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

/// Read an open-ended response until `done` accepts what has arrived.
fn read_until(stream: &mut TcpStream, done: impl Fn(&[u8]) -> bool) -> Result<Vec<u8>> {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    while !done(&data) {
        if Instant::now() > deadline {
            return Err(anyhow!("timed out after {} bytes", data.len()));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed after {} bytes", data.len()));
        }
        data.extend_from_slice(&buf[..n]);
    }
    Ok(data)
}

fn count(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

fn wait_for(mut condition: impl FnMut() -> Result<bool>) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition()? {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    Err(anyhow!("condition not reached in time"))
}

#[test]
fn health_reports_rate_and_streams() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let health = api.get_json("/health")?;
    assert_eq!(health["status"], "ok");
    assert_eq!(health["target_fps"], 30);
    assert_eq!(health["active_streams"], 0);
    Ok(())
}

#[test]
fn index_page_embeds_the_feed() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let (headers, body) = api.request("GET", "/", None)?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("text/html"));
    assert!(body.contains("/video_feed"));
    Ok(())
}

#[test]
fn set_fps_accepts_positive_integers() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let (headers, body) = api.request("POST", "/set_fps", Some(r#"{"fps": 12}"#))?;
    assert!(headers.contains("200 OK"), "{}", headers);
    let reply: Value = serde_json::from_str(&body)?;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["fps"], 12);

    assert_eq!(api.get_json("/health")?["target_fps"], 12);
    Ok(())
}

#[test]
fn set_fps_rejects_invalid_values_without_changing_rate() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    for body in [
        r#"{"fps": 0}"#,
        r#"{"fps": -5}"#,
        r#"{"fps": "abc"}"#,
        r#"{"fps": 99999999999}"#,
        r#"{}"#,
        "not json",
    ] {
        let (headers, reply) = api.request("POST", "/set_fps", Some(body))?;
        assert!(headers.contains("400 Bad Request"), "{}: {}", body, headers);
        let reply: Value = serde_json::from_str(&reply)?;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error"], "Invalid FPS");
    }
    assert_eq!(api.get_json("/health")?["target_fps"], 30);
    Ok(())
}

#[test]
fn unknown_paths_and_wrong_methods_are_rejected() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let (headers, _) = api.request("GET", "/upload", None)?;
    assert!(headers.contains("404 Not Found"));
    let (headers, _) = api.request("GET", "/set_fps", None)?;
    assert!(headers.contains("405 Method Not Allowed"));
    let (headers, _) = api.request("POST", "/video_feed", Some("{}"))?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn oversized_request_is_rejected() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let mut stream = api.connect()?;
    let padding = "x".repeat(8300);
    let request = format!("GET /health HTTP/1.1\r\nX-Padding: {}\r\n\r\n", padding);
    stream.write_all(request.as_bytes())?;
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("400 Bad Request"));

    let mut stream = api.connect()?;
    stream.write_all(
        b"POST /set_fps HTTP/1.1\r\nHost: localhost\r\nContent-Length: 18446744073709551615\r\n\r\n{}",
    )?;
    let started = Instant::now();
    let (headers, _) = read_response(&mut stream)?;
    assert!(headers.contains("400 Bad Request"), "{}", headers);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(api.get_json("/health")?["status"], "ok");
    Ok(())
}

#[test]
fn video_feed_streams_multipart_jpegs() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let mut stream = api.connect()?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let data = read_until(&mut stream, |d| count(d, b"--frame\r\n") >= 3)?;
    let text = String::from_utf8_lossy(&data);
    assert!(text.starts_with("HTTP/1.1 200 OK"));
    assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
    assert!(count(&data, &[0xFF, 0xD8, 0xFF]) >= 2);

    assert_eq!(api.get_json("/health")?["active_streams"], 1);
    let stats = api.get_json("/stats")?;
    assert!(stats["inference"]["submitted"].as_u64().unwrap_or(0) >= 2);

    drop(stream);
    wait_for(|| Ok(api.get_json("/health")?["active_streams"] == 0))?;
    Ok(())
}

#[test]
fn video_feed_reports_missing_source() -> Result<()> {
    let api = TestApi::new("/definitely/not/here.mp4")?;
    let (headers, body) = api.request("GET", "/video_feed", None)?;
    assert!(headers.contains("503 Service Unavailable"), "{}", headers);
    let reply: Value = serde_json::from_str(&body)?;
    assert_eq!(reply["error"], "source_unavailable");
    assert_eq!(api.get_json("/health")?["active_streams"], 0);
    Ok(())
}

#[test]
fn events_stream_carries_detection_telemetry() -> Result<()> {
    let api = TestApi::new(SOURCE)?;
    let mut events = api.connect()?;
    events.write_all(b"GET /events HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let head = read_until(&mut events, |d| d.windows(4).any(|w| w == b"\r\n\r\n"))?;
    assert!(String::from_utf8_lossy(&head).contains("text/event-stream"));

    let mut feed = api.connect()?;
    feed.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let data = read_until(&mut events, |d| {
        let text = String::from_utf8_lossy(d);
        text.contains("event: confidence\n") && text.contains("crack detected (0.80)")
    })?;
    let text = String::from_utf8_lossy(&data);
    assert!(text.contains("event: log_update\ndata: {\"message\":\"crack detected (0.80)\"}\n\n"));
    assert!(text.contains("\"confidence\":0.8"));
    Ok(())
}
