//! Actix Web server publishing every camera stream.
//!
//! The server runs on a dedicated thread with its own runtime so the
//! detection hot path never touches async code. Handlers only read the
//! [`StreamHub`]; a slow client skips frames instead of queueing them.
//!
//! Routes:
//! - `/` HTML index of the streams
//! - `/streams` JSON summary of every stream
//! - `/metrics` Prometheus exposition
//! - `/{stream}/stream.mjpg` multipart JPEG feed
//! - `/{stream}/frame.jpg` latest JPEG
//! - `/{stream}/detections` latest detections as JSON

use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{self, Bytes},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Serialize;
use tokio::{
    sync::oneshot,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, error, info};

use crate::vision::{
    config::StreamOptions,
    data::{DetectionsResponse, FramePacket},
    shutdown::ShutdownToken,
    stream::StreamHub,
    telemetry,
};

/// Shared state backing HTTP handlers.
struct ServerState {
    hub: Arc<StreamHub>,
    frame_interval: Duration,
    shutdown: ShutdownToken,
}

/// Handle for the server thread.
pub(crate) struct StreamServer {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Bind `options.bind` and start serving on a new thread.
    pub(crate) fn start(
        hub: Arc<StreamHub>,
        options: &StreamOptions,
        shutdown: ShutdownToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(options.bind)
            .with_context(|| format!("Failed to bind stream server to {}", options.bind))?;
        let local_addr = listener.local_addr().context("Failed to read bound address")?;
        let frame_interval = Duration::from_secs_f64(1.0 / f64::from(options.fps.max(1)));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = telemetry::spawn_thread("vision-stream-server", move || {
            let result = actix_web::rt::System::new().block_on(async move {
                let server = HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(ServerState {
                            hub: hub.clone(),
                            frame_interval,
                            shutdown: shutdown.clone(),
                        }))
                        .route("/", web::get().to(index_route))
                        .route("/streams", web::get().to(streams_route))
                        .route("/metrics", web::get().to(metrics_route))
                        .route("/{stream}/stream.mjpg", web::get().to(stream_handler))
                        .route("/{stream}/frame.jpg", web::get().to(frame_handler))
                        .route("/{stream}/detections", web::get().to(detections_handler))
                })
                .workers(2)
                .disable_signals()
                .shutdown_timeout(1)
                .listen(listener)?
                .run();

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(false).await;
                });

                server.await
            });
            if let Err(err) = result {
                error!("HTTP server error: {err}");
            }
        })
        .context("Failed to spawn stream server thread")?;

        info!(addr = %local_addr, "Stream server listening");
        Ok(Self {
            local_addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections, drop attached clients and join the thread.
    pub(crate) fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Stream server thread panicked");
            }
        }
        info!(addr = %self.local_addr, "Stream server stopped");
    }
}

#[derive(Serialize)]
struct StreamSummary<'a> {
    name: &'a str,
    frame_number: Option<u64>,
    timestamp_ms: Option<i64>,
    fps: Option<f32>,
    detections: usize,
}

fn unknown_stream(stream: &str) -> HttpResponse {
    HttpResponse::NotFound().body(format!("unknown stream {stream:?}"))
}

/// Multipart chunk carrying one JPEG.
fn mjpeg_part(packet: &FramePacket) -> Bytes {
    let mut payload = Vec::with_capacity(packet.jpeg.len() + 128);
    payload.extend_from_slice(b"--frame\r\n");
    payload.extend_from_slice(b"Content-Type: image/jpeg\r\n");
    payload.extend_from_slice(format!("Content-Length: {}\r\n", packet.jpeg.len()).as_bytes());
    payload.extend_from_slice(format!("X-Sequence: {}\r\n\r\n", packet.frame_number).as_bytes());
    payload.extend_from_slice(&packet.jpeg);
    payload.extend_from_slice(b"\r\n");
    Bytes::from(payload)
}

/// Decrements the client gauge when a stream response is dropped.
struct ClientGuard {
    stream: String,
}

impl ClientGuard {
    fn attach(stream: &str) -> Self {
        metrics::gauge!("vision_stream_clients", "stream" => stream.to_string()).increment(1.0);
        debug!(stream, "stream client attached");
        Self {
            stream: stream.to_string(),
        }
    }
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        metrics::gauge!("vision_stream_clients", "stream" => self.stream.clone()).decrement(1.0);
        debug!(stream = %self.stream, "stream client detached");
    }
}

/// Stream the MJPEG feed, pacing at the configured rate and skipping
/// repeats of a frame the client already has.
async fn stream_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let name = path.into_inner();
    if !state.hub.contains(&name) {
        return unknown_stream(&name);
    }
    let state = state.clone();
    let body = stream! {
        let _client = ClientGuard::attach(&name);
        let mut ticker = interval(state.frame_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_sent: Option<u64> = None;
        loop {
            ticker.tick().await;
            if state.shutdown.is_requested() {
                break;
            }
            let Some(packet) = state.hub.latest(&name) else {
                continue;
            };
            if last_sent == Some(packet.frame_number) {
                continue;
            }
            last_sent = Some(packet.frame_number);
            yield Ok::<Bytes, actix_web::Error>(mjpeg_part(&packet));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .append_header((header::CACHE_CONTROL, "no-cache"))
        .append_header((header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame"))
        .streaming(body)
}

async fn frame_handler(path: web::Path<String>, state: web::Data<ServerState>) -> HttpResponse {
    let name = path.into_inner();
    if !state.hub.contains(&name) {
        return unknown_stream(&name);
    }
    match state.hub.latest(&name) {
        Some(packet) => HttpResponse::Ok()
            .content_type("image/jpeg")
            .append_header(("X-Sequence", packet.frame_number.to_string()))
            .body(packet.jpeg),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn detections_handler(
    path: web::Path<String>,
    state: web::Data<ServerState>,
) -> HttpResponse {
    let name = path.into_inner();
    if !state.hub.contains(&name) {
        return unknown_stream(&name);
    }
    match state.hub.latest(&name) {
        Some(packet) => HttpResponse::Ok().json(DetectionsResponse {
            stream: &name,
            timestamp_ms: packet.timestamp_ms,
            frame_number: packet.frame_number,
            fps: packet.fps,
            detections: &packet.detections,
        }),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn streams_route(state: web::Data<ServerState>) -> HttpResponse {
    let latest: Vec<(Arc<str>, Option<FramePacket>)> = state
        .hub
        .names()
        .map(|name| (name.clone(), state.hub.latest(name)))
        .collect();
    let summaries: Vec<StreamSummary<'_>> = latest
        .iter()
        .map(|(name, packet)| StreamSummary {
            name,
            frame_number: packet.as_ref().map(|p| p.frame_number),
            timestamp_ms: packet.as_ref().map(|p| p.timestamp_ms),
            fps: packet.as_ref().map(|p| p.fps),
            detections: packet.as_ref().map_or(0, |p| p.detections.len()),
        })
        .collect();
    HttpResponse::Ok().json(summaries)
}

async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::NotFound().body("metrics recorder not installed"),
    }
}

async fn index_route(state: web::Data<ServerState>) -> HttpResponse {
    let mut html = String::from(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Vision streams</title>\
         <style>body{background:#111;color:#eee;font-family:monospace}\
         figure{display:inline-block;margin:8px}img{max-width:640px;border:1px solid #444}</style>\
         </head><body><h1>Vision streams</h1>",
    );
    for name in state.hub.names() {
        html.push_str(&format!(
            "<figure><img src=\"/{name}/stream.mjpg\" alt=\"{name}\">\
             <figcaption>{name} &middot; <a href=\"/{name}/frame.jpg\">frame</a> &middot; \
             <a href=\"/{name}/detections\">detections</a></figcaption></figure>"
        ));
    }
    html.push_str("</body></html>");
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(html)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpStream,
        time::Instant,
    };

    use super::*;
    use crate::vision::data::DetectionSummary;

    fn start(hub: Arc<StreamHub>, shutdown: ShutdownToken) -> StreamServer {
        StreamServer::start(
            hub,
            &StreamOptions {
                bind: "127.0.0.1:0".parse().unwrap(),
                fps: 50,
            },
            shutdown,
        )
        .unwrap()
    }

    fn packet(frame_number: u64, jpeg: &'static [u8]) -> FramePacket {
        FramePacket {
            jpeg: Bytes::from_static(jpeg),
            detections: vec![DetectionSummary {
                class: "target".into(),
                class_id: 0,
                score: 0.8,
                bbox: [1.0, 2.0, 3.0, 4.0],
            }],
            timestamp_ms: 42,
            frame_number,
            fps: 9.5,
        }
    }

    fn get(addr: SocketAddr, path: &str) -> String {
        let mut conn = TcpStream::connect(addr).unwrap();
        conn.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        write!(conn, "GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n").unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Read from a never-ending response until `done` holds or time runs out.
    fn read_until(conn: &mut TcpStream, done: impl Fn(&str) -> bool) -> String {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut collected = Vec::new();
        let mut chunk = [0u8; 4096];
        while Instant::now() < deadline {
            match conn.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&chunk[..n]);
                    if done(&String::from_utf8_lossy(&collected)) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
        String::from_utf8_lossy(&collected).into_owned()
    }

    #[test]
    fn serves_latest_frame_and_detections() {
        let hub = Arc::new(StreamHub::new([Arc::from("cam0"), Arc::from("cam1")]));
        let server = start(hub.clone(), ShutdownToken::new());
        let addr = server.local_addr();

        assert!(get(addr, "/cam0/frame.jpg").starts_with("HTTP/1.1 204"));
        hub.publish("cam0", packet(3, b"JPEGDATA"));

        let frame = get(addr, "/cam0/frame.jpg");
        assert!(frame.starts_with("HTTP/1.1 200"));
        assert!(frame.ends_with("JPEGDATA"));

        let detections = get(addr, "/cam0/detections");
        assert!(detections.contains("\"frame_number\":3"));
        assert!(detections.contains("\"class\":\"target\""));

        let streams = get(addr, "/streams");
        assert!(streams.contains("\"name\":\"cam1\""));
        assert!(get(addr, "/").contains("/cam1/stream.mjpg"));
        assert!(get(addr, "/cam9/frame.jpg").starts_with("HTTP/1.1 404"));

        server.stop();
    }

    #[test]
    fn mjpeg_clients_see_new_frames_and_no_repeats() {
        let hub = Arc::new(StreamHub::new([Arc::from("cam0")]));
        let server = start(hub.clone(), ShutdownToken::new());
        hub.publish("cam0", packet(1, b"FIRST"));

        let mut conn = TcpStream::connect(server.local_addr()).unwrap();
        conn.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        write!(conn, "GET /cam0/stream.mjpg HTTP/1.1\r\nHost: test\r\n\r\n").unwrap();

        let head = read_until(&mut conn, |text| text.contains("FIRST"));
        assert!(head.contains("multipart/x-mixed-replace; boundary=frame"));
        assert!(head.contains("X-Sequence: 1"));

        // Several ticks pass without a new frame; nothing is re-sent.
        std::thread::sleep(Duration::from_millis(200));
        hub.publish("cam0", packet(2, b"SECOND"));
        let next = read_until(&mut conn, |text| text.contains("SECOND"));
        assert!(next.contains("X-Sequence: 2"));
        assert!(!next.contains("X-Sequence: 1"));

        server.stop();
    }

    #[test]
    fn stopped_server_refuses_connections() {
        let hub = Arc::new(StreamHub::new([Arc::from("cam0")]));
        let shutdown = ShutdownToken::new();
        let server = start(hub, shutdown.clone());
        let addr = server.local_addr();
        assert!(get(addr, "/streams").starts_with("HTTP/1.1 200"));

        shutdown.request();
        server.stop();
        assert!(TcpStream::connect(addr).is_err());
    }
}
