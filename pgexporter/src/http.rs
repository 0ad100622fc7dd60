//! The HTTP surface: request parsing, routing and chunked responses.
//!
//! Each accepted connection gets a one-shot handler thread: it reads a single
//! request (bounded by the authentication timeout), writes one response and
//! disconnects.  Successful responses use chunked transfer-encoding; each
//! block is framed as `<hex-length>\r\n<data>\r\n` and the response ends with
//! `0\r\n\r\n`.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::CacheGuard;
use crate::collectors::{self, BlockSink};
use crate::config::MetricDefinition;
use crate::Exporter;

const REQUEST_BUFFER_SIZE: usize = 8 * 1024;

enum Page {
    Home,
    Metrics,
    Unknown,
    BadRequest,
}

/// Accepts connections forever, spawning a one-shot handler per connection.
///
/// # Errors
///
/// Returns an error only when a handler thread cannot be spawned; accept
/// failures are logged and skipped.
pub fn serve(listener: TcpListener, exporter: Arc<Exporter>) -> io::Result<()> {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _peer)) => stream,
            Err(error) => {
                warn!(%error, "error accepting connection; request ignored");
                continue;
            }
        };

        let exporter = Arc::clone(&exporter);
        thread::Builder::new().name("pgexporter-http".to_string()).spawn(move || {
            if let Err(error) = handle_connection(stream, &exporter) {
                debug!(%error, "connection handler failed");
            }
        })?;
    }
}

fn handle_connection(mut stream: TcpStream, exporter: &Exporter) -> io::Result<()> {
    let timeout = exporter.config().authentication_timeout;
    stream.set_read_timeout(Some(Duration::from_secs(timeout)))?;

    let mut request = vec![0_u8; REQUEST_BUFFER_SIZE];
    let length = stream.read(&mut request)?;

    match resolve_page(&request[..length]) {
        Page::Home => home_page(&mut stream, exporter),
        Page::Metrics => metrics_page(&mut stream, exporter),
        Page::Unknown => unknown_page(&mut stream),
        Page::BadRequest => bad_request(&mut stream),
    }
}

fn resolve_page(request: &[u8]) -> Page {
    if request.len() < 3 || &request[..3] != b"GET" {
        debug!("not a GET request");
        return Page::BadRequest;
    }

    // The path starts after `GET ` and runs to the next space.
    let Some(rest) = request.get(4..) else {
        return Page::BadRequest;
    };
    let Some(end) = rest.iter().position(|&byte| byte == b' ') else {
        return Page::BadRequest;
    };

    match &rest[..end] {
        b"/" | b"/index.html" => Page::Home,
        b"/metrics" => Page::Metrics,
        _ => Page::Unknown,
    }
}

/// `Date` header value in asctime form, e.g. `Sat Aug  1 12:34:56 2026`.
fn http_date() -> String {
    chrono::Utc::now().format("%a %b %e %H:%M:%S %Y").to_string()
}

fn send_chunk(stream: &mut TcpStream, data: &str) -> io::Result<()> {
    write!(stream, "{:X}\r\n", data.len())?;
    stream.write_all(data.as_bytes())?;
    stream.write_all(b"\r\n")
}

struct ScrapeSink<'a, 'g> {
    stream: &'a mut TcpStream,
    cache: &'a mut CacheGuard<'g>,
}

impl BlockSink for ScrapeSink<'_, '_> {
    fn write_block(&mut self, block: &str) -> io::Result<()> {
        send_chunk(self.stream, block)?;
        self.cache.append(block.as_bytes());
        Ok(())
    }
}

fn metrics_page(stream: &mut TcpStream, exporter: &Exporter) -> io::Result<()> {
    let mut guard = exporter.cache().acquire();

    if let Some(cached) = guard.serve() {
        debug!(bytes = cached.len(), "serving metrics out of cache");
        return stream.write_all(cached);
    }

    guard.begin();

    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/plain; version=0.0.1; charset=utf-8\r\n\
         Date: {}\r\n",
        http_date()
    );
    // The cached copy is a self-contained unchunked response; the live one
    // adds the chunked framing on top.
    guard.append(head.as_bytes());
    guard.append(b"\r\n");
    stream.write_all(head.as_bytes())?;
    stream.write_all(b"Transfer-Encoding: chunked\r\n\r\n")?;

    let bridge = exporter.bridge();
    bridge.open_connections(exporter.servers());
    let written = {
        let mut sink = ScrapeSink { stream: &mut *stream, cache: &mut guard };
        collectors::write_metrics(
            &mut sink,
            exporter.config(),
            exporter.metrics(),
            exporter.servers(),
            bridge,
        )
    };
    bridge.close_connections(exporter.servers());
    written?;

    stream.write_all(b"0\r\n\r\n")?;
    guard.finalize();
    Ok(())
}

fn home_page(stream: &mut TcpStream, exporter: &Exporter) -> io::Result<()> {
    let head = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Date: {}\r\n\
         Transfer-Encoding: chunked\r\n\r\n",
        http_date()
    );
    stream.write_all(head.as_bytes())?;
    send_chunk(stream, &home_html(exporter.metrics()))?;
    stream.write_all(b"0\r\n\r\n")
}

fn home_html(metrics: &[MetricDefinition]) -> String {
    let mut body = String::from(
        r#"<html>
<head>
  <title>pgexporter</title>
</head>
<body>
  <h1>pgexporter</h1>
  Prometheus exporter for PostgreSQL
  <p>
  <a href="/metrics">Metrics</a>
  <p>
  Support for
  <ul>
"#,
    );

    if metrics.is_empty() {
        for tag in [
            "pg_database",
            "pg_locks",
            "pg_replication_slots",
            "pg_settings",
            "pg_stat_bgwriter",
            "pg_stat_database",
            "pg_stat_database_conflicts",
        ] {
            body.push_str("  <li>");
            body.push_str(tag);
            body.push_str("</li>\n");
        }
    } else {
        for metric in metrics {
            body.push_str("  <li>");
            body.push_str(&metric.tag);
            body.push_str("</li>\n");
        }
    }

    body.push_str(
        r#"  </ul>
  <p>
  <a href="https://pgexporter.github.io/">pgexporter.github.io/</a>
</body>
</html>
"#,
    );
    body
}

fn unknown_page(stream: &mut TcpStream) -> io::Result<()> {
    let response = format!("HTTP/1.1 403 Forbidden\r\nDate: {}\r\n\r\n", http_date());
    stream.write_all(response.as_bytes())
}

fn bad_request(stream: &mut TcpStream) -> io::Result<()> {
    let response = format!("HTTP/1.1 400 Bad Request\r\nDate: {}\r\n\r\n", http_date());
    stream.write_all(response.as_bytes())
}
