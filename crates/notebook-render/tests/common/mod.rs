//! Helpers shared by the integration tests: a fake render tool and a stub
//! HTTP endpoint.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use notebook_render::ToolCommand;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A render tool stand-in: `sh -c <script>`.
///
/// The tool arguments follow the script, so inside it `$3` is the port and
/// `$5` the artifact path.
pub fn fake_tool(script: &str) -> ToolCommand {
    ToolCommand::program("sh", ["-c", script, "fake-voila"])
}

/// Shell snippet writing `value` to `path` atomically.
pub fn write_file_cmd(value: &str, path: &Path) -> String {
    let path = path.display();
    format!("echo {value} > '{path}.tmp' && mv '{path}.tmp' '{path}'")
}

/// Wait until `path` exists and return its trimmed contents.
pub async fn wait_for_file(path: &Path, timeout: Duration) -> Option<String> {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if let Ok(contents) = std::fs::read_to_string(path) {
            return Some(contents.trim().to_string());
        }
        sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Wait until `path` holds at least `count` non-empty lines.
pub async fn wait_for_lines(path: &Path, count: usize, timeout: Duration) -> Vec<String> {
    let start = std::time::Instant::now();
    loop {
        let lines: Vec<String> = std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        if lines.len() >= count || start.elapsed() >= timeout {
            return lines;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

/// Serve a canned HTTP response with `status_line` on `listener`.
pub fn serve_stub(listener: TcpListener, status_line: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {status_line}\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok"
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    })
}

/// Accept connections on `listener` and never answer them.
pub fn serve_silent(listener: TcpListener) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    })
}

/// Bind `port` on localhost and serve 200s.
pub async fn serve_ok_on(port: u16) -> JoinHandle<()> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await.unwrap();
    serve_stub(listener, "200 OK")
}

/// A localhost port that nothing listens on right now.
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}
