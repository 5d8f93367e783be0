//! A tiny HTTP/1.1 file server for download tests.
//!
//! Serves fixed bodies by path, honours `Range: bytes=N-` with a `206`,
//! and can cut the first full response short or stall full responses
//! mid-body.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Route {
    pub body: Vec<u8>,
    /// Close the first non-range response after this many body bytes
    pub truncate_once_at: Option<usize>,
    /// Send this many bytes of a non-range response, then hang
    pub stall_at: Option<usize>,
}

impl Route {
    pub fn file(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub path: String,
    pub range: Option<String>,
    pub if_range: Option<String>,
}

#[derive(Default)]
struct State {
    routes: HashMap<String, Route>,
    truncated: Vec<String>,
    seen: Vec<Seen>,
}

pub struct TestServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let state = Arc::new(Mutex::new(State::default()));

        let shared = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let shared = shared.clone();
                thread::spawn(move || handle(stream, shared));
            }
        });

        Self { addr, state }
    }

    pub fn route(&self, path: &str, route: Route) {
        self.state
            .lock()
            .unwrap()
            .routes
            .insert(path.to_string(), route);
    }

    pub fn url(&self, prefix: &str) -> String {
        format!("http://{}{}", self.addr, prefix)
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.state.lock().unwrap().seen.clone()
    }

    pub fn requests_for(&self, path: &str) -> Vec<Seen> {
        self.requests()
            .into_iter()
            .filter(|seen| seen.path == path)
            .collect()
    }
}

const ETAG: &str = "\"fixture-v1\"";

fn handle(stream: TcpStream, state: Arc<Mutex<State>>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));

    let mut request_line = String::new();
    if reader.read_line(&mut request_line).is_err() {
        return;
    }
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let mut range = None;
    let mut if_range = None;
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            match name.trim().to_ascii_lowercase().as_str() {
                "range" => range = Some(value.trim().to_string()),
                "if-range" => if_range = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    let (route, truncate_now) = {
        let mut state = state.lock().unwrap();
        state.seen.push(Seen {
            path: path.clone(),
            range: range.clone(),
            if_range,
        });
        let route = state.routes.get(&path).cloned();
        let truncate_now = match &route {
            Some(route) if route.truncate_once_at.is_some() && range.is_none() => {
                if state.truncated.contains(&path) {
                    false
                } else {
                    state.truncated.push(path.clone());
                    true
                }
            }
            _ => false,
        };
        (route, truncate_now)
    };

    let mut stream = stream;
    let Some(route) = route else {
        let _ = stream.write_all(
            b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        );
        return;
    };

    let offset = range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.trim_end_matches('-').parse::<usize>().ok())
        .filter(|offset| *offset < route.body.len());

    let (head, body) = match offset {
        Some(offset) => (
            format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: {}\r\nContent-Range: bytes {}-{}/{}\r\nETag: {}\r\nConnection: close\r\n\r\n",
                route.body.len() - offset,
                offset,
                route.body.len() - 1,
                route.body.len(),
                ETAG
            ),
            &route.body[offset..],
        ),
        None => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nETag: {}\r\nConnection: close\r\n\r\n",
                route.body.len(),
                ETAG
            ),
            &route.body[..],
        ),
    };

    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }

    if let Some(stall) = route.stall_at.filter(|_| offset.is_none()) {
        let _ = stream.write_all(&body[..stall.min(body.len())]);
        let _ = stream.flush();
        thread::sleep(Duration::from_secs(10));
        return;
    }
    if truncate_now {
        let cut = route.truncate_once_at.unwrap_or(0).min(body.len());
        let _ = stream.write_all(&body[..cut]);
        let _ = stream.flush();
        let _ = stream.shutdown(Shutdown::Both);
        return;
    }

    let _ = stream.write_all(body);
    let _ = stream.flush();
}

/// Deterministic non-repeating payload.
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32) as u8)
        .collect()
}
