#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
struct Documents {
    bodies: Mutex<HashMap<String, (u16, String)>>,
    requests: AtomicUsize,
}

/// Loopback HTTP server handing out rule-set documents by path.
pub struct RuleServer {
    base: String,
    documents: Arc<Documents>,
}

impl RuleServer {
    pub fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let base = format!("http://{}", listener.local_addr()?);
        let documents = Arc::new(Documents::default());
        let served = documents.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let _ = serve(stream, &served);
            }
        });
        Ok(Self { base, documents })
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    pub fn set(&self, path: &str, body: &str) {
        self.set_status(path, 200, body);
    }

    pub fn set_status(&self, path: &str, status: u16, body: &str) {
        self.documents
            .bodies
            .lock()
            .insert(format!("/{}", path.trim_start_matches('/')), (status, body.to_string()));
    }

    pub fn requests(&self) -> usize {
        self.documents.requests.load(Ordering::SeqCst)
    }
}

fn serve(stream: TcpStream, documents: &Documents) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header)? == 0 || header.trim().is_empty() {
            break;
        }
    }
    documents.requests.fetch_add(1, Ordering::SeqCst);

    let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
    let (status, body) = documents
        .bodies
        .lock()
        .get(&path)
        .cloned()
        .unwrap_or((404, "not found".to_string()));
    let reason = if status == 200 { "OK" } else { "Error" };

    let mut stream = stream;
    write!(
        stream,
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    )?;
    stream.flush()
}
