//! Test harness: a scripted in-process LiveQuery server.
//!
//! Binds a loopback listener, performs the server side of the WebSocket
//! upgrade and exchanges frames using the crate's own codec (server frames
//! unmasked, as the protocol requires). Tests drive the conversation
//! explicitly, message by message.

#![allow(dead_code)]

use livequery_client::frame::{self, Frame, Opcode};
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const IO_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_PAYLOAD: usize = 1 << 20;

pub struct MockServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");
        Self { listener, addr }
    }

    pub fn endpoint(&self) -> String {
        format!("ws://{}/livequery", self.addr)
    }

    /// Assert that no new client connects within a short window.
    pub async fn accept_should_stay_idle(&self) {
        let result = tokio::time::timeout(Duration::from_millis(300), self.listener.accept()).await;
        assert!(result.is_err(), "no client connection expected");
    }

    /// Accept one client and complete the upgrade handshake.
    pub async fn accept(&self) -> ServerConn {
        let (stream, _) = tokio::time::timeout(IO_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for a client connection")
            .expect("accept");
        let mut conn = ServerConn { stream };
        conn.handshake().await;
        conn
    }
}

pub struct ServerConn {
    stream: TcpStream,
}

impl ServerConn {
    async fn handshake(&mut self) {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = tokio::time::timeout(IO_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out reading the upgrade request")
                .expect("read upgrade request");
            assert!(n > 0, "client closed during the handshake");
            request.extend_from_slice(&buf[..n]);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let request = String::from_utf8(request).expect("upgrade request is utf-8");
        assert!(request.starts_with("GET /livequery HTTP/1.1"), "request line: {request}");
        assert!(request.contains("Upgrade: websocket"));

        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .expect("request carries Sec-WebSocket-Key");

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             Sec-WebSocket-Protocol: livequery-json\r\n\r\n",
            frame::accept_key(&key)
        );
        self.stream.write_all(response.as_bytes()).await.expect("write 101 response");
    }

    /// Read one raw frame (masked, since it comes from a client).
    pub async fn read_frame(&mut self) -> Frame {
        tokio::time::timeout(IO_TIMEOUT, frame::read_frame(&mut self.stream, MAX_PAYLOAD, IO_TIMEOUT))
            .await
            .expect("timed out waiting for a frame")
            .expect("read frame")
    }

    /// Read the next JSON text message, transparently answering pings.
    ///
    /// Returns `None` when the client sends a close frame.
    pub async fn read_json(&mut self) -> Option<JsonValue> {
        loop {
            let frame = self.read_frame().await;
            match frame.opcode {
                Opcode::Text => {
                    let text = std::str::from_utf8(&frame.payload).expect("text frame is utf-8");
                    return Some(serde_json::from_str(text).expect("text frame is JSON"));
                }
                Opcode::Ping => {
                    let payload = frame.payload.clone();
                    self.send_raw(Opcode::Pong, &payload).await;
                }
                Opcode::Pong => {}
                Opcode::Close => return None,
                other => panic!("unexpected {:?} frame from client", other),
            }
        }
    }

    /// Assert that the client sends nothing for `window`.
    pub async fn expect_silence(&mut self, window: Duration) {
        let result =
            tokio::time::timeout(window, frame::read_frame(&mut self.stream, MAX_PAYLOAD, IO_TIMEOUT))
                .await;
        if let Ok(Ok(frame)) = result {
            panic!("expected silence, client sent a {:?} frame", frame.opcode);
        }
    }

    /// Send an unmasked server frame.
    pub async fn send_raw(&mut self, opcode: Opcode, payload: &[u8]) {
        let encoded = frame::encode_frame(opcode, payload, None);
        self.stream.write_all(&encoded).await.expect("write frame");
    }

    /// Send one JSON message as a text frame.
    pub async fn send_json(&mut self, value: &JsonValue) {
        self.send_raw(Opcode::Text, value.to_string().as_bytes()).await;
    }

    /// Send a close frame with a code.
    pub async fn send_close(&mut self, code: u16) {
        self.send_raw(Opcode::Close, &code.to_be_bytes()).await;
    }
}

/// Poll `check` until it holds or `deadline` passes.
pub async fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
