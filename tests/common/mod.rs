//! Shared helpers for integration tests

#![allow(dead_code)]

use bytes::Bytes;
use ntrip_relay::rtcm::RtcmFrame;
use std::future::Future;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Duration};

/// RTCM3 frame whose payload starts with `message_type`
pub fn frame(message_type: u16, body_len: usize) -> Bytes {
    let mut payload = vec![0u8; body_len.max(2)];
    payload[0] = (message_type >> 4) as u8;
    payload[1] = ((message_type & 0x0F) as u8) << 4;
    for (i, byte) in payload.iter_mut().enumerate().skip(2) {
        *byte = (i % 251) as u8;
    }
    RtcmFrame::encode(&payload)
}

/// Read a response head; returns its text and any bytes read past it
pub async fn read_head(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let rest = buf.split_off(end + 4);
            return (String::from_utf8_lossy(&buf).into_owned(), rest);
        }
        let n = timeout(Duration::from_secs(5), stream.read(&mut chunk))
            .await
            .expect("timed out reading response head")
            .expect("read failed");
        assert!(n > 0, "connection closed before end of head: {:?}", String::from_utf8_lossy(&buf));
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Read exactly `len` bytes, counting `already` as the start
pub async fn read_exact_with(stream: &mut TcpStream, already: Vec<u8>, len: usize) -> Vec<u8> {
    let mut data = already;
    assert!(data.len() <= len, "received more than expected");
    let start = data.len();
    data.resize(len, 0);
    timeout(Duration::from_secs(5), stream.read_exact(&mut data[start..]))
        .await
        .expect("timed out reading stream")
        .expect("read failed");
    data
}

/// Send a client request and read the whole rejection response
pub async fn request_and_read_all(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("timed out reading response")
        .expect("read failed");
    String::from_utf8_lossy(&response).into_owned()
}

/// Connect as a client and complete a streaming handshake
pub async fn open_stream(addr: SocketAddr, request: &str) -> (TcpStream, String, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let (head, rest) = read_head(&mut stream).await;
    (stream, head, rest)
}

pub fn v2_request(mountpoint: &str, authorization: Option<&str>) -> String {
    let mut request = format!(
        "GET /{} HTTP/1.1\r\nHost: localhost\r\nNtrip-Version: Ntrip/2.0\r\nUser-Agent: NTRIP test\r\n",
        mountpoint
    );
    if let Some(value) = authorization {
        request.push_str(&format!("Authorization: {}\r\n", value));
    }
    request.push_str("\r\n");
    request
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(5)).await;
    }
}
