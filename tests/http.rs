use std::{collections::HashMap, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time,
};

use protomux::{Server, ServerConfig};

async fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, ..) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

/// Origin server that captures the request head it receives
async fn start_capturing_origin() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, ..) = listener.accept().await.unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read_exact(&mut byte).await.is_err() {
                break;
            }
            head.push(byte[0]);
        }
        let _ = tx.send(head);
        let _ = stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
            .await;
    });

    (addr, rx)
}

async fn start_server(config: ServerConfig) {
    tokio::spawn(Server::new(config).run());
    time::sleep(Duration::from_millis(200)).await;
}

async fn read_head(c: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        c.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn http_connect_tunnel() {
    let _ = env_logger::try_init();

    const PROXY: &str = "127.0.0.1:18120";
    let echo = start_echo().await;
    start_server(ServerConfig::from_uri(&format!("http://{PROXY}")).unwrap()).await;

    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    c.write_all(req.as_bytes()).await.unwrap();

    let head = read_head(&mut c).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");

    c.write_all(b"opaque tunnel bytes").await.unwrap();
    let mut back = [0u8; 19];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"opaque tunnel bytes");
}

#[tokio::test]
async fn http_plain_proxy_rewrites_to_origin_form() {
    let _ = env_logger::try_init();

    const PROXY: &str = "127.0.0.1:18121";
    let (origin, captured) = start_capturing_origin().await;
    start_server(ServerConfig::from_uri(&format!("http://{PROXY}")).unwrap()).await;

    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let req = format!(
        "GET http://{origin}/hello?x=1 HTTP/1.1\r\nHost: {origin}\r\nProxy-Connection: keep-alive\r\nAccept: */*\r\n\r\n"
    );
    c.write_all(req.as_bytes()).await.unwrap();

    let head = read_head(&mut c).await;
    assert!(head.starts_with("HTTP/1.1 200"), "unexpected reply: {head}");
    let mut body = [0u8; 2];
    c.read_exact(&mut body).await.unwrap();
    assert_eq!(&body, b"ok");

    let forwarded = String::from_utf8(captured.await.unwrap()).unwrap();
    assert!(
        forwarded.starts_with("GET /hello?x=1 HTTP/1.1\r\n"),
        "request line not rewritten: {forwarded}"
    );
    assert!(!forwarded.contains("Proxy-"), "proxy headers leaked: {forwarded}");
    assert!(forwarded.contains("Accept: */*\r\n"));
}

#[tokio::test]
async fn http_static_get_serves_configured_path() {
    let _ = env_logger::try_init();

    const PROXY: &str = "127.0.0.1:18122";
    let mut httpget = HashMap::new();
    httpget.insert("/status".to_owned(), "online at %(host)s".to_owned());
    let config = ServerConfig::from_uri(&format!("http://{PROXY}"))
        .unwrap()
        .with_httpget(httpget);
    start_server(config).await;

    let mut c = TcpStream::connect(PROXY).await.unwrap();
    c.write_all(b"GET /status HTTP/1.1\r\nHost: proxy.local\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    c.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
    assert!(response.ends_with("online at proxy.local"), "got: {response}");
}

#[tokio::test]
async fn http_static_get_misses_with_404() {
    let _ = env_logger::try_init();

    const PROXY: &str = "127.0.0.1:18123";
    start_server(ServerConfig::from_uri(&format!("http://{PROXY}")).unwrap()).await;

    let mut c = TcpStream::connect(PROXY).await.unwrap();
    c.write_all(b"GET /nothing HTTP/1.1\r\nHost: x\r\n\r\n").await.unwrap();

    let mut response = String::new();
    c.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 404"), "got: {response}");
}

#[tokio::test]
async fn http_proxy_authorization() {
    let _ = env_logger::try_init();

    const PROXY: &str = "127.0.0.1:18124";
    let echo = start_echo().await;
    start_server(ServerConfig::from_uri(&format!("http://{PROXY}#alice:sesame")).unwrap()).await;

    // Without credentials: 407 with the Basic challenge, then close
    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    c.write_all(req.as_bytes()).await.unwrap();
    let mut response = String::new();
    c.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 407"), "got: {response}");
    assert!(response.contains("Proxy-Authenticate: Basic"), "got: {response}");

    // With the right Basic token the tunnel opens
    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let req = format!(
        "CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\nProxy-Authorization: Basic YWxpY2U6c2VzYW1l\r\n\r\n"
    );
    c.write_all(req.as_bytes()).await.unwrap();
    let head = read_head(&mut c).await;
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");

    c.write_all(b"hi").await.unwrap();
    let mut back = [0u8; 2];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"hi");
}
