//! One listener, several protocols: the dispatcher picks from the first byte.

use std::{net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
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

const PROXY: &str = "127.0.0.1:18150";

async fn start_mixed_server() {
    let config = ServerConfig::from_uri(&format!("http+socks4+socks5://{PROXY}")).unwrap();
    tokio::spawn(Server::new(config).run());
    time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn mixed_port_dispatches_by_first_byte() {
    let _ = env_logger::try_init();

    let echo = start_echo().await;
    start_mixed_server().await;

    let v4 = match echo {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(..) => unreachable!(),
    };

    // 0x05 selects socks5
    let mut c = TcpStream::connect(PROXY).await.unwrap();
    c.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0x00]);
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    c.write_all(&req).await.unwrap();
    let mut reply = [0u8; 10];
    c.read_exact(&mut reply).await.unwrap();
    c.write_all(b"via socks5").await.unwrap();
    let mut back = [0u8; 10];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"via socks5");

    // 0x04 selects socks4 on the same port
    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&v4.port().to_be_bytes());
    req.extend_from_slice(&v4.ip().octets());
    req.push(0x00);
    c.write_all(&req).await.unwrap();
    let mut reply = [0u8; 8];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x00, 0x5a]);
    c.write_all(b"via socks4").await.unwrap();
    let mut back = [0u8; 10];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"via socks4");

    // An alphabetic method byte selects http
    let mut c = TcpStream::connect(PROXY).await.unwrap();
    let req = format!("CONNECT {echo} HTTP/1.1\r\nHost: {echo}\r\n\r\n");
    c.write_all(req.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        c.read_exact(&mut byte).await.unwrap();
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 200"));
    c.write_all(b"via http").await.unwrap();
    let mut back = [0u8; 8];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(&back, b"via http");
}

#[tokio::test]
async fn unrecognized_first_byte_is_dropped() {
    let _ = env_logger::try_init();

    const LONE: &str = "127.0.0.1:18151";
    let config = ServerConfig::from_uri(&format!("socks4+socks5://{LONE}")).unwrap();
    tokio::spawn(Server::new(config).run());
    time::sleep(Duration::from_millis(200)).await;

    let mut c = TcpStream::connect(LONE).await.unwrap();
    c.write_all(&[0xff, 0x00, 0x00]).await.unwrap();

    let mut rest = Vec::new();
    let n = c.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);
}
