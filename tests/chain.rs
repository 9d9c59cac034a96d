//! Proxy-chaining tests: the listener accepts one protocol and frames its
//! outbound hop in another.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time,
};

use protomux::{
    config::UpstreamConfig, proto::shadow::Shadowsocks, Address, Server, ServerConfig,
};

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

async fn start_server(config: ServerConfig) {
    tokio::spawn(Server::new(config).run());
    time::sleep(Duration::from_millis(200)).await;
}

/// SOCKS5 CONNECT through the entry proxy, returning the open stream
async fn socks5_connect(proxy: &str, dest: SocketAddr) -> TcpStream {
    let mut c = TcpStream::connect(proxy).await.unwrap();
    c.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut buf = [0u8; 2];
    c.read_exact(&mut buf).await.unwrap();
    assert_eq!(buf, [0x05, 0x00]);

    let v4 = match dest {
        SocketAddr::V4(v4) => v4,
        SocketAddr::V6(..) => unreachable!(),
    };
    let mut req = vec![0x05, 0x01, 0x00, 0x01];
    req.extend_from_slice(&v4.ip().octets());
    req.extend_from_slice(&v4.port().to_be_bytes());
    c.write_all(&req).await.unwrap();

    let mut reply = [0u8; 10];
    c.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x05, 0x00]);

    c
}

async fn assert_roundtrip(c: &mut TcpStream, msg: &[u8]) {
    c.write_all(msg).await.unwrap();
    let mut back = vec![0u8; msg.len()];
    c.read_exact(&mut back).await.unwrap();
    assert_eq!(back, msg);
}

#[tokio::test]
async fn socks5_chained_through_socks5() {
    let _ = env_logger::try_init();

    const ENTRY: &str = "127.0.0.1:18140";
    const HOP: &str = "127.0.0.1:18141";
    let echo = start_echo().await;

    start_server(ServerConfig::from_uri(&format!("socks5://{HOP}")).unwrap()).await;
    let entry = ServerConfig::from_uri(&format!("socks5://{ENTRY}"))
        .unwrap()
        .with_upstream(UpstreamConfig::from_uri(&format!("socks5://{HOP}")).unwrap());
    start_server(entry).await;

    let mut c = socks5_connect(ENTRY, echo).await;
    assert_roundtrip(&mut c, b"two socks5 hops").await;
}

#[tokio::test]
async fn socks5_chained_through_http_connect() {
    let _ = env_logger::try_init();

    const ENTRY: &str = "127.0.0.1:18142";
    const HOP: &str = "127.0.0.1:18143";
    let echo = start_echo().await;

    start_server(ServerConfig::from_uri(&format!("http://{HOP}")).unwrap()).await;
    let entry = ServerConfig::from_uri(&format!("socks5://{ENTRY}"))
        .unwrap()
        .with_upstream(UpstreamConfig::from_uri(&format!("http://{HOP}")).unwrap());
    start_server(entry).await;

    let mut c = socks5_connect(ENTRY, echo).await;
    assert_roundtrip(&mut c, b"socks5 in, http out").await;
}

#[tokio::test]
async fn socks5_chained_through_socks4() {
    let _ = env_logger::try_init();

    const ENTRY: &str = "127.0.0.1:18144";
    const HOP: &str = "127.0.0.1:18145";
    let echo = start_echo().await;

    start_server(ServerConfig::from_uri(&format!("socks4://{HOP}")).unwrap()).await;
    let entry = ServerConfig::from_uri(&format!("socks5://{ENTRY}"))
        .unwrap()
        .with_upstream(UpstreamConfig::from_uri(&format!("socks4://{HOP}")).unwrap());
    start_server(entry).await;

    let mut c = socks5_connect(ENTRY, echo).await;
    assert_roundtrip(&mut c, b"socks5 in, socks4 out").await;
}

#[tokio::test]
async fn socks5_chained_through_shadowsocks_ota() {
    let _ = env_logger::try_init();

    const ENTRY: &str = "127.0.0.1:18146";
    const HOP: &str = "127.0.0.1:18147";
    let echo = start_echo().await;

    start_server(ServerConfig::from_uri(&format!("ss://{HOP}")).unwrap()).await;

    // The outbound hop signs its header and every chunk; the ss hop verifies
    let upstream = UpstreamConfig::new(HOP.parse::<Address>().unwrap(), Arc::new(Shadowsocks::with_ota()));
    let entry = ServerConfig::from_uri(&format!("socks5://{ENTRY}"))
        .unwrap()
        .with_upstream(upstream);
    start_server(entry).await;

    let mut c = socks5_connect(ENTRY, echo).await;
    assert_roundtrip(&mut c, b"one-time-auth chained hop").await;
    assert_roundtrip(&mut c, b"and a second chunk").await;
}

#[tokio::test]
async fn socks5_chained_through_shadowsocks_plain() {
    let _ = env_logger::try_init();

    const ENTRY: &str = "127.0.0.1:18148";
    const HOP: &str = "127.0.0.1:18149";
    let echo = start_echo().await;

    start_server(ServerConfig::from_uri(&format!("ss://{HOP}")).unwrap()).await;
    let entry = ServerConfig::from_uri(&format!("socks5://{ENTRY}"))
        .unwrap()
        .with_upstream(UpstreamConfig::from_uri(&format!("ss://{HOP}")).unwrap());
    start_server(entry).await;

    let mut c = socks5_connect(ENTRY, echo).await;
    assert_roundtrip(&mut c, b"plain shadowsocks hop").await;
}
