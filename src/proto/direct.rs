//! Direct pass-through handler
//!
//! Never sniffed from the wire; selected only by configuration as the
//! outbound hop, where the upstream connection is used as-is.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::{auth::AuthConfig, relay::Address};

use super::{ClientStream, ConnContext, Handshake, Protocol};

pub struct Direct;

#[async_trait]
impl Protocol for Direct {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn correct_header(&self, _header: Option<u8>, _socket: &TcpStream, _auth: &AuthConfig) -> bool {
        false
    }

    async fn parse(
        &self,
        _header: Option<u8>,
        _stream: &mut ClientStream,
        _ctx: &mut ConnContext,
    ) -> io::Result<Handshake> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "direct cannot accept inbound connections",
        ))
    }

    async fn connect(
        &self,
        _upstream: &mut ClientStream,
        _auth: &AuthConfig,
        _addr: &Address,
    ) -> io::Result<Option<super::shadow::OtaSigner>> {
        Ok(None)
    }
}
