//! Disabled tunnel - installed when no tunnel is configured

use std::io::{self, ErrorKind};

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};
use crate::error::Error;

use super::Tunnel;

/// Tunnel that refuses every connection
#[derive(Debug, Default)]
pub struct DisabledTunnel;

#[async_trait]
impl Tunnel for DisabledTunnel {
    async fn connect(&self, addr: &Address) -> Result<Stream> {
        Err(Error::Tunnel(format!(
            "no tunnel configured for {}: {}",
            addr,
            io::Error::from(ErrorKind::ConnectionRefused)
        )))
    }

    async fn close(&self) {}

    fn name(&self) -> &'static str {
        "disabled"
    }
}
