use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::{Options, ProxyKind, ProxyOptions};
use crate::conn::ChannelIo;

/// Produces raw channels. Implementations decide where the TCP connection
/// actually goes; everything above treats the result as an opaque duplex.
#[async_trait]
pub trait ChannelProvider: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<ChannelIo>;
}

/// Dials the origin directly.
pub struct DirectProvider {
    dial_timeout: Duration,
}

impl DirectProvider {
    pub fn new(dial_timeout: Duration) -> Self {
        Self { dial_timeout }
    }
}

#[async_trait]
impl ChannelProvider for DirectProvider {
    async fn connect(&self, host: &str, port: u16) -> anyhow::Result<ChannelIo> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect: dial timeout to {}", addr))?
            .map_err(|e| anyhow::anyhow!("connect: dial {} failed: {}", addr, e))?;
        stream.set_nodelay(true)?;
        Ok(Box::pin(stream))
    }
}

/// Dials the configured proxy instead of the origin. Establishing the tunnel
/// over the resulting channel is the proxy layer's concern, not the pool's.
pub struct ProxiedProvider {
    proxy: ProxyOptions,
    dial_timeout: Duration,
}

impl ProxiedProvider {
    pub fn new(proxy: ProxyOptions, dial_timeout: Duration) -> Self {
        Self {
            proxy,
            dial_timeout,
        }
    }
}

#[async_trait]
impl ChannelProvider for ProxiedProvider {
    async fn connect(&self, _host: &str, _port: u16) -> anyhow::Result<ChannelIo> {
        let addr = format!("{}:{}", self.proxy.host, self.proxy.port);
        let stream = tokio::time::timeout(self.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect: dial timeout to proxy {}", addr))?
            .map_err(|e| anyhow::anyhow!("connect: dial proxy {} failed: {}", addr, e))?;
        stream.set_nodelay(true)?;
        Ok(Box::pin(stream))
    }
}

/// Pick the provider for one connection attempt. A plaintext HTTP proxy is
/// handled above this layer, so it gets the direct provider here.
pub(crate) fn provider_for(options: &Options, tls: bool) -> Arc<dyn ChannelProvider> {
    match &options.proxy {
        Some(proxy) if tls || proxy.kind != ProxyKind::Http => Arc::new(ProxiedProvider::new(
            proxy.clone(),
            options.connect_timeout,
        )),
        _ => Arc::new(DirectProvider::new(options.connect_timeout)),
    }
}
