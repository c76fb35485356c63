use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use base64::Engine;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::TlsConnector;

use crate::config::{Options, HANDSHAKE_TIMEOUT, UPGRADE_TIMEOUT};
use crate::conn::probe::{ActivityProbe, Traffic};
use crate::conn::{Channel, ChannelIo};
use crate::log_debug;
use crate::logger::Logger;
use crate::origin::{HttpVersion, OriginKey};
use crate::queue::OriginQueue;
use crate::tls::{format_cert_fingerprint, TlsHelper};
use crate::transport;
use crate::waiter::Waiter;

/// Where a connection attempt currently is. Failures report the phase they
/// happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectPhase {
    Dialing,
    TlsHandshake,
    Negotiating,
}

impl ConnectPhase {
    fn as_str(self) -> &'static str {
        match self {
            ConnectPhase::Dialing => "dialing",
            ConnectPhase::TlsHandshake => "tls-handshake",
            ConnectPhase::Negotiating => "negotiating",
        }
    }
}

/// Builds channels for origin queues: dial, drive TLS/ALPN or the h2c
/// upgrade, then hand the outcome back to the queue as one of the
/// negotiation events. The queue callbacks are synchronous, so a cancelled
/// connect can never observe a half-bound connection.
pub(crate) struct Connector {
    options: Arc<Options>,
    tls: Arc<TlsHelper>,
    logger: Logger,
    next_channel_id: AtomicU64,
}

impl Connector {
    pub fn new(options: Arc<Options>, tls: Arc<TlsHelper>, logger: Logger) -> Self {
        Self {
            options,
            tls,
            logger,
            next_channel_id: AtomicU64::new(1),
        }
    }

    pub fn tls_helper(&self) -> &Arc<TlsHelper> {
        &self.tls
    }

    pub async fn connect(
        &self,
        queue: &OriginQueue,
        key: &OriginKey,
        version: HttpVersion,
        host: &str,
        port: u16,
        waiter: Arc<Waiter>,
    ) {
        let mut phase = ConnectPhase::Dialing;
        log_debug!(
            self.logger,
            "connect: {} as {} ({})",
            key,
            version,
            phase.as_str()
        );

        let provider = transport::provider_for(&self.options, key.tls);
        let io = match provider.connect(&key.host, key.port).await {
            Ok(io) => io,
            Err(e) => {
                queue.on_connect_failure(waiter, e);
                return;
            }
        };

        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let traffic = self.options.log_activity.then(Traffic::new);
        let io: ChannelIo = match &traffic {
            Some(t) => Box::pin(ActivityProbe::new(io, t.clone(), self.logger.clone(), id)),
            None => io,
        };
        let mut channel = Channel::new(id, io);
        channel.traffic = traffic;

        if key.tls {
            phase = ConnectPhase::TlsHandshake;
            log_debug!(self.logger, "connect: {} ({})", key, phase.as_str());
            self.negotiate_tls(queue, channel, key, version, waiter)
                .await;
            return;
        }

        phase = ConnectPhase::Negotiating;
        log_debug!(self.logger, "connect: {} ({})", key, phase.as_str());
        match version {
            HttpVersion::H2 if self.options.http2_clear_text_upgrade => {
                self.upgrade_h2c(queue, channel, host, port, waiter).await;
            }
            HttpVersion::H2 => queue.on_negotiated_h2(channel, false, waiter),
            _ => queue.on_negotiated_h1(channel, waiter),
        }
    }

    /// TLS path: handshake, inspect ALPN, report success or failure. The
    /// queue decides whether the outcome is a fallback.
    async fn negotiate_tls(
        &self,
        queue: &OriginQueue,
        channel: Channel,
        key: &OriginKey,
        version: HttpVersion,
        waiter: Arc<Waiter>,
    ) {
        let alpn: Vec<&[u8]> = if self.options.use_alpn {
            if version == HttpVersion::H2 {
                vec![b"h2", b"http/1.1"]
            } else {
                vec![b"http/1.1"]
            }
        } else {
            Vec::new()
        };

        let config = match self.tls.client_config(&alpn) {
            Ok(config) => config,
            Err(e) => {
                queue.on_handshake_failure(Some(channel), e, waiter);
                return;
            }
        };
        let server_name = match self.tls.server_name(&key.host, self.options.force_sni) {
            Ok(name) => name,
            Err(e) => {
                queue.on_handshake_failure(Some(channel), e, waiter);
                return;
            }
        };

        let Channel { id, io, traffic, .. } = channel;
        let connector = TlsConnector::from(config);
        let handshake = connector.connect(server_name, io);
        let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT(), handshake).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                // rustls consumed the socket; dropping it closed the channel.
                queue.on_handshake_failure(None, anyhow::Error::new(e), waiter);
                return;
            }
            Err(_) => {
                queue.on_handshake_failure(
                    None,
                    anyhow::anyhow!("negotiate_tls: handshake timed out"),
                    waiter,
                );
                return;
            }
        };

        let (negotiated, fingerprint) = {
            let (_, session) = tls_stream.get_ref();
            let negotiated = session
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned());
            let fingerprint = session
                .peer_certificates()
                .and_then(|certs| certs.first())
                .map(|cert| format_cert_fingerprint(cert.as_ref()));
            (negotiated, fingerprint)
        };

        let mut channel = Channel::new(id, Box::pin(tls_stream));
        channel.fingerprint = fingerprint;
        channel.traffic = traffic;

        // The queue decides from the negotiated protocol (or its absence)
        // whether this is h2 or an HTTP/1.x fallback.
        queue.on_handshake_success_tls(channel, negotiated.as_deref(), waiter);
    }

    /// Cleartext h2c dance: send the embedded upgrade request, then decide
    /// from the response status whether the origin switched protocols.
    async fn upgrade_h2c(
        &self,
        queue: &OriginQueue,
        channel: Channel,
        host: &str,
        port: u16,
        waiter: Arc<Waiter>,
    ) {
        let request = self.upgrade_request(host, port);
        let options = self.options.clone();

        let dance = async move {
            let mut channel = channel;
            channel
                .io
                .write_all(request.as_bytes())
                .await
                .map_err(|e| anyhow::anyhow!("upgrade_h2c: write failed: {}", e))?;
            channel
                .io
                .flush()
                .await
                .map_err(|e| anyhow::anyhow!("upgrade_h2c: flush failed: {}", e))?;

            let head = read_response_head(&mut channel.io, &options).await?;
            if head.status == 101 {
                // The rest of the bytes are h2 frames for the codec layer.
                if !head.leftover.is_empty() {
                    channel.io = Box::pin(PrefixedIo::new(head.leftover, channel.io));
                }
                return Ok((channel, true));
            }

            // A full HTTP/1.1 response: the origin refused the upgrade.
            // Consume the body so the channel is clean for reuse.
            let leftover = drain_response_body(&mut channel.io, &head, &options).await?;
            if !leftover.is_empty() {
                channel.io = Box::pin(PrefixedIo::new(leftover, channel.io));
            }
            Ok::<_, anyhow::Error>((channel, false))
        };

        match tokio::time::timeout(UPGRADE_TIMEOUT(), dance).await {
            Ok(Ok((channel, true))) => queue.on_negotiated_h2(channel, true, waiter),
            Ok(Ok((channel, false))) => queue.on_cleartext_upgrade_refused(channel, waiter),
            Ok(Err(e)) => queue.on_handshake_failure(None, e, waiter),
            Err(_) => queue.on_handshake_failure(
                None,
                anyhow::anyhow!("upgrade_h2c: negotiation timed out"),
                waiter,
            ),
        }
    }

    fn upgrade_request(&self, host: &str, port: u16) -> String {
        let mut host_header = host.to_string();
        if port != 80 {
            host_header = format!("{}:{}", host, port);
        }
        let payload = encode_settings_payload(&self.options);
        let settings = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload);
        format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\nHTTP2-Settings: {}\r\n\r\n",
            host_header, settings
        )
    }
}

/// RFC 7540 §6.5.1 wire form of the advertised SETTINGS: a 16-bit
/// identifier and 32-bit value per entry, in identifier order.
fn encode_settings_payload(options: &Options) -> Vec<u8> {
    let s = &options.initial_settings;
    let mut out = Vec::new();
    let mut push = |id: u16, value: u32| {
        out.extend_from_slice(&id.to_be_bytes());
        out.extend_from_slice(&value.to_be_bytes());
    };
    if let Some(v) = s.header_table_size {
        push(0x1, v);
    }
    if let Some(v) = s.enable_push {
        push(0x2, v as u32);
    }
    if let Some(v) = s.max_concurrent_streams {
        push(0x3, v);
    }
    let window = s.initial_window_size.or_else(|| {
        (options.http2_connection_window_size > 0).then_some(options.http2_connection_window_size)
    });
    if let Some(v) = window {
        push(0x4, v);
    }
    if let Some(v) = s.max_frame_size {
        push(0x5, v);
    }
    if let Some(v) = s.max_header_list_size {
        push(0x6, v);
    }
    out
}

struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
    leftover: Vec<u8>,
}

impl ResponseHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Read and parse a response head, bounded by the configured decoder
/// limits. Bytes read past the blank line are returned as leftover.
async fn read_response_head(
    io: &mut ChannelIo,
    options: &Options,
) -> anyhow::Result<ResponseHead> {
    let limit = options.max_initial_line_length + options.max_header_size;
    let mut buf = Vec::with_capacity(options.decoder_initial_buffer_size);
    let mut tmp = [0u8; 1024];

    let head_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
        if buf.len() > limit {
            anyhow::bail!("read_response_head: head exceeds {} bytes", limit);
        }
        let n = io
            .read(&mut tmp)
            .await
            .map_err(|e| anyhow::anyhow!("read_response_head: read failed: {}", e))?;
        if n == 0 {
            anyhow::bail!("read_response_head: connection closed before response");
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = std::str::from_utf8(&buf[..head_end])
        .map_err(|_| anyhow::anyhow!("read_response_head: head is not valid UTF-8"))?;
    let mut lines = head.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| anyhow::anyhow!("read_response_head: empty head"))?;
    if status_line.len() > options.max_initial_line_length {
        anyhow::bail!("read_response_head: status line too long");
    }
    if !status_line.starts_with("HTTP/1.") {
        anyhow::bail!("read_response_head: not an HTTP/1.x response: {}", status_line);
    }
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| anyhow::anyhow!("read_response_head: bad status line: {}", status_line))?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    Ok(ResponseHead {
        status,
        headers,
        leftover: buf[head_end..].to_vec(),
    })
}

/// Consume the refused-upgrade response body. Returns any bytes read past
/// the body end.
async fn drain_response_body(
    io: &mut ChannelIo,
    head: &ResponseHead,
    options: &Options,
) -> anyhow::Result<Vec<u8>> {
    let mut reader = BodyReader::new(io, head.leftover.clone());

    if head
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        loop {
            let size_line = reader.read_line(options.max_initial_line_length).await?;
            let size = usize::from_str_radix(size_line.trim().split(';').next().unwrap_or(""), 16)
                .map_err(|_| anyhow::anyhow!("drain_response_body: bad chunk size"))?;
            if size > options.max_chunk_size {
                anyhow::bail!(
                    "drain_response_body: chunk of {} exceeds max chunk size",
                    size
                );
            }
            if size == 0 {
                // Trailer section ends with a blank line.
                loop {
                    let line = reader.read_line(options.max_header_size).await?;
                    if line.is_empty() {
                        return Ok(reader.leftover());
                    }
                }
            }
            reader.skip(size).await?;
            let crlf = reader.read_line(options.max_initial_line_length).await?;
            if !crlf.is_empty() {
                anyhow::bail!("drain_response_body: malformed chunk terminator");
            }
        }
    }

    if let Some(len) = head.header("content-length") {
        let len: usize = len
            .parse()
            .map_err(|_| anyhow::anyhow!("drain_response_body: bad content-length"))?;
        reader.skip(len).await?;
        return Ok(reader.leftover());
    }

    // No framing information: nothing further to drain.
    Ok(reader.leftover())
}

/// Buffered reader over a channel plus already-read bytes.
struct BodyReader<'a> {
    io: &'a mut ChannelIo,
    buf: Vec<u8>,
    pos: usize,
}

impl<'a> BodyReader<'a> {
    fn new(io: &'a mut ChannelIo, initial: Vec<u8>) -> Self {
        Self {
            io,
            buf: initial,
            pos: 0,
        }
    }

    async fn fill(&mut self) -> anyhow::Result<()> {
        let mut tmp = [0u8; 1024];
        let n = self
            .io
            .read(&mut tmp)
            .await
            .map_err(|e| anyhow::anyhow!("drain_response_body: read failed: {}", e))?;
        if n == 0 {
            anyhow::bail!("drain_response_body: connection closed mid-body");
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    /// One line without its CRLF.
    async fn read_line(&mut self, cap: usize) -> anyhow::Result<String> {
        loop {
            if let Some(rel) = find_subslice(&self.buf[self.pos..], b"\r\n") {
                let line = String::from_utf8_lossy(&self.buf[self.pos..self.pos + rel]).into_owned();
                self.pos += rel + 2;
                return Ok(line);
            }
            if self.buf.len() - self.pos > cap {
                anyhow::bail!("drain_response_body: line exceeds {} bytes", cap);
            }
            self.fill().await?;
        }
    }

    async fn skip(&mut self, mut n: usize) -> anyhow::Result<()> {
        loop {
            let available = self.buf.len() - self.pos;
            if available >= n {
                self.pos += n;
                return Ok(());
            }
            self.pos = self.buf.len();
            n -= available;
            self.fill().await?;
        }
    }

    fn leftover(self) -> Vec<u8> {
        self.buf[self.pos..].to_vec()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Replays buffered bytes before reading from the channel again. Used to
/// hand post-head bytes back to the codec layer.
struct PrefixedIo {
    prefix: Vec<u8>,
    pos: usize,
    inner: ChannelIo,
}

impl PrefixedIo {
    fn new(prefix: Vec<u8>, inner: ChannelIo) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let n = (self.prefix.len() - self.pos).min(buf.remaining());
            let pos = self.pos;
            buf.put_slice(&self.prefix[pos..pos + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Http2Settings;
    use crate::config::TlsTrust;

    fn connector_with(settings: Http2Settings, window: u32) -> Connector {
        let options = Arc::new(Options {
            initial_settings: settings,
            http2_connection_window_size: window,
            ..Options::default()
        });
        let tls = Arc::new(TlsHelper::new(TlsTrust::Insecure));
        Connector::new(options, tls, Logger::disabled())
    }

    #[test]
    fn settings_payload_is_six_bytes_per_entry() {
        let settings = Http2Settings {
            max_concurrent_streams: Some(100),
            initial_window_size: Some(65535),
            ..Http2Settings::default()
        };
        let connector = connector_with(settings, 0);
        let payload = encode_settings_payload(&connector.options);
        assert_eq!(payload.len(), 12);
        assert_eq!(&payload[..2], &0x3u16.to_be_bytes());
        assert_eq!(&payload[2..6], &100u32.to_be_bytes());
        assert_eq!(&payload[6..8], &0x4u16.to_be_bytes());
    }

    #[test]
    fn connection_window_fills_in_for_unset_initial_window() {
        let connector = connector_with(Http2Settings::default(), 1 << 20);
        let payload = encode_settings_payload(&connector.options);
        assert_eq!(&payload[..2], &0x4u16.to_be_bytes());
        assert_eq!(&payload[2..6], &(1u32 << 20).to_be_bytes());
    }

    #[test]
    fn upgrade_request_appends_port_unless_default() {
        let connector = connector_with(Http2Settings::default(), 0);
        let req = connector.upgrade_request("example.com", 8080);
        assert!(req.contains("Host: example.com:8080\r\n"));
        assert!(req.contains("Upgrade: h2c\r\n"));
        let req = connector.upgrade_request("example.com", 80);
        assert!(req.contains("Host: example.com\r\n"));
    }

    #[tokio::test]
    async fn head_parser_reports_status_and_leftover() {
        let (client, server) = tokio::io::duplex(1024);
        let mut io: ChannelIo = Box::pin(client);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server
                .write_all(b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\n\r\n\x00\x01")
                .await
                .unwrap();
        });
        let head = read_response_head(&mut io, &Options::default()).await.unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(head.header("connection"), Some("Upgrade"));
        assert_eq!(head.leftover, vec![0x00, 0x01]);
    }

    #[tokio::test]
    async fn body_drain_handles_content_length() {
        let (client, server) = tokio::io::duplex(1024);
        let mut io: ChannelIo = Box::pin(client);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
                .await
                .unwrap();
        });
        let options = Options::default();
        let head = read_response_head(&mut io, &options).await.unwrap();
        assert_eq!(head.status, 200);
        let leftover = drain_response_body(&mut io, &head, &options).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn body_drain_handles_chunked() {
        let (client, server) = tokio::io::duplex(1024);
        let mut io: ChannelIo = Box::pin(client);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut server = server;
            server
                .write_all(
                    b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
                )
                .await
                .unwrap();
        });
        let options = Options::default();
        let head = read_response_head(&mut io, &options).await.unwrap();
        let leftover = drain_response_body(&mut io, &head, &options).await.unwrap();
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn prefixed_io_replays_before_reading() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut io = PrefixedIo::new(vec![1, 2, 3], Box::pin(client));
        let mut buf = [0u8; 2];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [1, 2]);
        let mut buf = [0u8; 1];
        io.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [3]);
    }
}
