use anyhow::{bail, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_REFUSED: u8 = 0x05;
const REPLY_CMD_UNSUPPORTED: u8 = 0x07;

/// Loopback SOCKS5 relay for browser traffic.
///
/// CONNECT only, no authentication, binds loopback. The browser cannot pass
/// credentials on its proxy flag, so sessions point at this relay instead
/// when no upstream proxy is configured.
pub struct ProxyServer {
    port: u16,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Bind the listener and start the accept loop. Port 0 binds an
    /// ephemeral port, reported by [`port`](Self::port).
    pub async fn start(port: u16, shutdown: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("failed to bind local proxy on port {port}"))?;
        let port = listener
            .local_addr()
            .context("local proxy has no bound address")?
            .port();

        info!(port, "local proxy listening");

        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("local proxy stopped");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "proxy client connected");
                            tokio::spawn(async move {
                                if let Err(e) = relay_client(stream).await {
                                    debug!(%peer, error = %e, "proxy relay ended");
                                }
                            });
                        }
                        Err(e) => warn!(error = %e, "proxy accept failed"),
                    }
                }
            }
        });

        Ok(Self { port, shutdown })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address in the form browser proxy flags expect.
    pub fn address(&self) -> String {
        format!("localhost:{}", self.port)
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }
}

async fn relay_client(mut client: TcpStream) -> Result<()> {
    negotiate_method(&mut client).await?;

    let (host, port) = match read_connect_request(&mut client).await {
        Ok(dest) => dest,
        Err(e) => {
            let _ = write_reply(&mut client, REPLY_CMD_UNSUPPORTED).await;
            return Err(e);
        }
    };

    let mut upstream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            let _ = write_reply(&mut client, REPLY_REFUSED).await;
            return Err(e).with_context(|| format!("connect to {host}:{port}"));
        }
    };

    write_reply(&mut client, REPLY_SUCCESS).await?;
    debug!(%host, port, "proxy tunnel open");

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((up, down)) => debug!(%host, port, up, down, "proxy tunnel closed"),
        Err(e) => debug!(%host, port, error = %e, "proxy tunnel aborted"),
    }
    Ok(())
}

/// Greeting: `[ver, nmethods, methods...]`. Only no-auth is offered back.
async fn negotiate_method(stream: &mut TcpStream) -> Result<()> {
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported socks version {}", header[0]);
    }

    let mut methods = vec![0u8; header[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&METHOD_NO_AUTH) {
        stream.write_all(&[SOCKS_VERSION, 0xFF]).await?;
        bail!("client offered no acceptable auth method");
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Request: `[ver, cmd, rsv, atyp, dst..., port]`. CONNECT only.
async fn read_connect_request(stream: &mut TcpStream) -> Result<(String, u16)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        bail!("unsupported socks version {}", header[0]);
    }
    if header[1] != CMD_CONNECT {
        bail!("unsupported socks command {}", header[1]);
    }

    let host = match header[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).context("destination name is not utf-8")?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            std::net::Ipv6Addr::from(octets).to_string()
        }
        other => bail!("unsupported address type {other}"),
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

async fn write_reply(stream: &mut TcpStream, code: u8) -> Result<()> {
    // Bound address field is zeroed; clients do not use it for CONNECT.
    let reply = [
        SOCKS_VERSION,
        code,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 {
                            break;
                        }
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    async fn socks_connect(proxy_port: u16, dest: std::net::SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();

        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS_VERSION, METHOD_NO_AUTH]);

        let ip = match dest.ip() {
            std::net::IpAddr::V4(v4) => v4.octets(),
            std::net::IpAddr::V6(_) => panic!("test uses ipv4"),
        };
        let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00, ATYP_IPV4];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&dest.port().to_be_bytes());
        stream.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);
        stream
    }

    #[tokio::test]
    async fn relays_connect_traffic_end_to_end() {
        let echo = spawn_echo_server().await;
        let shutdown = CancellationToken::new();
        let proxy = ProxyServer::start(0, shutdown.clone()).await.unwrap();

        let mut tunnel = socks_connect(proxy.port(), echo).await;
        tunnel.write_all(b"ping through tunnel").await.unwrap();

        let mut buf = [0u8; 19];
        tunnel.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping through tunnel");

        proxy.stop();
    }

    #[tokio::test]
    async fn rejects_non_connect_commands() {
        let shutdown = CancellationToken::new();
        let proxy = ProxyServer::start(0, shutdown.clone()).await.unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", proxy.port())).await.unwrap();
        stream
            .write_all(&[SOCKS_VERSION, 1, METHOD_NO_AUTH])
            .await
            .unwrap();
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await.unwrap();

        // BIND is not supported.
        stream
            .write_all(&[SOCKS_VERSION, 0x02, 0x00, ATYP_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_CMD_UNSUPPORTED);

        proxy.stop();
    }

    #[tokio::test]
    async fn address_is_browser_flag_shaped() {
        let shutdown = CancellationToken::new();
        let proxy = ProxyServer::start(0, shutdown.clone()).await.unwrap();
        assert_eq!(proxy.address(), format!("localhost:{}", proxy.port()));
        proxy.stop();
    }
}
