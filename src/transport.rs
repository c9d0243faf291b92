//! Socket establishment: endpoint parsing, TCP connect, optional TLS.
//!
//! A `ws://` endpoint yields a plain TCP stream, a `wss://` endpoint a
//! rustls-wrapped one. TLS behavior (protocol version pinning, peer
//! verification) comes from [`TlsOptions`].

use crate::config::{TlsOptions, TlsVersion};
use crate::error::{LiveQueryError, Result};
use rustls::pki_types::ServerName;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// A parsed `ws://` / `wss://` endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal.
    pub host: String,
    /// TCP port (defaulted from the scheme when absent).
    pub port: u16,
    /// Request path including any query string.
    pub path: String,
    /// Whether the connection is TLS-wrapped.
    pub tls: bool,
}

impl Endpoint {
    /// Value for the HTTP `Host` header.
    pub fn host_header(&self) -> String {
        let default_port = if self.tls { 443 } else { 80 };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `host:port` pair for the TCP dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse a `ws://host[:port][/path]` or `wss://…` endpoint URL.
pub fn parse_endpoint(url: &str) -> Result<Endpoint> {
    let (tls, rest) = if let Some(rest) = url.strip_prefix("ws://") {
        (false, rest)
    } else if let Some(rest) = url.strip_prefix("wss://") {
        (true, rest)
    } else {
        return Err(LiveQueryError::Config(format!(
            "endpoint must start with ws:// or wss://, got {:?}",
            url
        )));
    };

    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    if authority.is_empty() {
        return Err(LiveQueryError::Config("endpoint is missing a host".into()));
    }

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port: u16 = port.parse().map_err(|_| {
                LiveQueryError::Config(format!("invalid port in endpoint {:?}", url))
            })?;
            (host.to_string(), port)
        }
        _ => (authority.to_string(), if tls { 443 } else { 80 }),
    };

    Ok(Endpoint { host, port, path, tls })
}

/// The connected socket, plain or TLS-wrapped.
pub enum Stream {
    /// Cleartext TCP.
    Plain(TcpStream),
    /// TLS over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Open the socket for an endpoint, bounded by `timeout`.
pub async fn connect(endpoint: &Endpoint, tls: &TlsOptions, timeout: Duration) -> Result<Stream> {
    let address = endpoint.address();
    let tcp = tokio::time::timeout(timeout, TcpStream::connect(&address))
        .await
        .map_err(|_| LiveQueryError::Timeout(format!("connecting to {} exceeded {:?}", address, timeout)))??;
    tcp.set_nodelay(true)?;

    if !endpoint.tls {
        return Ok(Stream::Plain(tcp));
    }

    let connector = TlsConnector::from(Arc::new(tls_config(tls)?));
    let server_name = ServerName::try_from(endpoint.host.clone())
        .map_err(|_| LiveQueryError::Config(format!("invalid TLS host name {:?}", endpoint.host)))?;
    let stream = tokio::time::timeout(timeout, connector.connect(server_name, tcp))
        .await
        .map_err(|_| LiveQueryError::Timeout(format!("TLS handshake with {} exceeded {:?}", address, timeout)))??;
    Ok(Stream::Tls(Box::new(stream)))
}

fn tls_config(options: &TlsOptions) -> Result<rustls::ClientConfig> {
    let versions = selected_versions(options)?;
    let builder = rustls::ClientConfig::builder_with_protocol_versions(&versions);
    let config = if options.verify_peer {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };
    Ok(config)
}

fn selected_versions(
    options: &TlsOptions,
) -> Result<Vec<&'static rustls::SupportedProtocolVersion>> {
    let all = [
        (TlsVersion::Tls12, &rustls::version::TLS12),
        (TlsVersion::Tls13, &rustls::version::TLS13),
    ];
    let versions: Vec<_> = all
        .into_iter()
        .filter(|(version, _)| {
            options.min_version.map_or(true, |min| *version >= min)
                && options.max_version.map_or(true, |max| *version <= max)
        })
        .map(|(_, supported)| supported)
        .collect();
    if versions.is_empty() {
        return Err(LiveQueryError::Config(
            "TLS min_version/max_version leave no protocol version enabled".into(),
        ));
    }
    Ok(versions)
}

/// Certificate verifier that accepts anything; used only when
/// `verify_peer` is explicitly disabled for test environments.
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_endpoint() {
        let ep = parse_endpoint("ws://localhost:8080/livequery").unwrap();
        assert_eq!(ep.host, "localhost");
        assert_eq!(ep.port, 8080);
        assert_eq!(ep.path, "/livequery");
        assert!(!ep.tls);
        assert_eq!(ep.host_header(), "localhost:8080");
        assert_eq!(ep.address(), "localhost:8080");
    }

    #[test]
    fn test_parse_defaults_port_and_path() {
        let ep = parse_endpoint("ws://example.com").unwrap();
        assert_eq!(ep.port, 80);
        assert_eq!(ep.path, "/");
        assert_eq!(ep.host_header(), "example.com");

        let ep = parse_endpoint("wss://example.com").unwrap();
        assert_eq!(ep.port, 443);
        assert!(ep.tls);
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(parse_endpoint("http://example.com").is_err());
        assert!(parse_endpoint("example.com:8080").is_err());
        assert!(parse_endpoint("ws://").is_err());
        assert!(parse_endpoint("ws://host:notaport/").is_err());
    }

    #[test]
    fn test_version_selection() {
        let options = TlsOptions::default();
        assert_eq!(selected_versions(&options).unwrap().len(), 2);

        let only_13 = TlsOptions::default().with_min_version(TlsVersion::Tls13);
        let versions = selected_versions(&only_13).unwrap();
        assert_eq!(versions.len(), 1);

        let only_12 = TlsOptions::default().with_max_version(TlsVersion::Tls12);
        assert_eq!(selected_versions(&only_12).unwrap().len(), 1);

        let impossible = TlsOptions::default()
            .with_min_version(TlsVersion::Tls13)
            .with_max_version(TlsVersion::Tls12);
        assert!(selected_versions(&impossible).is_err());
    }
}
