//! TLS acceptance and handshake failure monitoring.
//!
//! The monitor observes TLS negotiation on inbound connections before any
//! HTTP parsing happens. A failed handshake is classified from the
//! observable rejection mode and published as a `tlsClientError` event with
//! a fresh failure record; no request record exists at that point, so there
//! is nothing to correlate with. Successful handshakes emit nothing.

use anyhow::Context;
use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tracing::{debug, info};

use crate::events::{FailureCause, ProxyEvent, TlsFailureRecord};
use crate::hub::NotificationHub;
use crate::metrics::TLS_FAILURES_TOTAL;

/// Ceiling on how long a client may take to finish the handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a rustls server config from PEM certificate and key files.
pub fn load_server_config(cert_path: &str, key_path: &str) -> Result<Arc<ServerConfig>, anyhow::Error> {
    let cert_file = std::fs::File::open(cert_path)
        .with_context(|| format!("failed to open certificate file '{cert_path}'"))?;
    let mut cert_reader = io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<Result<_, _>>()
        .context("failed to parse certificate file")?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in '{cert_path}'");
    }

    let key_file = std::fs::File::open(key_path)
        .with_context(|| format!("failed to open private key file '{key_path}'"))?;
    let mut key_reader = io::BufReader::new(key_file);
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse private key file")?
        .ok_or_else(|| anyhow::anyhow!("no private key found in '{key_path}'"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build TLS configuration")?;

    Ok(Arc::new(config))
}

/// Classify a handshake failure from the transport-visible signal.
///
/// The set of causes is open: clients keep inventing new ways to abandon a
/// handshake, so anything unrecognized is preserved as `Unknown` with its
/// detail instead of being forced into a fixed bucket.
pub fn classify_failure(error: &io::Error) -> FailureCause {
    match error.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => return FailureCause::Reset,
        io::ErrorKind::UnexpectedEof => return FailureCause::Closed,
        io::ErrorKind::TimedOut => return FailureCause::HandshakeTimeout,
        _ => {}
    }

    let detail = error.to_string();
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("certificate") || lowered.contains("unknownca") || lowered.contains("unknown ca")
    {
        FailureCause::CertRejected
    } else if lowered.contains("cipher") {
        FailureCause::NoSharedCipher
    } else if lowered.contains("close_notify") || lowered.contains("closed") {
        FailureCause::Closed
    } else {
        FailureCause::Unknown(detail)
    }
}

/// Observes TLS negotiation on inbound connections and reports failures.
pub struct TlsMonitor {
    config: Arc<ServerConfig>,
    hub: Arc<NotificationHub>,
}

impl TlsMonitor {
    pub fn new(config: Arc<ServerConfig>, hub: Arc<NotificationHub>) -> Self {
        TlsMonitor { config, hub }
    }

    /// Drive the handshake for one inbound connection.
    ///
    /// Returns the established stream and the SNI value the client
    /// offered. On failure, publishes a `tlsClientError` event and returns
    /// `None`; the caller just drops the connection.
    pub async fn accept(
        &self,
        stream: TcpStream,
        remote: SocketAddr,
    ) -> Option<(TlsStream<TcpStream>, Option<String>)> {
        let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);

        let start = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor).await {
            Ok(Ok(start)) => start,
            Ok(Err(error)) => {
                self.report(classify_failure(&error), None, remote);
                return None;
            }
            Err(_) => {
                self.report(FailureCause::HandshakeTimeout, None, remote);
                return None;
            }
        };

        // The ClientHello is visible now, so the SNI survives even if the
        // client rejects our certificate a round-trip later.
        let sni = start.client_hello().server_name().map(str::to_string);

        match tokio::time::timeout(HANDSHAKE_TIMEOUT, start.into_stream(Arc::clone(&self.config)))
            .await
        {
            Ok(Ok(tls_stream)) => {
                debug!(%remote, sni = sni.as_deref().unwrap_or("-"), "TLS handshake complete");
                Some((tls_stream, sni))
            }
            Ok(Err(error)) => {
                self.report(classify_failure(&error), sni, remote);
                None
            }
            Err(_) => {
                self.report(FailureCause::HandshakeTimeout, sni, remote);
                None
            }
        }
    }

    fn report(&self, cause: FailureCause, hostname: Option<String>, remote: SocketAddr) {
        TLS_FAILURES_TOTAL
            .with_label_values(&[cause.as_str()])
            .inc();
        info!(
            %remote,
            cause = cause.as_str(),
            sni = hostname.as_deref().unwrap_or("-"),
            "TLS handshake failed"
        );
        self.hub.publish(ProxyEvent::TlsClientError(TlsFailureRecord {
            failure_cause: cause,
            hostname,
            remote_ip_address: remote.ip().to_string(),
            tags: Vec::new(),
        }));
    }
}
