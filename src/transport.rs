//! Byte stream to the server: plain TCP or TLS over TCP.
//!
//! TLS needs a crypto provider. It is built once per process by [`init`] and
//! released when the last [`LibraryGuard`] is dropped.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
    ring, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

/// Anything the session can read from and write to.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

// ============================================================================
// Library lifetime
// ============================================================================

struct LibraryState {
    users: usize,
    provider: Option<Arc<CryptoProvider>>,
}

static LIBRARY: Lazy<Mutex<LibraryState>> = Lazy::new(|| {
    Mutex::new(LibraryState {
        users: 0,
        provider: None,
    })
});

/// Keeps the transport library initialised while alive.
#[derive(Debug)]
pub struct LibraryGuard {
    provider: Arc<CryptoProvider>,
}

/// Initialise the transport library, or join an existing initialisation.
pub fn init() -> LibraryGuard {
    let mut state = LIBRARY.lock();
    let provider = match &state.provider {
        Some(provider) => provider.clone(),
        None => {
            debug!("initialising transport library");
            let provider = Arc::new(ring::default_provider());
            state.provider = Some(provider.clone());
            provider
        }
    };
    state.users += 1;
    LibraryGuard { provider }
}

/// Number of live guards.
pub fn library_users() -> usize {
    LIBRARY.lock().users
}

impl Clone for LibraryGuard {
    fn clone(&self) -> Self {
        LIBRARY.lock().users += 1;
        Self {
            provider: self.provider.clone(),
        }
    }
}

impl Drop for LibraryGuard {
    fn drop(&mut self) {
        let mut state = LIBRARY.lock();
        state.users = state.users.saturating_sub(1);
        if state.users == 0 {
            debug!("tearing down transport library");
            state.provider = None;
        }
    }
}

// ============================================================================
// Connect
// ============================================================================

/// Open a stream to `host:port`, wrapped in TLS when `ssl` is set.
pub async fn connect(
    library: &LibraryGuard,
    host: &str,
    port: u16,
    ssl: bool,
    verify: bool,
) -> io::Result<BoxedTransport> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;

    if !ssl {
        info!(host, port, "connected");
        return Ok(Box::new(stream));
    }

    let config = tls_config(library.provider.clone(), verify)?;
    let connector = TlsConnector::from(Arc::new(config));
    let tls = connector.connect(server_name(host)?, stream).await?;
    info!(host, port, verify, "connected over TLS");
    Ok(Box::new(tls))
}

fn tls_config(provider: Arc<CryptoProvider>, verify: bool) -> io::Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_error)?;

    let config = if verify {
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert(provider)))
            .with_no_client_auth()
    };
    Ok(config)
}

fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::from(ip));
    }
    ServerName::try_from(host.to_string()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid server name: {e}"),
        )
    })
}

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Certificate verifier for self-signed servers: checks signatures only.
#[derive(Debug)]
struct AcceptAnyCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
