//! Plain TCP and TLS sockets of a connection.
use crate::client_error;
use crate::config::{CertRequirement, ConnectionConfig, TlsOptions, TlsVersion};
use crate::error::{ClientError, ErrorKind};
use anyhow::Result;
use log::{debug, warn};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::{self, CryptoProvider},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tokio_rustls::TlsConnector;

/// Byte stream a connection runs on.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type Transport = Box<dyn AsyncStream>;

static TLS12_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Open the socket described by the config, with TLS if `ssl` is set.
pub(crate) async fn connect(config: &ConnectionConfig) -> Result<Transport> {
    let port = config.port_or_default();

    debug!("Connecting to {}:{}", config.hostname, port);

    let socket = TcpStream::connect((config.hostname.as_str(), port))
        .await
        .map_err(ClientError::from)?;
    socket.set_nodelay(true)?;

    if !config.ssl {
        return Ok(Box::new(socket));
    }

    let connector = TlsConnector::from(Arc::new(tls_client_config(&config.ssl_options)?));

    let server_name = match ServerName::try_from(config.hostname.clone()) {
        Ok(name) => name,
        Err(_) => {
            return client_error!(
                ErrorKind::Configuration,
                None,
                0,
                format!("Invalid TLS server name {}", config.hostname),
                0
            )
        }
    };

    let stream = connector.connect(server_name, socket).await.map_err(ClientError::from)?;

    Ok(Box::new(stream))
}

fn configuration_error<T>(message: String) -> Result<T> {
    client_error!(ErrorKind::Configuration, None, 0, message, 0)
}

pub(crate) fn tls_client_config(options: &TlsOptions) -> Result<ClientConfig> {
    let provider = Arc::new(crypto::ring::default_provider());

    let versions = match options.ssl_version {
        Some(TlsVersion::Tls12) => TLS12_ONLY,
        Some(TlsVersion::Tls13) => TLS13_ONLY,
        None => rustls::DEFAULT_VERSIONS,
    };

    let builder = match ClientConfig::builder_with_provider(provider.clone()).with_protocol_versions(versions) {
        Ok(builder) => builder,
        Err(e) => return configuration_error(format!("ssl_options: {}", e)),
    };

    let verify = match options.cert_reqs {
        CertRequirement::None => false,
        CertRequirement::Optional => options.ca_certs.is_some(),
        CertRequirement::Required => true,
    };

    let builder = if verify {
        builder.with_root_certificates(root_store(options)?)
    } else {
        warn!("Server certificate is not verified");

        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerification(provider)))
    };

    match (&options.certfile, &options.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let certs = load_certs(certfile)?;
            let key = load_key(keyfile)?;

            match builder.with_client_auth_cert(certs, key) {
                Ok(config) => Ok(config),
                Err(e) => configuration_error(format!("ssl_options: invalid client certificate: {}", e)),
            }
        }
        _ => Ok(builder.with_no_client_auth()),
    }
}

fn root_store(options: &TlsOptions) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match &options.ca_certs {
        Some(path) => {
            for cert in load_certs(path)? {
                if let Err(e) = roots.add(cert) {
                    return configuration_error(format!("ssl_options: invalid CA certificate: {}", e));
                }
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<std::result::Result<Vec<_>, _>>()?;

    if certs.is_empty() {
        return configuration_error(format!("ssl_options: no certificate in {}", path.display()));
    }

    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);

    match rustls_pemfile::private_key(&mut reader)? {
        Some(key) => Ok(key),
        None => configuration_error(format!("ssl_options: no private key in {}", path.display())),
    }
}

/// Accepts any server certificate, signatures are still checked.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
