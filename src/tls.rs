use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// PEM certificate chain and private key for the listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TlsPaths {
    /// TLS is on only when both paths are given; one without the other is a
    /// configuration error.
    pub fn from_pair(cert: Option<String>, key: Option<String>) -> io::Result<Option<Self>> {
        match (cert, key) {
            (None, None) => Ok(None),
            (Some(cert), Some(key)) => Ok(Some(Self {
                cert: cert.into(),
                key: key.into(),
            })),
            _ => Err(io::Error::new(
                ErrorKind::InvalidInput,
                "ROOMBOOK_TLS_CERT and ROOMBOOK_TLS_KEY must be set together",
            )),
        }
    }

    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<_, _>>()?;
        if certs.is_empty() {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                format!("no certificates in {}", self.cert.display()),
            ));
        }

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?
            .ok_or_else(|| {
                io::Error::new(
                    ErrorKind::InvalidInput,
                    format!("no private key in {}", self.key.display()),
                )
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;
        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Acceptor for the configured pair, or `None` when TLS is off.
pub fn load_tls_acceptor(
    cert: Option<String>,
    key: Option<String>,
) -> io::Result<Option<TlsAcceptor>> {
    TlsPaths::from_pair(cert, key)?
        .map(|paths| paths.acceptor())
        .transpose()
}
