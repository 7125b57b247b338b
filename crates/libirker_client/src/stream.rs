use std::fs::File;
use std::io;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName};

pub type TlsError = rustls::Error;

#[derive(Debug)]
pub enum StreamError {
    Io(io::Error),
    Tls(TlsError),
    /// A `--ca-file` or `--cert-file` whose contents couldn't be used.
    BadPem(String),
}

impl From<io::Error> for StreamError {
    fn from(err: io::Error) -> Self {
        StreamError::Io(err)
    }
}

impl From<TlsError> for StreamError {
    fn from(err: TlsError) -> Self {
        StreamError::Tls(err)
    }
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            StreamError::Io(err) => write!(f, "{}", err),
            StreamError::Tls(err) => write!(f, "TLS error: {}", err),
            StreamError::BadPem(msg) => write!(f, "{}", msg),
        }
    }
}

/// TLS settings shared by all `ircs://` sessions.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// File of trusted certificates to use instead of the system trust store.
    pub ca_file: Option<PathBuf>,

    /// PEM file (certificate chain plus PKCS8 private key) used to authenticate to the server.
    pub cert_file: Option<PathBuf>,
}

// The variants are boxed to keep the type small; rustls streams are large.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(Box<TcpStream>),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Stream {
    pub(crate) async fn new_tcp(addr: SocketAddr) -> Result<Stream, StreamError> {
        Ok(Stream::Tcp(TcpStream::connect(addr).await?.into()))
    }

    /// Connects and runs the TLS handshake. The server name is sent in SNI, and rustls verifies
    /// both the chain and the hostname against it.
    pub(crate) async fn new_tls(
        addr: SocketAddr,
        host_name: &str,
        opts: &TlsOptions,
    ) -> Result<Stream, StreamError> {
        let config = client_config(opts)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let name = ServerName::try_from(host_name.to_owned())
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
        let tcp_stream = TcpStream::connect(addr).await?;
        let tls_stream = connector.connect(name, tcp_stream).await?;
        Ok(Stream::Tls(tls_stream.into()))
    }
}

fn client_config(opts: &TlsOptions) -> Result<rustls::ClientConfig, StreamError> {
    let mut roots = rustls::RootCertStore::empty();
    match &opts.ca_file {
        Some(path) => {
            for cert in read_certs(path)? {
                roots.add(cert)?;
            }
        }
        None => {
            for cert in rustls_native_certs::load_native_certs()? {
                // Unusable platform certificates are skipped rather than refusing to start.
                let _ = roots.add(cert);
            }
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);
    let config = match &opts.cert_file {
        None => builder.with_no_client_auth(),
        Some(path) => {
            let certs = read_certs(path)?;
            let mut reader = open_pem(path)?;
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|err| StreamError::BadPem(format!("can't read key from {:?}: {}", path, err)))?
                .ok_or_else(|| StreamError::BadPem(format!("no private key in {:?}", path)))?;
            builder.with_client_auth_cert(certs, key)?
        }
    };
    Ok(config)
}

fn open_pem(path: &PathBuf) -> Result<BufReader<File>, StreamError> {
    let file = File::open(path)
        .map_err(|err| StreamError::BadPem(format!("can't open {:?}: {}", path, err)))?;
    Ok(BufReader::new(file))
}

fn read_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, StreamError> {
    let mut reader = open_pem(path)?;
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut reader) {
        certs.push(cert.map_err(|err| {
            StreamError::BadPem(format!("can't read certificate from {:?}: {}", path, err))
        })?);
    }
    if certs.is_empty() {
        return Err(StreamError::BadPem(format!("no certificates in {:?}", path)));
    }
    Ok(certs)
}

//
// Boilerplate
//

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_read(cx, buf),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_write(cx, buf),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_flush(cx),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), io::Error>> {
        match *self {
            Stream::Tcp(ref mut tcp_stream) => Pin::new(tcp_stream).poll_shutdown(cx),
            Stream::Tls(ref mut tls_stream) => Pin::new(tls_stream).poll_shutdown(cx),
        }
    }
}
