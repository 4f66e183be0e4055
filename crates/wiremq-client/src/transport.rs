//! Transport layer: one ordered, reliable byte stream per connection.
//!
//! Three flavors behind one enum: plain TCP, TLS over TCP, and MQTT over
//! WebSocket (binary frames, `mqtt` subprotocol), the latter optionally
//! TLS-wrapped. Closure is always reported as a zero-length read, never
//! swallowed.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

use crate::config::{ClientConfig, TlsConfig, TransportKind};
use crate::error::{ClientError, Result};

/// An open byte stream to the broker.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    Ws(Box<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

impl Transport {
    /// Open a transport per the configuration, within the connect timeout.
    pub async fn open(config: &ClientConfig) -> Result<Self> {
        match config.transport {
            TransportKind::Tcp => Self::open_tcp(config).await,
            TransportKind::Ws => Self::open_ws(config).await,
        }
    }

    async fn open_tcp(config: &ClientConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)?
            .map_err(ClientError::Io)?;
        stream.set_nodelay(true).map_err(ClientError::Io)?;

        if !config.tls.enabled {
            return Ok(Transport::Tcp(stream));
        }

        let connector = TlsConnector::from(Arc::new(build_tls_config(&config.tls)?));
        let sni = config
            .tls
            .server_name
            .clone()
            .unwrap_or_else(|| config.host.clone());
        let server_name = ServerName::try_from(sni.clone())
            .map_err(|_| ClientError::Tls(format!("invalid server name: {sni}")))?;

        let tls_stream =
            tokio::time::timeout(config.connect_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| ClientError::ConnectionTimeout)?
                .map_err(|e| ClientError::Tls(e.to_string()))?;

        Ok(Transport::Tls(Box::new(tls_stream)))
    }

    async fn open_ws(config: &ClientConfig) -> Result<Self> {
        let scheme = if config.tls.enabled { "wss" } else { "ws" };
        let url = format!("{scheme}://{}:{}/mqtt", config.host, config.port);

        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Config(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));

        let connector = if config.tls.enabled {
            Some(Connector::Rustls(Arc::new(build_tls_config(&config.tls)?)))
        } else {
            None
        };

        let (ws, _response) = tokio::time::timeout(
            config.connect_timeout,
            connect_async_tls_with_config(request, None, true, connector),
        )
        .await
        .map_err(|_| ClientError::ConnectionTimeout)?
        .map_err(|e| ClientError::Io(io::Error::other(e)))?;

        Ok(Transport::Ws(Box::new(ws)))
    }

    /// Read available bytes into `buf`. Returns 0 on orderly closure.
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        match self {
            Transport::Tcp(stream) => stream.read_buf(buf).await,
            Transport::Tls(stream) => stream.read_buf(buf).await,
            Transport::Ws(ws) => loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) if !data.is_empty() => {
                        buf.extend_from_slice(&data);
                        return Ok(data.len());
                    }
                    // Control frames and empty payloads carry no MQTT bytes.
                    Some(Ok(Message::Binary(_)))
                    | Some(Ok(Message::Ping(_)))
                    | Some(Ok(Message::Pong(_)))
                    | Some(Ok(Message::Text(_)))
                    | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Ok(0),
                    Some(Err(e)) => return Err(io::Error::other(e)),
                }
            },
        }
    }

    /// Write the whole buffer to the stream.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Transport::Tcp(stream) => stream.write_all(data).await,
            Transport::Tls(stream) => stream.write_all(data).await,
            Transport::Ws(ws) => ws
                .send(Message::Binary(data.to_vec()))
                .await
                .map_err(io::Error::other),
        }
    }

    /// Close the stream, ignoring shutdown races.
    pub async fn close(&mut self) {
        match self {
            Transport::Tcp(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Tls(stream) => {
                let _ = stream.shutdown().await;
            }
            Transport::Ws(ws) => {
                let _ = ws.close(None).await;
            }
        }
    }
}

/// Build a rustls client config from our TLS settings.
pub fn build_tls_config(config: &TlsConfig) -> Result<rustls::ClientConfig> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};
    use rustls::RootCertStore;
    use std::fs::File;
    use std::io::BufReader;

    if config.accept_invalid_certs {
        return Ok(rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification))
            .with_no_client_auth());
    }

    let mut root_store = RootCertStore::empty();
    if let Some(ca_path) = &config.ca_cert {
        let file = File::open(ca_path)
            .map_err(|e| ClientError::Tls(format!("failed to open CA cert: {e}")))?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Tls(format!("failed to parse CA cert: {e}")))?;
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| ClientError::Tls(format!("failed to add CA cert: {e}")))?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);

    let tls_config = if let (Some(cert_path), Some(key_path)) =
        (&config.client_cert, &config.client_key)
    {
        let cert_file = File::open(cert_path)
            .map_err(|e| ClientError::Tls(format!("failed to open client cert: {e}")))?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| ClientError::Tls(format!("failed to parse client cert: {e}")))?;

        let key_file = File::open(key_path)
            .map_err(|e| ClientError::Tls(format!("failed to open client key: {e}")))?;
        let mut key_reader = BufReader::new(key_file);
        let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
            .map_err(|e| ClientError::Tls(format!("failed to parse client key: {e}")))?
            .ok_or_else(|| ClientError::Tls("no private key found in file".to_string()))?;

        builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ClientError::Tls(format!("failed to configure client auth: {e}")))?
    } else {
        builder.with_no_client_auth()
    };

    Ok(tls_config)
}

/// Danger: accepts any server certificate. Testing only.
#[derive(Debug)]
struct NoCertificateVerification;

impl rustls::client::danger::ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
