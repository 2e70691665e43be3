//! rustls behind the wrap/unwrap engine contract.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, Connection, RootCertStore, ServerConfig, ServerConnection};
use rustls_pki_types::pem::PemObject;
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;

use crate::tls::{
    DelegatedTask, EngineResult, HandshakeStatus, Status, TlsEngine, TlsEngineFactory, TlsError,
};

/// Largest TLS record on the wire: 16 KiB plaintext plus header and
/// expansion.
const MAX_RECORD_SIZE: usize = 16 * 1024 + 325;

/// Largest plaintext fragment in a record.
const MAX_FRAGMENT_SIZE: usize = 16 * 1024;

pub struct RustlsEngine {
    conn: Connection,
    handshaking: bool,
    outbound_closed: bool,
    peer_closed: bool,
    /// rustls holds decrypted bytes that did not fit the last buffer.
    plaintext_pending: bool,
}

impl RustlsEngine {
    pub fn server(config: Arc<ServerConfig>) -> Result<Self, TlsError> {
        Ok(Self::from_connection(ServerConnection::new(config)?.into()))
    }

    pub fn client(config: Arc<ClientConfig>, server_name: ServerName<'static>) -> Result<Self, TlsError> {
        Ok(Self::from_connection(
            ClientConnection::new(config, server_name)?.into(),
        ))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            handshaking: true,
            outbound_closed: false,
            peer_closed: false,
            plaintext_pending: false,
        }
    }

    /// Report `Finished` exactly once.
    fn transition(&mut self) -> HandshakeStatus {
        if self.handshaking && !self.conn.is_handshaking() {
            self.handshaking = false;
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }

    fn read_plaintext(&mut self, dst: &mut [u8]) -> Result<usize, TlsError> {
        let mut filled = 0;
        while filled < dst.len() {
            match self.conn.reader().read(&mut dst[filled..]) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        self.plaintext_pending = if filled == dst.len() && filled > 0 {
            self.conn.process_new_packets()?.plaintext_bytes_to_read() > 0
        } else {
            false
        };
        Ok(filled)
    }
}

impl TlsEngine for RustlsEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        // rustls starts on construction; a client's hello is already queued.
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        let mut consumed = 0;
        if !src.is_empty() {
            if self.outbound_closed {
                return Err(TlsError::Closed);
            }
            consumed = self.conn.writer().write(src)?;
        }

        let mut produced = 0;
        while self.conn.wants_write() && produced < dst.len() {
            let mut window = &mut dst[produced..];
            let n = self.conn.write_tls(&mut window)?;
            if n == 0 {
                break;
            }
            produced += n;
        }

        let status = if self.conn.wants_write() {
            Status::BufferOverflow
        } else if self.outbound_closed {
            Status::Closed
        } else {
            Status::Ok
        };
        Ok(EngineResult {
            status,
            handshake_status: self.transition(),
            bytes_consumed: consumed,
            bytes_produced: produced,
        })
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        // Plaintext left over from an overflow is drained before new input.
        let mut produced = if self.plaintext_pending {
            self.read_plaintext(dst)?
        } else {
            0
        };

        let mut consumed = 0;
        if !self.plaintext_pending && !self.peer_closed && !src.is_empty() {
            let mut reader = src;
            consumed = self.conn.read_tls(&mut reader)?;
            let state = self.conn.process_new_packets()?;
            if state.peer_has_closed() && state.plaintext_bytes_to_read() == 0 {
                self.peer_closed = true;
            }
            if state.plaintext_bytes_to_read() > 0 {
                produced += self.read_plaintext(&mut dst[produced..])?;
            }
        }

        let status = if self.plaintext_pending {
            Status::BufferOverflow
        } else if self.peer_closed {
            Status::Closed
        } else if consumed == 0 && produced == 0 && !src.is_empty() {
            Status::BufferUnderflow
        } else {
            Status::Ok
        };
        Ok(EngineResult {
            status,
            handshake_status: self.transition(),
            bytes_consumed: consumed,
            bytes_produced: produced,
        })
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.conn.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn packet_buffer_size(&self) -> usize {
        MAX_RECORD_SIZE
    }

    fn application_buffer_size(&self) -> usize {
        MAX_FRAGMENT_SIZE
    }

    fn close_outbound(&mut self) {
        if !self.outbound_closed {
            self.outbound_closed = true;
            self.conn.send_close_notify();
        }
    }

    fn is_client_mode(&self) -> bool {
        matches!(self.conn, Connection::Client(_))
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn pem_error(e: rustls_pki_types::pem::Error) -> TlsError {
    TlsError::Pem(e.to_string())
}

/// Server-side engine factory.
#[derive(Debug, Clone)]
pub struct ServerTls {
    config: Arc<ServerConfig>,
}

impl ServerTls {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self { config }
    }

    /// Build from a certificate chain and private key.
    pub fn from_der(
        certs: Vec<CertificateDer<'static>>,
        key: PrivateKeyDer<'static>,
    ) -> Result<Self, TlsError> {
        let config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;
        Ok(Self::new(Arc::new(config)))
    }

    /// Load a PEM certificate chain and PEM private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let certs = CertificateDer::pem_file_iter(cert_path)
            .map_err(pem_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_error)?;
        if certs.is_empty() {
            return Err(TlsError::Pem(format!(
                "no certificates in {}",
                cert_path.display()
            )));
        }
        let key = PrivateKeyDer::from_pem_file(key_path).map_err(pem_error)?;
        Self::from_der(certs, key)
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }
}

impl TlsEngineFactory for ServerTls {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, TlsError> {
        Ok(Box::new(RustlsEngine::server(Arc::clone(&self.config))?))
    }
}

/// Client-side engine factory for a single server name.
#[derive(Debug, Clone)]
pub struct ClientTls {
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
}

impl ClientTls {
    pub fn new(config: Arc<ClientConfig>, server_name: &str) -> Result<Self, TlsError> {
        let server_name = ServerName::try_from(server_name.to_owned())
            .map_err(|e| TlsError::InvalidServerName(format!("{server_name}: {e}")))?;
        Ok(Self {
            config,
            server_name,
        })
    }

    /// Trust exactly the given roots.
    pub fn with_root_certificates(
        roots: Vec<CertificateDer<'static>>,
        server_name: &str,
    ) -> Result<Self, TlsError> {
        let mut store = RootCertStore::empty();
        for cert in roots {
            store.add(cert)?;
        }
        let config = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(store)
            .with_no_client_auth();
        Self::new(Arc::new(config), server_name)
    }

    /// Trust the certificates in a PEM file.
    pub fn from_ca_pem_file(path: &Path, server_name: &str) -> Result<Self, TlsError> {
        let roots = CertificateDer::pem_file_iter(path)
            .map_err(pem_error)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(pem_error)?;
        Self::with_root_certificates(roots, server_name)
    }
}

impl TlsEngineFactory for ClientTls {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, TlsError> {
        Ok(Box::new(RustlsEngine::client(
            Arc::clone(&self.config),
            self.server_name.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::buffer::{BufferArena, SharedMemoryManager};
    use crate::runtime::queue::concat;
    use crate::tls::testing::self_signed;
    use crate::tls::{TlsOutput, TlsProcessor};
    use bytes::Bytes;

    fn processors() -> (TlsProcessor, TlsProcessor) {
        let (server_tls, client_tls) = self_signed();
        let memory = SharedMemoryManager::new(BufferArena::default());
        (
            TlsProcessor::new(client_tls.new_engine().unwrap(), memory.clone()),
            TlsProcessor::new(server_tls.new_engine().unwrap(), memory),
        )
    }

    /// Shuttle records until neither side has anything to send.
    fn pump(
        client: &mut TlsProcessor,
        server: &mut TlsProcessor,
        mut to_server: Vec<Bytes>,
    ) -> (TlsOutput, TlsOutput) {
        let mut client_total = TlsOutput::default();
        let mut server_total = TlsOutput::default();
        for _ in 0..16 {
            if to_server.is_empty() {
                break;
            }
            let mut server_out = TlsOutput::default();
            server.decrypt(to_server, &mut server_out).unwrap();
            let to_client = server_out.take_ciphertext();
            merge(&mut server_total, server_out);

            let mut client_out = TlsOutput::default();
            client.decrypt(to_client, &mut client_out).unwrap();
            to_server = client_out.take_ciphertext();
            merge(&mut client_total, client_out);
        }
        (client_total, server_total)
    }

    fn merge(total: &mut TlsOutput, out: TlsOutput) {
        total.plaintext.extend(out.plaintext);
        total.handshake_finished |= out.handshake_finished;
        total.closed |= out.closed;
    }

    #[test]
    fn test_rustls_handshake_in_memory() {
        let (mut client, mut server) = processors();
        let mut out = TlsOutput::default();
        client.start(&mut out).unwrap();
        assert!(!out.ciphertext.is_empty(), "client hello expected");
        server.start(&mut TlsOutput::default()).unwrap();

        let (client_out, server_out) = pump(&mut client, &mut server, out.take_ciphertext());
        assert!(client_out.handshake_finished);
        assert!(server_out.handshake_finished);
        assert!(client.is_handshake_finished());
        assert!(server.is_handshake_finished());
    }

    #[test]
    fn test_rustls_data_and_close() {
        let (mut client, mut server) = processors();
        let mut out = TlsOutput::default();
        client.start(&mut out).unwrap();
        server.start(&mut TlsOutput::default()).unwrap();
        pump(&mut client, &mut server, out.take_ciphertext());

        let payload = vec![7u8; 40_000];
        let mut sent = TlsOutput::default();
        client
            .encrypt(vec![Bytes::from(payload.clone())], &mut sent)
            .unwrap();
        let mut received = TlsOutput::default();
        server.decrypt(sent.take_ciphertext(), &mut received).unwrap();
        assert_eq!(concat(&received.plaintext).len(), payload.len());

        let mut closing = TlsOutput::default();
        client.close(&mut closing).unwrap();
        assert!(closing.closed);
        let mut peer = TlsOutput::default();
        server.decrypt(closing.take_ciphertext(), &mut peer).unwrap();
        assert!(peer.closed);
    }

    #[test]
    fn test_invalid_server_name() {
        let (_, client) = self_signed();
        let result = ClientTls::new(Arc::clone(&client.config), "not a hostname!");
        assert!(matches!(result, Err(TlsError::InvalidServerName(_))));
    }
}
