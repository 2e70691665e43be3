//! A toy record engine and certificate helpers for tests.
//!
//! Toy records are `[kind u8][len u16 BE][payload]`. Application payloads
//! are XOR-masked so plaintext never appears on the wire verbatim.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::tls::{
    ClientTls, DelegatedTask, EngineResult, HandshakeStatus, ServerTls, Status, TlsEngine,
    TlsEngineFactory, TlsError,
};

pub const HANDSHAKE: u8 = 1;
pub const DATA: u8 = 2;
pub const CLOSE: u8 = 3;

pub const HELLO: &[u8] = b"HELLO";
pub const READY: &[u8] = b"READY";

const MASK: u8 = 0x5a;
const HEADER: usize = 3;

pub fn record(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER + payload.len());
    out.push(kind);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

pub fn handshake_record(payload: &[u8]) -> Vec<u8> {
    record(HANDSHAKE, payload)
}

pub fn data_record(plaintext: &[u8]) -> Vec<u8> {
    let masked: Vec<u8> = plaintext.iter().map(|b| b ^ MASK).collect();
    record(DATA, &masked)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToyState {
    Idle,
    ClientSendHello,
    ClientAwaitReady,
    ServerAwaitHello,
    ServerRunTask,
    ServerSendReady,
    Established,
}

pub struct ToyEngine {
    client: bool,
    state: ToyState,
    task_pending: bool,
    task_done: Arc<AtomicBool>,
    app_size: usize,
    max_record: usize,
    outbound_closed: bool,
    close_sent: bool,
}

impl ToyEngine {
    pub fn client() -> Self {
        Self::new(true)
    }

    /// The server runs one delegated task after the client hello.
    pub fn server() -> Self {
        Self::new(false)
    }

    fn new(client: bool) -> Self {
        Self {
            client,
            state: ToyState::Idle,
            task_pending: false,
            task_done: Arc::new(AtomicBool::new(false)),
            app_size: 1024,
            max_record: 16,
            outbound_closed: false,
            close_sent: false,
        }
    }

    pub fn with_application_buffer_size(mut self, size: usize) -> Self {
        self.app_size = size;
        self
    }

    pub fn task_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.task_done)
    }

    fn settle(&mut self) {
        if self.state == ToyState::ServerRunTask && self.task_done.load(Ordering::SeqCst) {
            self.state = ToyState::ServerSendReady;
        }
    }

    fn result(
        &self,
        status: Status,
        handshake_status: HandshakeStatus,
        consumed: usize,
        produced: usize,
    ) -> EngineResult {
        EngineResult {
            status,
            handshake_status,
            bytes_consumed: consumed,
            bytes_produced: produced,
        }
    }

    fn put(dst: &mut [u8], kind: u8, payload: &[u8]) -> Option<usize> {
        let encoded = record(kind, payload);
        if dst.len() < encoded.len() {
            return None;
        }
        dst[..encoded.len()].copy_from_slice(&encoded);
        Some(encoded.len())
    }
}

impl TlsEngine for ToyEngine {
    fn begin_handshake(&mut self) -> Result<(), TlsError> {
        if self.state == ToyState::Idle {
            self.state = if self.client {
                ToyState::ClientSendHello
            } else {
                ToyState::ServerAwaitHello
            };
        }
        Ok(())
    }

    fn wrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        self.settle();
        match self.state {
            ToyState::ClientSendHello => match Self::put(dst, HANDSHAKE, HELLO) {
                Some(n) => {
                    self.state = ToyState::ClientAwaitReady;
                    Ok(self.result(Status::Ok, HandshakeStatus::NeedUnwrap, 0, n))
                }
                None => Ok(self.result(Status::BufferOverflow, HandshakeStatus::NeedWrap, 0, 0)),
            },
            ToyState::ServerSendReady => match Self::put(dst, HANDSHAKE, READY) {
                Some(n) => {
                    self.state = ToyState::Established;
                    Ok(self.result(Status::Ok, HandshakeStatus::Finished, 0, n))
                }
                None => Ok(self.result(Status::BufferOverflow, HandshakeStatus::NeedWrap, 0, 0)),
            },
            ToyState::Established if self.outbound_closed => {
                if self.close_sent {
                    return Ok(self.result(Status::Closed, HandshakeStatus::NotHandshaking, 0, 0));
                }
                match Self::put(dst, CLOSE, &[]) {
                    Some(n) => {
                        self.close_sent = true;
                        Ok(self.result(Status::Closed, HandshakeStatus::NotHandshaking, 0, n))
                    }
                    None => Ok(self.result(
                        Status::BufferOverflow,
                        HandshakeStatus::NeedWrap,
                        0,
                        0,
                    )),
                }
            }
            ToyState::Established => {
                if src.is_empty() {
                    return Ok(self.result(Status::Ok, HandshakeStatus::NotHandshaking, 0, 0));
                }
                let chunk = &src[..src.len().min(self.max_record)];
                let masked: Vec<u8> = chunk.iter().map(|b| b ^ MASK).collect();
                match Self::put(dst, DATA, &masked) {
                    Some(n) => Ok(self.result(
                        Status::Ok,
                        HandshakeStatus::NotHandshaking,
                        chunk.len(),
                        n,
                    )),
                    None => Ok(self.result(
                        Status::BufferOverflow,
                        HandshakeStatus::NotHandshaking,
                        0,
                        0,
                    )),
                }
            }
            _ => Ok(self.result(Status::Ok, self.handshake_status(), 0, 0)),
        }
    }

    fn unwrap(&mut self, src: &[u8], dst: &mut [u8]) -> Result<EngineResult, TlsError> {
        self.settle();
        if src.len() < HEADER {
            return Ok(self.result(Status::BufferUnderflow, self.handshake_status(), 0, 0));
        }
        let len = u16::from_be_bytes([src[1], src[2]]) as usize;
        if src.len() < HEADER + len {
            return Ok(self.result(Status::BufferUnderflow, self.handshake_status(), 0, 0));
        }
        let payload = &src[HEADER..HEADER + len];
        let consumed = HEADER + len;

        match src[0] {
            HANDSHAKE => match (self.state, payload) {
                (ToyState::ServerAwaitHello, HELLO) => {
                    self.state = ToyState::ServerRunTask;
                    self.task_pending = true;
                    Ok(self.result(Status::Ok, HandshakeStatus::NeedTask, consumed, 0))
                }
                (ToyState::ClientAwaitReady, READY) => {
                    self.state = ToyState::Established;
                    Ok(self.result(Status::Ok, HandshakeStatus::Finished, consumed, 0))
                }
                _ => Err(TlsError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "unexpected handshake record",
                ))),
            },
            DATA => {
                if dst.len() < len {
                    return Ok(self.result(Status::BufferOverflow, self.handshake_status(), 0, 0));
                }
                for (out, b) in dst.iter_mut().zip(payload) {
                    *out = b ^ MASK;
                }
                Ok(self.result(Status::Ok, self.handshake_status(), consumed, len))
            }
            CLOSE => Ok(self.result(Status::Closed, self.handshake_status(), consumed, 0)),
            other => Err(TlsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unknown record kind {other}"),
            ))),
        }
    }

    fn handshake_status(&self) -> HandshakeStatus {
        match self.state {
            ToyState::Idle => HandshakeStatus::NotHandshaking,
            ToyState::ClientSendHello | ToyState::ServerSendReady => HandshakeStatus::NeedWrap,
            ToyState::ClientAwaitReady | ToyState::ServerAwaitHello => HandshakeStatus::NeedUnwrap,
            ToyState::ServerRunTask => {
                if self.task_done.load(Ordering::SeqCst) {
                    HandshakeStatus::NeedWrap
                } else {
                    HandshakeStatus::NeedTask
                }
            }
            ToyState::Established => {
                if self.outbound_closed && !self.close_sent {
                    HandshakeStatus::NeedWrap
                } else {
                    HandshakeStatus::NotHandshaking
                }
            }
        }
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        if !self.task_pending {
            return None;
        }
        self.task_pending = false;
        let done = Arc::clone(&self.task_done);
        Some(Box::new(move || done.store(true, Ordering::SeqCst)))
    }

    fn packet_buffer_size(&self) -> usize {
        HEADER + self.max_record
    }

    fn application_buffer_size(&self) -> usize {
        self.app_size
    }

    fn close_outbound(&mut self) {
        self.outbound_closed = true;
    }

    fn is_client_mode(&self) -> bool {
        self.client
    }
}

/// Factory producing toy engines.
pub struct ToyTls {
    pub client: bool,
}

impl TlsEngineFactory for ToyTls {
    fn new_engine(&self) -> Result<Box<dyn TlsEngine>, TlsError> {
        Ok(Box::new(if self.client {
            ToyEngine::client()
        } else {
            ToyEngine::server()
        }))
    }
}

/// A self-signed `localhost` server and a client trusting it.
pub fn self_signed() -> (ServerTls, ClientTls) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let server = ServerTls::from_der(vec![cert.clone()], key).unwrap();
    let client = ClientTls::with_root_certificates(vec![cert], "localhost").unwrap();
    (server, client)
}
