//! TLS connections, eager and activated mid-stream.

use std::sync::Arc;

use nbsock::protocols::echo::{EchoHandler, EchoMode};
use nbsock::{
    ClientTls, Connector, Handler, IoContext, NonBlockingConnection, Result, RuntimeConfig,
    Server, ServerTls, Shared, TlsActivation,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

fn self_signed() -> (Arc<ServerTls>, Arc<ClientTls>) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert: CertificateDer<'static> = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    let server = ServerTls::from_der(vec![cert.clone()], key).unwrap();
    let client = ClientTls::with_root_certificates(vec![cert], "localhost").unwrap();
    (Arc::new(server), Arc::new(client))
}

fn context() -> Arc<IoContext> {
    IoContext::new(RuntimeConfig {
        dispatchers: 2,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

#[test]
fn eager_tls_echo() {
    let (server_tls, client_tls) = self_signed();
    let context = context();
    let server = Server::builder(
        Arc::clone(&context),
        Shared::new(EchoHandler::new(EchoMode::Line)),
    )
    .tls(server_tls, TlsActivation::Eager)
    .bind("127.0.0.1:0".parse().unwrap())
    .unwrap();

    let conn = Connector::new(Arc::clone(&context))
        .tls(client_tls, TlsActivation::Eager)
        .connect_blocking(server.local_addr())
        .unwrap();
    assert!(conn.inner().is_secure());

    conn.write_str("over tls\n").unwrap();
    assert_eq!(conn.read_string_by_delimiter("\n", 64).unwrap(), "over tls");

    let big = "x".repeat(40_000);
    conn.write_str(&big).unwrap();
    conn.write_str("\n").unwrap();
    assert_eq!(conn.read_string_by_delimiter("\n", 64 * 1024).unwrap(), big);

    conn.close().unwrap();
    context.shutdown();
}

/// Plaintext line echo that upgrades on `STARTTLS`.
struct StartTls;

impl Handler for StartTls {
    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let line = conn.read_string_by_delimiter("\n", 1024)?;
        if line == "STARTTLS" && !conn.is_secure() {
            conn.write_str("GO\n")?;
            conn.activate_tls()?;
        } else {
            let secure = if conn.is_secure() { "secure" } else { "plain" };
            conn.write_str(&format!("{secure}:{line}\n"))?;
        }
        Ok(true)
    }
}

#[test]
fn deferred_tls_upgrades_mid_stream() {
    let (server_tls, client_tls) = self_signed();
    let context = context();
    let server = Server::builder(Arc::clone(&context), Shared::new(StartTls))
        .tls(server_tls, TlsActivation::Deferred)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();

    let conn = Connector::new(Arc::clone(&context))
        .tls(client_tls, TlsActivation::Deferred)
        .connect_blocking(server.local_addr())
        .unwrap();
    assert!(!conn.inner().is_secure());

    conn.write_str("hi\n").unwrap();
    assert_eq!(conn.read_string_by_delimiter("\n", 64).unwrap(), "plain:hi");

    conn.write_str("STARTTLS\n").unwrap();
    assert_eq!(conn.read_string_by_delimiter("\n", 64).unwrap(), "GO");
    conn.inner().activate_tls().unwrap();
    assert!(conn.inner().is_secure());
    assert!(conn.inner().activate_tls().is_err());

    conn.write_str("hi\n").unwrap();
    assert_eq!(conn.read_string_by_delimiter("\n", 64).unwrap(), "secure:hi");

    conn.close().unwrap();
    context.shutdown();
}

#[test]
fn plain_connection_cannot_activate_tls() {
    let context = context();
    let server = Server::builder(Arc::clone(&context), Shared::new(StartTls))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();

    let conn = Connector::new(Arc::clone(&context))
        .connect_blocking(server.local_addr())
        .unwrap();
    assert!(conn.inner().activate_tls().is_err());

    context.shutdown();
}

/// Upgrades on `STARTTLS` without answering, so clients may pipeline the
/// handshake right behind the command.
struct SilentStartTls;

impl Handler for SilentStartTls {
    fn on_data(&self, conn: &NonBlockingConnection) -> Result<bool> {
        let line = conn.read_string_by_delimiter("\n", 1024)?;
        if line == "STARTTLS" && !conn.is_secure() {
            conn.activate_tls()?;
        } else {
            let secure = if conn.is_secure() { "secure" } else { "plain" };
            conn.write_str(&format!("{secure}:{line}\n"))?;
        }
        Ok(true)
    }
}

#[test]
fn pipelined_handshake_survives_worker_dispatch() {
    let (server_tls, client_tls) = self_signed();
    let context = IoContext::new(RuntimeConfig {
        dispatchers: 2,
        worker_threads: 4,
        ..RuntimeConfig::default()
    })
    .unwrap();
    let server = Server::builder(Arc::clone(&context), Shared::new(SilentStartTls))
        .tls(server_tls, TlsActivation::Deferred)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();

    for _ in 0..20 {
        let conn = Connector::new(Arc::clone(&context))
            .tls(Arc::<ClientTls>::clone(&client_tls), TlsActivation::Deferred)
            .connect_blocking(server.local_addr())
            .unwrap();

        // The client hello follows the command without waiting for a reply.
        conn.write_str("STARTTLS\n").unwrap();
        conn.inner().activate_tls().unwrap();
        conn.write_str("hi\n").unwrap();
        assert_eq!(conn.read_string_by_delimiter("\n", 64).unwrap(), "secure:hi");

        conn.close().unwrap();
    }
    context.shutdown();
}
