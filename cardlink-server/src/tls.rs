//! PSK-TLS 1.2 acceptor.
//!
//! rustls has no PSK cipher-suite support, so the listener is built on
//! the `openssl` crate with `tokio-openssl` for async I/O. The key
//! lookup happens inside OpenSSL's PSK server callback; what the
//! callback observed (identity, lookup outcome) is smuggled out through
//! an `Ssl` ex-data slot so handshake events can name the failing
//! identity without ever touching key bytes.

use std::pin::Pin;
use std::sync::{Arc, LazyLock};

use cardlink_types::keystore::KeyStore;
use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use parking_lot::Mutex;
use secrecy::ExposeSecret as _;
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::config::CipherTier;

/// What the PSK callback saw during one handshake.
#[derive(Debug, Clone, Default)]
pub(crate) struct PskObservation {
    /// Identity presented in `ClientKeyExchange`, if any arrived.
    pub(crate) identity: Option<String>,
    /// Whether the identity resolved against the key store.
    pub(crate) known: bool,
}

type ObservationSlot = Arc<Mutex<PskObservation>>;

static PSK_OBSERVATION_INDEX: LazyLock<Index<Ssl, ObservationSlot>> =
    LazyLock::new(|| Ssl::new_ex_index().expect("openssl ex-data index available"));

/// A failed handshake, classified for the `handshake_failed` event.
#[derive(Debug)]
pub(crate) struct HandshakeFailure {
    pub(crate) observation: PskObservation,
    /// Stable reason string, e.g. `unknown_psk_identity`.
    pub(crate) reason: &'static str,
}

/// TLS 1.2 acceptor restricted to PSK cipher suites.
pub(crate) struct PskAcceptor {
    ctx: SslContext,
}

impl PskAcceptor {
    /// Builds the server context for `tier` with key lookup against
    /// `keystore`.
    pub(crate) fn new(tier: CipherTier, keystore: Arc<dyn KeyStore>) -> Result<Self, ErrorStack> {
        let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
        builder.set_min_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1_2))?;
        builder.set_cipher_list(tier.cipher_list())?;
        builder.set_psk_server_callback(move |ssl, identity, psk_out| {
            let presented = identity.and_then(|bytes| std::str::from_utf8(bytes).ok());
            let Some(presented) = presented else {
                tracing::debug!("peer sent no usable PSK identity");
                return Ok(0);
            };
            let entry = keystore.lookup(presented);
            if let Some(slot) = ssl.ex_data(*PSK_OBSERVATION_INDEX) {
                let mut observation = slot.lock();
                observation.identity = Some(presented.to_owned());
                observation.known = entry.is_some();
            }
            let Some(entry) = entry else {
                tracing::debug!(identity = presented, "unknown PSK identity");
                return Ok(0);
            };
            let key = entry.key().expose_secret();
            if psk_out.len() < key.len() {
                tracing::error!(identity = presented, "PSK output buffer too small");
                return Ok(0);
            }
            psk_out[..key.len()].copy_from_slice(key);
            Ok(key.len())
        });
        Ok(Self { ctx: builder.build() })
    }

    /// Runs the TLS handshake on an accepted TCP connection.
    pub(crate) async fn accept(
        &self,
        tcp: TcpStream,
    ) -> Result<(SslStream<TcpStream>, PskObservation), HandshakeFailure> {
        let slot: ObservationSlot = Arc::default();
        let mut stream = self
            .build_stream(tcp, slot.clone())
            .map_err(|err| classify_failure(&slot, err.to_string()))?;
        match Pin::new(&mut stream).accept().await {
            Ok(()) => {
                let observation = slot.lock().clone();
                Ok((stream, observation))
            }
            Err(err) => Err(classify_failure(&slot, err.to_string())),
        }
    }

    /// Negotiated cipher name of an accepted stream.
    pub(crate) fn cipher_name(stream: &SslStream<TcpStream>) -> String {
        stream
            .ssl()
            .current_cipher()
            .map(|cipher| cipher.name().to_owned())
            .unwrap_or_else(|| cardlink_types::event::NO_CIPHER.to_owned())
    }

    fn build_stream(
        &self,
        tcp: TcpStream,
        slot: ObservationSlot,
    ) -> Result<SslStream<TcpStream>, ErrorStack> {
        let mut ssl = Ssl::new(&self.ctx)?;
        ssl.set_ex_data(*PSK_OBSERVATION_INDEX, slot);
        SslStream::new(ssl, tcp)
    }
}

fn classify_failure(slot: &ObservationSlot, detail: String) -> HandshakeFailure {
    let observation = slot.lock().clone();
    let reason = match (&observation.identity, observation.known) {
        (Some(_), false) => "unknown_psk_identity",
        // key found but the handshake still failed: almost always a key
        // mismatch surfacing as a MAC/decrypt error on the Finished message
        (Some(_), true) => "decryption_failed",
        (None, _) => "handshake_failure",
    };
    tracing::debug!(reason, detail, "handshake failed");
    HandshakeFailure { observation, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cardlink_types::keystore::{KeyEntry, StaticKeyStore};
    use openssl::ssl::SslMethod;
    use tokio::net::TcpListener;

    fn test_keystore() -> Arc<dyn KeyStore> {
        Arc::new(
            StaticKeyStore::new(vec![
                KeyEntry::new("TEST_UICC_001".to_owned(), (0u8..16).collect(), 1).expect("valid"),
            ])
            .expect("builds"),
        )
    }

    async fn psk_client(
        addr: std::net::SocketAddr,
        identity: &'static str,
        key: Vec<u8>,
    ) -> Result<SslStream<TcpStream>, String> {
        let mut builder =
            SslContextBuilder::new(SslMethod::tls_client()).map_err(|e| e.to_string())?;
        builder
            .set_min_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| e.to_string())?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_2))
            .map_err(|e| e.to_string())?;
        builder
            .set_cipher_list(CipherTier::Production.cipher_list())
            .map_err(|e| e.to_string())?;
        builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
            let id = identity.as_bytes();
            identity_out[..id.len()].copy_from_slice(id);
            identity_out[id.len()] = 0;
            psk_out[..key.len()].copy_from_slice(&key);
            Ok(key.len())
        });
        let ctx = builder.build();
        let tcp = TcpStream::connect(addr).await.map_err(|e| e.to_string())?;
        let ssl = Ssl::new(&ctx).map_err(|e| e.to_string())?;
        let mut stream = SslStream::new(ssl, tcp).map_err(|e| e.to_string())?;
        Pin::new(&mut stream)
            .connect()
            .await
            .map_err(|e| e.to_string())?;
        Ok(stream)
    }

    #[tokio::test]
    async fn psk_handshake_negotiates_psk_suite() {
        let acceptor = PskAcceptor::new(CipherTier::Production, test_keystore()).expect("builds");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
        let addr = listener.local_addr().expect("has addr");

        let client = tokio::spawn(psk_client(addr, "TEST_UICC_001", (0u8..16).collect()));
        let (tcp, _) = listener.accept().await.expect("accepts");
        let (stream, observation) = acceptor.accept(tcp).await.expect("handshake succeeds");

        assert_eq!(observation.identity.as_deref(), Some("TEST_UICC_001"));
        assert!(observation.known);
        assert!(PskAcceptor::cipher_name(&stream).contains("PSK"));
        client.await.expect("joins").expect("client handshake succeeds");
    }

    #[tokio::test]
    async fn unknown_identity_is_classified() {
        let acceptor = PskAcceptor::new(CipherTier::Production, test_keystore()).expect("builds");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
        let addr = listener.local_addr().expect("has addr");

        let client = tokio::spawn(psk_client(addr, "NOBODY", vec![0u8; 16]));
        let (tcp, _) = listener.accept().await.expect("accepts");
        let failure = acceptor.accept(tcp).await.expect_err("must fail");

        assert_eq!(failure.reason, "unknown_psk_identity");
        assert_eq!(failure.observation.identity.as_deref(), Some("NOBODY"));
        assert!(client.await.expect("joins").is_err());
    }

    #[tokio::test]
    async fn wrong_key_is_classified_as_decryption_failure() {
        let acceptor = PskAcceptor::new(CipherTier::Production, test_keystore()).expect("builds");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binds");
        let addr = listener.local_addr().expect("has addr");

        let client = tokio::spawn(psk_client(addr, "TEST_UICC_001", vec![0xFF; 16]));
        let (tcp, _) = listener.accept().await.expect("accepts");
        let failure = acceptor.accept(tcp).await.expect_err("must fail");

        assert_eq!(failure.reason, "decryption_failed");
        assert!(failure.observation.known);
        assert!(client.await.expect("joins").is_err());
    }
}
