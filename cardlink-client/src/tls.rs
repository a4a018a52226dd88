//! PSK-TLS 1.2 client connector.
//!
//! Mirror image of the server transport: an `openssl` client context
//! restricted to the PSK suites, identity and key supplied through the
//! PSK client callback. Exposed publicly so test drivers can open raw
//! admin connections without the pull loop.

use std::pin::Pin;

use openssl::ssl::{Ssl, SslContext, SslContextBuilder, SslMethod, SslVersion};
use secrecy::{ExposeSecret as _, SecretSlice};
use tokio::net::TcpStream;
use tokio_openssl::SslStream;

use crate::ClientError;

const PSK_CIPHERS: &str =
    "PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384:PSK-AES128-CBC-SHA:PSK-AES256-CBC-SHA";
const PSK_CIPHERS_WITH_NULL: &str = "PSK-AES128-CBC-SHA256:PSK-AES256-CBC-SHA384:\
     PSK-AES128-CBC-SHA:PSK-AES256-CBC-SHA:PSK-NULL-SHA256:PSK-NULL-SHA384:@SECLEVEL=0";

/// Builds the client-side TLS context for `identity`/`key`.
pub fn psk_context(
    identity: &str,
    key: Vec<u8>,
    offer_null: bool,
) -> Result<SslContext, ClientError> {
    let identity = identity.to_owned();
    let key: SecretSlice<u8> = key.into();
    let mut builder = SslContextBuilder::new(SslMethod::tls_client()).map_err(ssl_setup_error)?;
    builder
        .set_min_proto_version(Some(SslVersion::TLS1_2))
        .map_err(ssl_setup_error)?;
    builder
        .set_max_proto_version(Some(SslVersion::TLS1_2))
        .map_err(ssl_setup_error)?;
    builder
        .set_cipher_list(if offer_null { PSK_CIPHERS_WITH_NULL } else { PSK_CIPHERS })
        .map_err(ssl_setup_error)?;
    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let id = identity.as_bytes();
        let key = key.expose_secret();
        if identity_out.len() < id.len() + 1 || psk_out.len() < key.len() {
            tracing::error!("PSK callback buffers too small");
            return Ok(0);
        }
        identity_out[..id.len()].copy_from_slice(id);
        identity_out[id.len()] = 0;
        psk_out[..key.len()].copy_from_slice(key);
        Ok(key.len())
    });
    Ok(builder.build())
}

/// Opens a TCP connection to `addr` and runs the PSK handshake.
///
/// TCP-level failures surface as [`ClientError::Transport`] (retryable);
/// TLS-level failures as [`ClientError::Handshake`] (not retried, they
/// cover authentication failures like a wrong key).
pub async fn connect_psk(
    addr: &str,
    identity: &str,
    key: Vec<u8>,
    offer_null: bool,
) -> Result<SslStream<TcpStream>, ClientError> {
    let ctx = psk_context(identity, key, offer_null)?;
    let tcp = TcpStream::connect(addr).await?;
    let ssl = Ssl::new(&ctx).map_err(ssl_setup_error)?;
    let mut stream = SslStream::new(ssl, tcp).map_err(ssl_setup_error)?;
    match Pin::new(&mut stream).connect().await {
        Ok(()) => Ok(stream),
        Err(err) => match err.into_io_error() {
            Ok(io) => Err(ClientError::Transport(io)),
            Err(ssl) => Err(ClientError::Handshake(ssl.to_string())),
        },
    }
}

fn ssl_setup_error(err: openssl::error::ErrorStack) -> ClientError {
    ClientError::Config(format!("TLS context: {err}"))
}
