use anyhow::{Context, Result};

use crate::transport::PeerId;

/// Server name presented by every peer; certificates are not verified, so
/// the name only has to be syntactically valid.
pub const SERVER_NAME: &str = "peerdrop.local";

/// Raw DER-encoded certificate and private key material for one peer.
///
/// Transport implementations wrap these bytes in whatever TLS library they
/// use (`rustls` for QUIC).
pub struct PeerCertificate {
    pub cert_der: Vec<u8>,
    pub private_key_pkcs8_der: Vec<u8>,
}

/// Generates a throwaway self-signed certificate for `peer`.
///
/// The certificate names [`SERVER_NAME`] and `<peer-id>.peerdrop.local`.
///
/// # Errors
///
/// Returns an error if certificate generation fails.
pub fn generate_peer_certificate(peer: &PeerId) -> Result<PeerCertificate> {
    let subjects = vec![SERVER_NAME.to_owned(), format!("{peer}.{SERVER_NAME}")];

    let certified = rcgen::generate_simple_self_signed(subjects)
        .with_context(|| format!("failed to generate certificate for peer {peer}"))?;

    Ok(PeerCertificate {
        cert_der: certified.cert.der().to_vec(),
        private_key_pkcs8_der: certified.key_pair.serialize_der(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn given_random_peer_when_generating_cert_then_returns_non_empty_der() {
        let cert = generate_peer_certificate(&PeerId::random()).unwrap();
        assert!(!cert.cert_der.is_empty());
        assert!(!cert.private_key_pkcs8_der.is_empty());
    }

    #[test]
    fn given_two_peers_when_generating_certs_then_keys_differ() {
        let a = generate_peer_certificate(&PeerId::random()).unwrap();
        let b = generate_peer_certificate(&PeerId::random()).unwrap();
        assert_ne!(a.private_key_pkcs8_der, b.private_key_pkcs8_der);
    }
}
