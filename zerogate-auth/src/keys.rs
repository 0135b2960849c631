use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
use ed25519_dalek::pkcs8::spki::EncodePublicKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use ed25519_dalek::SigningKey;
use rand::RngCore;

/// An Ed25519 keypair for development deployments: when the control
/// plane is started without identity-service key material it mints one
/// of these and serves the public half to gateways.
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::rng().fill_bytes(&mut seed);
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    /// PKCS#8 PEM of the private key.
    pub fn private_key_pem(&self) -> String {
        self.signing
            .to_pkcs8_pem(LineEnding::LF)
            .expect("ed25519 pkcs8 encoding cannot fail")
            .to_string()
    }

    /// SPKI PEM of the public key, the form `GetConfig` serves.
    pub fn public_key_pem(&self) -> String {
        self.signing
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .expect("ed25519 spki encoding cannot fail")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip_has_expected_markers() {
        let kp = Keypair::generate();
        assert!(kp.private_key_pem().contains("BEGIN PRIVATE KEY"));
        assert!(kp.public_key_pem().contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn distinct_keypairs_differ() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key_pem(), b.public_key_pem());
    }
}
