use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{AuthError, Result};

/// What a token is allowed to be used for. The tunnel accepts only
/// `Target`; management and backoffice tokens belong to the admin
/// surfaces and are rejected at the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    Management,
    Backoffice,
    Target,
}

/// Claim set minted by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Stable user id.
    pub sub: String,
    pub email: String,
    pub tenant_id: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub os: String,
    pub purpose: TokenPurpose,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies tunnel tokens against one public key.
///
/// Built from `GetConfig.public_key_pem`; rebuilt (and swapped) whenever
/// the control plane rotates the key.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn from_public_key_pem(pem: &str) -> Result<Self> {
        let key = DecodingKey::from_ed_pem(pem.as_bytes())?;
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.set_required_spec_claims(&["exp"]);
        Ok(Self { key, validation })
    }

    /// Full verification for the tunnel handshake: signature, expiry,
    /// `target` purpose, and tenant ownership.
    pub fn verify_target(&self, token: &str, tenant_id: &str) -> Result<Claims> {
        let claims = self.verify(token)?;
        if claims.purpose != TokenPurpose::Target {
            return Err(AuthError::WrongPurpose(claims.purpose));
        }
        if claims.tenant_id != tenant_id {
            return Err(AuthError::TenantMismatch {
                expected: tenant_id.to_string(),
                got: claims.tenant_id,
            });
        }
        Ok(claims)
    }

    /// Signature and expiry only; purpose is the caller's problem.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation)?;
        Ok(data.claims)
    }
}

/// Signs a claim set with an Ed25519 private key PEM. Used by the dev
/// tooling and tests; production tokens come from the identity service.
pub fn sign_claims(private_key_pem: &str, claims: &Claims) -> Result<String> {
    let key = EncodingKey::from_ed_pem(private_key_pem.as_bytes())?;
    Ok(encode(&Header::new(Algorithm::EdDSA), claims, &key)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Keypair;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    fn claims(purpose: TokenPurpose, tenant: &str, exp_offset: i64) -> Claims {
        Claims {
            sub: "u1".to_string(),
            email: "a@x".to_string(),
            tenant_id: tenant.to_string(),
            role: String::new(),
            groups: vec!["group:dev".to_string()],
            os: "linux".to_string(),
            purpose,
            iat: now(),
            exp: now() + exp_offset,
        }
    }

    #[test]
    fn accepts_valid_target_token() {
        let kp = Keypair::generate();
        let token = sign_claims(&kp.private_key_pem(), &claims(TokenPurpose::Target, "T1", 3600))
            .unwrap();
        let verifier = TokenVerifier::from_public_key_pem(&kp.public_key_pem()).unwrap();
        let claims = verifier.verify_target(&token, "T1").unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.groups, vec!["group:dev".to_string()]);
    }

    #[test]
    fn rejects_management_purpose() {
        let kp = Keypair::generate();
        let token =
            sign_claims(&kp.private_key_pem(), &claims(TokenPurpose::Management, "T1", 3600))
                .unwrap();
        let verifier = TokenVerifier::from_public_key_pem(&kp.public_key_pem()).unwrap();
        assert!(matches!(
            verifier.verify_target(&token, "T1"),
            Err(AuthError::WrongPurpose(TokenPurpose::Management))
        ));
    }

    #[test]
    fn rejects_tenant_mismatch() {
        let kp = Keypair::generate();
        let token = sign_claims(&kp.private_key_pem(), &claims(TokenPurpose::Target, "T2", 3600))
            .unwrap();
        let verifier = TokenVerifier::from_public_key_pem(&kp.public_key_pem()).unwrap();
        assert!(matches!(
            verifier.verify_target(&token, "T1"),
            Err(AuthError::TenantMismatch { .. })
        ));
    }

    #[test]
    fn rejects_expired_token() {
        let kp = Keypair::generate();
        let token = sign_claims(&kp.private_key_pem(), &claims(TokenPurpose::Target, "T1", -3600))
            .unwrap();
        let verifier = TokenVerifier::from_public_key_pem(&kp.public_key_pem()).unwrap();
        assert!(verifier.verify_target(&token, "T1").is_err());
    }

    #[test]
    fn rejects_foreign_signature() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let token = sign_claims(&kp.private_key_pem(), &claims(TokenPurpose::Target, "T1", 3600))
            .unwrap();
        let verifier = TokenVerifier::from_public_key_pem(&other.public_key_pem()).unwrap();
        assert!(verifier.verify_target(&token, "T1").is_err());
    }

    #[test]
    fn rejects_garbage() {
        let kp = Keypair::generate();
        let verifier = TokenVerifier::from_public_key_pem(&kp.public_key_pem()).unwrap();
        assert!(verifier.verify_target("not-a-jwt", "T1").is_err());
    }
}
