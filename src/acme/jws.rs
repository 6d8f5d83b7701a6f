use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use base64::Engine;
use ring::digest::{SHA256, digest};
use ring::rand::SystemRandom;
use ring::signature::{
    ECDSA_P256_SHA256_FIXED_SIGNING, ECDSA_P384_SHA384_FIXED_SIGNING, EcdsaKeyPair,
    KeyPair as RingKeyPair, RSA_PKCS1_SHA256, RsaKeyPair,
};
use serde::Serialize;

const ALG_RS256: &str = "RS256";
const ALG_ES256: &str = "ES256";
const ALG_ES384: &str = "ES384";
const KTY_EC: &str = "EC";
const KTY_RSA: &str = "RSA";
const CRV_P256: &str = "P-256";
const CRV_P384: &str = "P-384";

pub(crate) fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

/// Public JWK of the account key. Field declaration order follows the
/// RFC 7638 lexicographic member order for each key type.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Jwk {
    Ec {
        crv: &'static str,
        kty: &'static str,
        x: String,
        y: String,
    },
    Rsa {
        e: String,
        kty: &'static str,
        n: String,
    },
}

/// RFC 7638 thumbprint: SHA-256 over the canonical JSON of the required
/// members, keys sorted, no whitespace.
pub fn thumbprint(jwk: &Jwk) -> Result<String> {
    let value = serde_json::to_value(jwk)?;
    let sorted: BTreeMap<String, serde_json::Value> = serde_json::from_value(value)?;
    let canonical = serde_json::to_string(&sorted)?;
    Ok(b64(digest(&SHA256, canonical.as_bytes()).as_ref()))
}

/// base64url SHA-256 of a key authorization, the record value a DNS-01
/// responder publishes under `_acme-challenge.<domain>`.
pub fn dns01_digest(key_authorization: &str) -> String {
    b64(digest(&SHA256, key_authorization.as_bytes()).as_ref())
}

#[derive(Debug)]
enum SigningKey {
    Rsa(RsaKeyPair),
    P256(EcdsaKeyPair),
    P384(EcdsaKeyPair),
}

/// The ACME account private key, loaded once at startup. Never written back
/// to disk; every JWS of every renewal for this identity is signed with it.
#[derive(Debug)]
pub struct AccountKey {
    key: SigningKey,
    rng: SystemRandom,
}

#[derive(Serialize)]
struct Protected<'a> {
    alg: &'static str,
    nonce: &'a str,
    url: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<&'a Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

/// Flattened JWS serialization (RFC 7515 §7.2.2), the body of every ACME
/// POST.
#[derive(Debug, Serialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl AccountKey {
    /// Loads the account key from a PEM file. PKCS#8 is accepted for both
    /// key types; PKCS#1 is accepted for RSA.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, contains no private
    /// key, or holds a key no JWK algorithm can be chosen for.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("reading account key file {}", path.display()))?;
        let key = rustls_pemfile::private_key(&mut pem.as_slice())
            .with_context(|| format!("parsing account key file {}", path.display()))?
            .ok_or_else(|| anyhow!("no private key found in {}", path.display()))?;

        use rustls::pki_types::PrivateKeyDer;
        match key {
            PrivateKeyDer::Pkcs8(der) => Self::from_pkcs8_der(der.secret_pkcs8_der()),
            PrivateKeyDer::Pkcs1(der) => {
                let rng = SystemRandom::new();
                let pair = RsaKeyPair::from_der(der.secret_pkcs1_der())
                    .map_err(|err| anyhow!("unusable RSA account key: {err}"))?;
                Ok(Self {
                    key: SigningKey::Rsa(pair),
                    rng,
                })
            }
            _ => bail!("couldn't choose a JWK algorithm for {}", path.display()),
        }
    }

    /// Builds an account key from PKCS#8 DER, probing the curves and key
    /// types the JWS algorithms cover.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(&ECDSA_P256_SHA256_FIXED_SIGNING, der, &rng) {
            return Ok(Self {
                key: SigningKey::P256(pair),
                rng,
            });
        }
        if let Ok(pair) = EcdsaKeyPair::from_pkcs8(&ECDSA_P384_SHA384_FIXED_SIGNING, der, &rng) {
            return Ok(Self {
                key: SigningKey::P384(pair),
                rng,
            });
        }
        if let Ok(pair) = RsaKeyPair::from_pkcs8(der) {
            return Ok(Self {
                key: SigningKey::Rsa(pair),
                rng,
            });
        }
        bail!("couldn't choose a JWK algorithm")
    }

    /// The JOSE `alg` this key signs with.
    pub fn alg(&self) -> &'static str {
        match &self.key {
            SigningKey::Rsa(_) => ALG_RS256,
            SigningKey::P256(_) => ALG_ES256,
            SigningKey::P384(_) => ALG_ES384,
        }
    }

    /// The public JWK, embedded in the protected header until the account
    /// URL is known.
    ///
    /// # Errors
    /// Returns an error if the public key bytes are not in the expected
    /// encoding.
    pub fn jwk(&self) -> Result<Jwk> {
        match &self.key {
            SigningKey::P256(pair) => ec_jwk(CRV_P256, pair.public_key().as_ref(), 32),
            SigningKey::P384(pair) => ec_jwk(CRV_P384, pair.public_key().as_ref(), 48),
            SigningKey::Rsa(pair) => rsa_jwk(pair.public_key().as_ref()),
        }
    }

    /// RFC 7638 thumbprint of this key's public JWK.
    pub fn thumbprint(&self) -> Result<String> {
        thumbprint(&self.jwk()?)
    }

    /// `<token>.<thumbprint>`, the response material for a challenge.
    pub fn key_authorization(&self, token: &str) -> Result<String> {
        Ok(format!("{token}.{}", self.thumbprint()?))
    }

    /// Signs one ACME request as a flattened JWS. The protected header
    /// carries `kid` when the account URL is known and the public `jwk`
    /// otherwise, never both. `payload` of `None` produces the empty
    /// payload of a POST-as-GET.
    ///
    /// # Errors
    /// Returns an error if serialization or the signature operation fails.
    pub fn sign(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: Option<&str>,
    ) -> Result<FlattenedJws> {
        let jwk = if kid.is_none() {
            Some(self.jwk()?)
        } else {
            None
        };
        let protected = Protected {
            alg: self.alg(),
            nonce,
            url,
            jwk: jwk.as_ref(),
            kid,
        };

        let protected_b64 = b64(serde_json::to_string(&protected)?.as_bytes());
        let payload_b64 = match payload {
            Some(payload) => b64(payload.as_bytes()),
            None => String::new(),
        };

        let signing_input = format!("{protected_b64}.{payload_b64}");
        let signature = self.raw_sign(signing_input.as_bytes())?;

        Ok(FlattenedJws {
            protected: protected_b64,
            payload: payload_b64,
            signature: b64(&signature),
        })
    }

    // ECDSA signatures come out of the fixed-width signing algorithms as
    // raw R || S, which is the JOSE form; DER would be rejected by the CA.
    fn raw_sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            SigningKey::P256(pair) | SigningKey::P384(pair) => {
                let signature = pair
                    .sign(&self.rng, data)
                    .map_err(|_| anyhow!("ECDSA signing failed"))?;
                Ok(signature.as_ref().to_vec())
            }
            SigningKey::Rsa(pair) => {
                let mut signature = vec![0u8; pair.public_key().modulus_len()];
                pair.sign(&RSA_PKCS1_SHA256, &self.rng, data, &mut signature)
                    .map_err(|_| anyhow!("RSA signing failed"))?;
                Ok(signature)
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn public_key_bytes(&self) -> Vec<u8> {
        match &self.key {
            SigningKey::P256(pair) | SigningKey::P384(pair) => pair.public_key().as_ref().to_vec(),
            SigningKey::Rsa(pair) => pair.public_key().as_ref().to_vec(),
        }
    }
}

fn ec_jwk(crv: &'static str, point: &[u8], coord_len: usize) -> Result<Jwk> {
    // Uncompressed SEC1 point: 0x04 || X || Y.
    if point.len() != 1 + 2 * coord_len || point[0] != 0x04 {
        bail!("unexpected EC public key encoding");
    }
    Ok(Jwk::Ec {
        crv,
        kty: KTY_EC,
        x: b64(&point[1..=coord_len]),
        y: b64(&point[1 + coord_len..]),
    })
}

fn rsa_jwk(pkcs1: &[u8]) -> Result<Jwk> {
    // RSAPublicKey ::= SEQUENCE { modulus INTEGER, publicExponent INTEGER }
    let (_, obj) = x509_parser::der_parser::parse_der(pkcs1)
        .map_err(|err| anyhow!("parsing RSA public key: {err}"))?;
    let seq = obj
        .as_sequence()
        .map_err(|err| anyhow!("RSA public key is not a DER sequence: {err}"))?;
    let [modulus, exponent] = seq.as_slice() else {
        bail!("RSA public key sequence has {} elements", seq.len());
    };
    let n = modulus
        .as_slice()
        .map_err(|err| anyhow!("RSA modulus: {err}"))?;
    let e = exponent
        .as_slice()
        .map_err(|err| anyhow!("RSA exponent: {err}"))?;
    Ok(Jwk::Rsa {
        e: b64(strip_der_sign_byte(e)),
        kty: KTY_RSA,
        n: b64(strip_der_sign_byte(n)),
    })
}

// DER integers are signed; JWK wants the minimal unsigned big-endian form.
fn strip_der_sign_byte(bytes: &[u8]) -> &[u8] {
    match bytes {
        [0, rest @ ..] if !rest.is_empty() => rest,
        _ => bytes,
    }
}
