use anyhow::{Context, Result, anyhow, bail};

/// Elliptic curves the leaf-key policy accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EcCurve {
    P256,
    P384,
}

impl EcCurve {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "P-256" | "prime256v1" | "secp256r1" => Some(Self::P256),
            "P-384" | "secp384r1" => Some(Self::P384),
            _ => None,
        }
    }
}

/// How the fresh leaf private key is generated, from the `keytype`, `bits`
/// and `curves` configuration keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPolicy {
    Rsa { bits: u32 },
    Ec { curve: EcCurve },
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::Ec {
            curve: EcCurve::P384,
        }
    }
}

/// A freshly generated certificate private key. Generated once per renewal
/// and owned by the renewal until it is installed into the store entry.
#[derive(Debug)]
pub struct LeafKey {
    key: rcgen::KeyPair,
}

impl LeafKey {
    /// Generates a key honoring the policy.
    ///
    /// # Errors
    /// Returns an error if the key size is unsupported or generation fails.
    pub fn generate(policy: &KeyPolicy) -> Result<Self> {
        let key = match policy {
            KeyPolicy::Ec {
                curve: EcCurve::P256,
            } => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256),
            KeyPolicy::Ec {
                curve: EcCurve::P384,
            } => rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384),
            KeyPolicy::Rsa { bits } => {
                rcgen::KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rsa_key_size(*bits)?)
            }
        }
        .context("generating the certificate private key")?;
        Ok(Self { key })
    }

    /// PKCS#8 DER form, the shape the store's TLS machinery loads.
    pub fn to_pkcs8_der(&self) -> Vec<u8> {
        self.key.serialize_der()
    }

    /// PKCS#8 PEM form, the shape the store persists.
    pub fn to_pem(&self) -> String {
        self.key.serialize_pem()
    }
}

fn rsa_key_size(bits: u32) -> Result<rcgen::RsaKeySize> {
    match bits {
        2048 => Ok(rcgen::RsaKeySize::_2048),
        3072 => Ok(rcgen::RsaKeySize::_3072),
        4096 => Ok(rcgen::RsaKeySize::_4096),
        other => bail!("unsupported RSA key size {other} (expected 2048, 3072 or 4096)"),
    }
}

/// Builds the PKCS#10 CSR for an order: the first DNS name becomes the
/// subject CN, every name lands in the subjectAltName extension.
///
/// # Errors
/// Returns an error if `names` is empty, a name is not a valid DNS name, or
/// signing the request fails.
pub fn build_csr(key: &LeafKey, names: &[String]) -> Result<Vec<u8>> {
    let first = names
        .first()
        .ok_or_else(|| anyhow!("cannot generate the CSR: the certificate has no DNS names"))?;

    let mut params = rcgen::CertificateParams::default();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, first.clone());

    let mut sans = Vec::with_capacity(names.len());
    for name in names {
        let dns_name = name
            .clone()
            .try_into()
            .map_err(|err| anyhow!("invalid DNS name '{name}': {err}"))?;
        sans.push(rcgen::SanType::DnsName(dns_name));
    }
    params.subject_alt_names = sans;

    let csr = params
        .serialize_request(&key.key)
        .context("signing the certificate request")?;
    Ok(csr.der().to_vec())
}
