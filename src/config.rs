use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, File};
use serde::Deserialize;

use crate::acme::csr::{EcCurve, KeyPolicy};
use crate::acme::jws::AccountKey;
use crate::acme::types::ChallengeKind;

pub const DEFAULT_CONFIG_PATH: &str = "edgecert.toml";

const DEFAULT_RSA_BITS: u32 = 4096;
const DEFAULT_EC_CURVE: EcCurve = EcCurve::P384;
const SUPPORTED_RSA_BITS: [u32; 3] = [2048, 3072, 4096];

/// The whole configuration file: the experimental opt-in, the ACME identity
/// sections, and the certificates the store is seeded with.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// The `[acme.*]` sections are experimental and rejected unless this is
    /// set.
    #[serde(rename = "experimental-acme", default)]
    pub experimental_acme: bool,

    #[serde(default)]
    pub acme: BTreeMap<String, AcmeSection>,

    #[serde(default, rename = "certificate")]
    pub certificates: Vec<CertificateSection>,
}

/// One `[acme.<name>]` section, unvalidated. Unknown keys are rejected.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AcmeSection {
    pub uri: Option<String>,
    pub contact: Option<String>,
    pub account: Option<PathBuf>,
    pub challenge: Option<String>,
    pub keytype: Option<String>,
    pub bits: Option<u32>,
    pub curves: Option<String>,
}

/// One `[[certificate]]` entry: a store entry plus its TLS listeners and
/// optional ACME binding.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct CertificateSection {
    pub name: String,
    pub cert: PathBuf,
    pub key: PathBuf,
    #[serde(default)]
    pub domains: Vec<String>,
    pub acme: Option<String>,
    #[serde(default)]
    pub listeners: Vec<String>,
}

impl Settings {
    /// Loads and validates the configuration: defaults, then the TOML file,
    /// then `EDGECERT_*` environment overrides.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or any value fails
    /// validation; all configuration errors are fatal at startup.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        let config = Config::builder()
            .add_source(File::from(path.clone()))
            .add_source(Environment::with_prefix("EDGECERT").separator("__"))
            .build()
            .with_context(|| format!("loading configuration from {}", path.display()))?;
        let settings: Settings = config
            .try_deserialize()
            .context("parsing the configuration")?;
        validate_settings(&settings)?;
        Ok(settings)
    }
}

fn validate_settings(settings: &Settings) -> Result<()> {
    if !settings.acme.is_empty() && !settings.experimental_acme {
        bail!(
            "the [acme.*] sections are experimental; set 'experimental-acme = true' to enable them"
        );
    }

    for (name, section) in &settings.acme {
        validate_acme_section(name, section)
            .with_context(|| format!("acme section '{name}'"))?;
    }

    let mut seen = std::collections::BTreeSet::new();
    for certificate in &settings.certificates {
        if !seen.insert(&certificate.name) {
            bail!("duplicate certificate name '{}'", certificate.name);
        }
        if let Some(acme) = &certificate.acme
            && !settings.acme.contains_key(acme)
        {
            bail!(
                "certificate '{}' references unknown acme section '{acme}'",
                certificate.name
            );
        }
    }
    Ok(())
}

fn validate_acme_section(name: &str, section: &AcmeSection) -> Result<()> {
    if name.is_empty() {
        bail!("the section name must not be empty");
    }
    if section.uri.as_deref().is_none_or(|uri| uri.trim().is_empty()) {
        bail!("'uri' is required");
    }
    if let Some(challenge) = &section.challenge
        && ChallengeKind::parse(challenge).is_none()
    {
        bail!("unsupported challenge type '{challenge}' (expected HTTP-01 or DNS-01)");
    }

    match section.keytype.as_deref() {
        None | Some("ECDSA") => {
            if section.bits.is_some() {
                bail!("'bits' only applies to RSA keys");
            }
            if let Some(curves) = &section.curves
                && EcCurve::parse(curves).is_none()
            {
                bail!("unsupported curve '{curves}' (expected P-256 or P-384)");
            }
        }
        Some("RSA") => {
            if section.curves.is_some() {
                bail!("'curves' only applies to ECDSA keys");
            }
            if let Some(bits) = section.bits
                && !SUPPORTED_RSA_BITS.contains(&bits)
            {
                bail!("unsupported RSA key size {bits} (expected 2048, 3072 or 4096)");
            }
        }
        Some(other) => bail!("unsupported keytype '{other}' (expected RSA or ECDSA)"),
    }
    Ok(())
}

/// One fully initialized ACME identity: the validated section plus the
/// loaded account key and its thumbprint. Lives for the whole process;
/// renewals reference it through the registry.
#[derive(Debug)]
pub struct AcmeConfig {
    pub name: String,
    pub directory: String,
    pub contact: Option<String>,
    pub account_path: PathBuf,
    pub account_key: AccountKey,
    pub thumbprint: String,
    pub challenge: ChallengeKind,
    pub key_policy: KeyPolicy,
}

impl AcmeConfig {
    fn from_section(name: &str, section: &AcmeSection) -> Result<Self> {
        let directory = section
            .uri
            .clone()
            .ok_or_else(|| anyhow::anyhow!("'uri' is required"))?;
        let contact = section.contact.clone().map(|contact| {
            if contact.starts_with("mailto:") {
                contact
            } else {
                format!("mailto:{contact}")
            }
        });
        let account_path = section
            .account
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("{name}.account.key")));
        // The account key is never generated here: a missing file is a
        // startup failure, not a prompt to create one.
        let account_key = AccountKey::from_pem_file(&account_path)?;
        let thumbprint = account_key.thumbprint()?;

        let challenge = match &section.challenge {
            Some(value) => ChallengeKind::parse(value)
                .ok_or_else(|| anyhow::anyhow!("unsupported challenge type '{value}'"))?,
            None => ChallengeKind::default(),
        };

        let key_policy = match section.keytype.as_deref() {
            Some("RSA") => KeyPolicy::Rsa {
                bits: section.bits.unwrap_or(DEFAULT_RSA_BITS),
            },
            _ => {
                let curve = match &section.curves {
                    Some(value) => EcCurve::parse(value)
                        .ok_or_else(|| anyhow::anyhow!("unsupported curve '{value}'"))?,
                    None => DEFAULT_EC_CURVE,
                };
                KeyPolicy::Ec { curve }
            }
        };

        Ok(Self {
            name: name.to_string(),
            directory,
            contact,
            account_path,
            account_key,
            thumbprint,
            challenge,
            key_policy,
        })
    }
}

/// Every configured ACME identity, keyed by section name. Built once at
/// startup and read-only afterwards.
#[derive(Default, Debug)]
pub struct AcmeRegistry {
    configs: BTreeMap<String, Arc<AcmeConfig>>,
}

impl AcmeRegistry {
    /// Initializes every `[acme.*]` section, loading account keys and
    /// computing thumbprints.
    ///
    /// # Errors
    /// Returns an error if any section cannot be fully initialized (a
    /// missing or unusable account key file aborts startup).
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut configs = BTreeMap::new();
        for (name, section) in &settings.acme {
            let config = AcmeConfig::from_section(name, section)
                .with_context(|| format!("acme section '{name}'"))?;
            configs.insert(name.clone(), Arc::new(config));
        }
        Ok(Self { configs })
    }

    pub fn get(&self, name: &str) -> Option<Arc<AcmeConfig>> {
        self.configs.get(name).cloned()
    }
}
