use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use thiserror::Error;
use tracing::{debug, info};

const KEY_FILE_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("operations on certificates are currently locked")]
    Locked,

    #[error("certificate '{0}' not found in the store")]
    NotFound(String),

    #[error("certificate '{0}' is already present in the store")]
    Duplicate(String),

    #[error("rebuilding the TLS binding for listener '{listener}': {source}")]
    Rebuild {
        listener: String,
        source: rustls::Error,
    },
}

/// One TLS attachment of a certificate: a listener name plus the slot its
/// handshakes resolve the certificate from. The slot is shared between the
/// store entry and the SNI resolver, so publishing a new `CertifiedKey`
/// into it retargets every future handshake without touching the store.
#[derive(Clone)]
pub struct Binding {
    pub listener: String,
    slot: Arc<RwLock<Arc<CertifiedKey>>>,
}

impl Binding {
    fn new(listener: &str, certified: CertifiedKey) -> Self {
        Self {
            listener: listener.to_string(),
            slot: Arc::new(RwLock::new(Arc::new(certified))),
        }
    }

    fn publish(&self, certified: Arc<CertifiedKey>) {
        *self.slot.write() = certified;
    }

    /// The certificate a handshake through this binding would present.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        self.slot.read().clone()
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("listener", &self.listener)
            .finish_non_exhaustive()
    }
}

/// One certificate in the store: the PEM material, its parsed DER, the key,
/// and the TLS bindings serving it. Cloning shares the binding slots; the
/// hot swap depends on that to retarget live listeners.
pub struct CertEntry {
    pub name: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub domains: Vec<String>,
    pub acme: Option<String>,
    pub chain_pem: String,
    pub chain_der: Vec<Vec<u8>>,
    pub key_pem: String,
    pub key: PrivateKeyDer<'static>,
    pub bindings: Vec<Binding>,
}

impl Clone for CertEntry {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            domains: self.domains.clone(),
            acme: self.acme.clone(),
            chain_pem: self.chain_pem.clone(),
            chain_der: self.chain_der.clone(),
            key_pem: self.key_pem.clone(),
            key: self.key.clone_key(),
            bindings: self.bindings.clone(),
        }
    }
}

impl std::fmt::Debug for CertEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertEntry")
            .field("name", &self.name)
            .field("domains", &self.domains)
            .field("acme", &self.acme)
            .field("bindings", &self.bindings)
            .finish_non_exhaustive()
    }
}

/// Held by maintenance paths that need the store to themselves (the same
/// exclusion renewal triggering and installation use). Dropping it releases
/// the store.
pub struct UpdateGuard<'a> {
    _entries: MutexGuard<'a, HashMap<String, CertEntry>>,
}

/// The live certificate index, keyed by certificate name (its store path).
/// A single store-wide mutex covers every writer; all writers acquire it
/// with try-lock and surface `StoreError::Locked` instead of waiting.
/// Handshake-path readers go through the binding slots and never take it.
pub struct CertStore {
    entries: Mutex<HashMap<String, CertEntry>>,
    provider: Arc<CryptoProvider>,
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CertStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            provider: Arc::new(rustls::crypto::ring::default_provider()),
        }
    }

    /// Adds a loaded certificate to the index.
    ///
    /// # Errors
    /// Returns `Locked` if another update is in progress, `Duplicate` if an
    /// entry with the same name exists.
    pub fn insert(&self, entry: CertEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        if entries.contains_key(&entry.name) {
            return Err(StoreError::Duplicate(entry.name));
        }
        debug!(name = %entry.name, domains = ?entry.domains, "certificate added to the store");
        entries.insert(entry.name.clone(), entry);
        Ok(())
    }

    /// Attaches a listener to a certificate, building its initial
    /// `CertifiedKey`, and returns the binding for resolver registration.
    ///
    /// # Errors
    /// Returns `Locked`, `NotFound`, or `Rebuild` if the entry's material
    /// does not form a usable certificate.
    pub fn bind(&self, name: &str, listener: &str) -> Result<Binding, StoreError> {
        let mut entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        let certified = certified_key(&self.provider, &entry.chain_der, &entry.key)
            .map_err(|source| StoreError::Rebuild {
                listener: listener.to_string(),
                source,
            })?;
        let binding = Binding::new(listener, certified);
        entry.bindings.push(binding.clone());
        Ok(binding)
    }

    /// Clones the entry a renewal will replace. The clone shares the live
    /// entry's binding slots; everything else is owned by the caller.
    ///
    /// # Errors
    /// Returns `Locked` if another update is in progress, `NotFound` if the
    /// name is not in the index.
    pub fn duplicate_for_renewal(&self, name: &str) -> Result<CertEntry, StoreError> {
        let entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// The hot swap. Under the store-wide try-lock, rebuilds every TLS
    /// binding of the live entry against the new entry's material, links
    /// the rebuilt bindings into the new entry, and replaces the index
    /// slot. Rebuilding is two-phase: nothing is published until every
    /// binding has a new `CertifiedKey`, so a failure leaves the live entry
    /// and every handshake untouched.
    ///
    /// # Errors
    /// Returns `Locked`, `NotFound`, or the first `Rebuild` failure.
    pub fn install(&self, name: &str, mut new_entry: CertEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        let live = entries
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;

        let mut rebuilt = Vec::with_capacity(live.bindings.len());
        for binding in &live.bindings {
            let certified = certified_key(&self.provider, &new_entry.chain_der, &new_entry.key)
                .map_err(|source| StoreError::Rebuild {
                    listener: binding.listener.clone(),
                    source,
                })?;
            rebuilt.push((binding.clone(), Arc::new(certified)));
        }

        new_entry.bindings = rebuilt.iter().map(|(binding, _)| binding.clone()).collect();
        for (binding, certified) in rebuilt {
            debug!(name, listener = %binding.listener, "TLS binding rebuilt");
            binding.publish(certified);
        }
        info!(name, bindings = new_entry.bindings.len(), "certificate replaced in the store");
        entries.insert(name.to_string(), new_entry);
        Ok(())
    }

    /// Read access for inspection and persistence; not a handshake path.
    ///
    /// # Errors
    /// Returns `Locked` or `NotFound`.
    pub fn entry(&self, name: &str) -> Result<CertEntry, StoreError> {
        let entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        entries
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Takes the store-wide lock for a maintenance operation, failing
    /// instead of waiting if an update is already in progress.
    ///
    /// # Errors
    /// Returns `Locked` if the store is busy.
    pub fn begin_update(&self) -> Result<UpdateGuard<'_>, StoreError> {
        let entries = self.entries.try_lock().ok_or(StoreError::Locked)?;
        Ok(UpdateGuard { _entries: entries })
    }
}

fn certified_key(
    provider: &Arc<CryptoProvider>,
    chain_der: &[Vec<u8>],
    key: &PrivateKeyDer<'static>,
) -> Result<CertifiedKey, rustls::Error> {
    let chain = chain_der
        .iter()
        .map(|der| CertificateDer::from(der.clone()))
        .collect();
    CertifiedKey::from_der(chain, key.clone_key(), provider)
}

/// Resolves handshakes to binding slots by exact SNI match. Reads never
/// touch the store mutex, so a handshake observes either the pre-swap or
/// the post-swap certificate of its binding, never a torn pair.
#[derive(Default)]
pub struct SniResolver {
    by_name: RwLock<HashMap<String, Binding>>,
}

impl SniResolver {
    pub fn register(&self, domain: &str, binding: Binding) {
        self.by_name
            .write()
            .insert(domain.to_ascii_lowercase(), binding);
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("domains", &self.by_name.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.by_name
            .read()
            .get(&name.to_ascii_lowercase())
            .map(Binding::certified_key)
    }
}

/// Parses a PEM chain into DER certificates.
///
/// # Errors
/// Returns an error if the PEM is malformed or contains no certificates.
pub fn parse_chain_pem(pem: &str) -> Result<Vec<Vec<u8>>> {
    let chain: Vec<Vec<u8>> = rustls_pemfile::certs(&mut pem.as_bytes())
        .map(|cert| cert.map(|der| der.to_vec()))
        .collect::<std::io::Result<_>>()
        .context("parsing the certificate chain PEM")?;
    anyhow::ensure!(!chain.is_empty(), "the certificate chain PEM contains no certificates");
    Ok(chain)
}

/// Loads a certificate and its key from disk into a store entry.
///
/// # Errors
/// Returns an error if either file is missing or unparsable.
pub fn load_entry(
    name: &str,
    cert_path: &Path,
    key_path: &Path,
    domains: Vec<String>,
    acme: Option<String>,
) -> Result<CertEntry> {
    let chain_pem = std::fs::read_to_string(cert_path)
        .with_context(|| format!("reading certificate file {}", cert_path.display()))?;
    let chain_der = parse_chain_pem(&chain_pem)
        .with_context(|| format!("certificate file {}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(key_path)
        .with_context(|| format!("reading key file {}", key_path.display()))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .with_context(|| format!("parsing key file {}", key_path.display()))?
        .ok_or_else(|| anyhow::anyhow!("no private key found in {}", key_path.display()))?;

    Ok(CertEntry {
        name: name.to_string(),
        cert_path: cert_path.to_path_buf(),
        key_path: key_path.to_path_buf(),
        domains,
        acme,
        chain_pem,
        chain_der,
        key_pem,
        key,
        bindings: Vec::new(),
    })
}

/// Writes an entry's chain and key back to its configured paths, the key
/// with owner-only permissions.
///
/// # Errors
/// Returns an error if a file cannot be written or permissions cannot be
/// applied.
pub fn persist_entry(entry: &CertEntry) -> Result<()> {
    std::fs::write(&entry.cert_path, &entry.chain_pem)
        .with_context(|| format!("writing certificate file {}", entry.cert_path.display()))?;
    std::fs::write(&entry.key_path, &entry.key_pem)
        .with_context(|| format!("writing key file {}", entry.key_path.display()))?;
    std::fs::set_permissions(
        &entry.key_path,
        std::fs::Permissions::from_mode(KEY_FILE_MODE),
    )
    .with_context(|| format!("setting permissions on {}", entry.key_path.display()))?;
    info!(cert = %entry.cert_path.display(), key = %entry.key_path.display(), "certificate persisted");
    Ok(())
}
