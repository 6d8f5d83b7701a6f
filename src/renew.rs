use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::acme::client::HttpStep;
use crate::acme::csr::{self, LeafKey};
use crate::acme::driver::Renewal;
use crate::acme::publisher::ChallengePublisher;
use crate::config::AcmeRegistry;
use crate::store::CertStore;

/// Validates a renewal request and spawns its driver task.
///
/// Everything up to the spawn is synchronous: the store lookup and
/// duplication run under the store-wide try-lock, then the leaf key and CSR
/// are built outside it. Any failure here is returned to the caller
/// directly and nothing is spawned; after the spawn the task owns the
/// renewal and reports only through the log.
///
/// # Errors
/// Returns an error if the store is locked, the certificate is unknown or
/// carries no ACME binding, or key/CSR generation fails.
pub fn spawn_renewal(
    store: Arc<CertStore>,
    registry: &AcmeRegistry,
    http: HttpStep,
    publisher: Arc<dyn ChallengePublisher>,
    certname: &str,
) -> Result<JoinHandle<Result<()>>> {
    let target = store.duplicate_for_renewal(certname)?;
    let acme_name = target.acme.as_deref().ok_or_else(|| {
        anyhow!("certificate '{certname}' is not bound to any ACME configuration")
    })?;
    let cfg = registry.get(acme_name).ok_or_else(|| {
        anyhow!("certificate '{certname}' references unknown ACME configuration '{acme_name}'")
    })?;

    let leaf_key = LeafKey::generate(&cfg.key_policy)?;
    let csr_der = csr::build_csr(&leaf_key, &target.domains)?;
    debug!(
        cert = certname,
        acme = acme_name,
        domains = ?target.domains,
        "renewal prepared, spawning driver task"
    );

    let renewal = Renewal::new(cfg, leaf_key, csr_der, target, http, store, publisher);
    Ok(tokio::spawn(renewal.drive()))
}
