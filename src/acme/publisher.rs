use tracing::info;

use crate::acme::types::ChallengeKind;

/// Hands challenge response material to whatever actually serves it: a
/// host-embedded HTTP responder, a DNS API client, or an operator reading
/// the log. For HTTP-01 the value is the key authorization to return under
/// `/.well-known/acme-challenge/<token>`; for DNS-01 it is the digest to
/// publish as the `_acme-challenge.<identifier>` TXT record.
pub trait ChallengePublisher: Send + Sync {
    /// Makes the response for `token` available before the challenge is
    /// signalled ready.
    ///
    /// # Errors
    /// Returns an error if the material cannot be published; the renewal
    /// treats this as a step failure.
    fn publish(
        &self,
        identifier: &str,
        kind: ChallengeKind,
        token: &str,
        value: &str,
    ) -> anyhow::Result<()>;

    /// Withdraws the response once the renewal ends, successfully or not.
    fn retract(&self, identifier: &str, token: &str) {
        let _ = (identifier, token);
    }
}

/// Default publisher: logs what an external responder needs to serve.
pub struct LogPublisher;

impl ChallengePublisher for LogPublisher {
    fn publish(
        &self,
        identifier: &str,
        kind: ChallengeKind,
        token: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        match kind {
            ChallengeKind::Http01 => info!(
                %identifier,
                "serve HTTP-01 response: /.well-known/acme-challenge/{token} -> {value}"
            ),
            ChallengeKind::Dns01 => info!(
                %identifier,
                "publish DNS-01 record: _acme-challenge.{identifier} TXT {value}"
            ),
        }
        Ok(())
    }

    fn retract(&self, identifier: &str, token: &str) {
        info!(%identifier, "challenge response for token {token} no longer needed");
    }
}
