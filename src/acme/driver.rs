use std::sync::Arc;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, error, info, warn};

use crate::acme::client::{HttpStep, StepRequest, StepResponse};
use crate::acme::csr::LeafKey;
use crate::acme::jws;
use crate::acme::publisher::ChallengePublisher;
use crate::acme::types::{
    Authorization, Challenge, ChallengeKind, ChallengeStatus, Directory, Order, OrderStatus,
    StepError, render_problem,
};
use crate::config::AcmeConfig;
use crate::store::{CertEntry, CertStore};

/// Attempts each protocol step gets before the renewal is abandoned.
pub const ACME_RETRY: u32 = 3;

/// The protocol position of a renewal. Paired with [`HttpPhase`]: every
/// state first issues its request, then consumes its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Resources,
    NewNonce,
    CheckAccount,
    NewAccount,
    NewOrder,
    Auth,
    Challenge,
    CheckChallenge,
    Finalize,
    CheckOrder,
    Certificate,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpPhase {
    /// The state's request has not been submitted yet.
    Request,
    /// The request is in flight or its response is being consumed.
    Response,
}

/// One authorization of the order, filled in as the driver walks it: the
/// authorization URL comes from the newOrder response, the challenge URL
/// and token from the authorization fetch.
#[derive(Debug, Clone)]
pub struct AuthzSlot {
    pub url: String,
    pub chall_url: Option<String>,
    pub token: Option<String>,
    pub identifier: Option<String>,
}

impl AuthzSlot {
    fn new(url: String) -> Self {
        Self {
            url,
            chall_url: None,
            token: None,
            identifier: None,
        }
    }
}

#[derive(Debug)]
enum Plan {
    /// Issue this request and suspend until its response arrives.
    Send(StepRequest),
    /// Nothing to send in this state (an iteration list drained); move on.
    Skip(OrderState),
}

/// One in-flight renewal. Owns the fresh leaf key, the CSR, and the
/// duplicate store entry that becomes live on success, plus the
/// collaborators the driving task needs; dropped when the task ends.
pub struct Renewal {
    cfg: Arc<AcmeConfig>,
    http: HttpStep,
    store: Arc<CertStore>,
    publisher: Arc<dyn ChallengePublisher>,

    leaf_key: LeafKey,
    csr_der: Vec<u8>,
    target: CertEntry,

    directory: Option<Directory>,
    nonce: Option<String>,
    kid: Option<String>,
    order_url: Option<String>,
    finalize_url: Option<String>,
    certificate_url: Option<String>,
    auths: Vec<AuthzSlot>,
    next_auth: usize,

    state: OrderState,
    phase: HttpPhase,
    retries: u32,
}

impl Renewal {
    pub fn new(
        cfg: Arc<AcmeConfig>,
        leaf_key: LeafKey,
        csr_der: Vec<u8>,
        target: CertEntry,
        http: HttpStep,
        store: Arc<CertStore>,
        publisher: Arc<dyn ChallengePublisher>,
    ) -> Self {
        Self {
            cfg,
            http,
            store,
            publisher,
            leaf_key,
            csr_der,
            target,
            directory: None,
            nonce: None,
            kid: None,
            order_url: None,
            finalize_url: None,
            certificate_url: None,
            auths: Vec::new(),
            next_auth: 0,
            state: OrderState::Resources,
            phase: HttpPhase::Request,
            retries: ACME_RETRY,
        }
    }

    pub fn state(&self) -> OrderState {
        self.state
    }

    pub fn phase(&self) -> HttpPhase {
        self.phase
    }

    /// Runs the renewal to completion. Requests are strictly sequential;
    /// the task suspends only while one is in flight. Each step gets
    /// [`ACME_RETRY`] attempts (polling included); when a step exhausts
    /// them the renewal is abandoned with the last error.
    ///
    /// # Errors
    /// Returns the last step error after the retry budget is exhausted.
    pub async fn drive(mut self) -> Result<()> {
        info!(
            cert = %self.target.name,
            acme = %self.cfg.name,
            directory = %self.cfg.directory,
            "starting certificate renewal"
        );
        let outcome = self.run().await;
        self.retract_published();
        match &outcome {
            Ok(()) => info!(cert = %self.target.name, "certificate renewal complete"),
            Err(err) => error!(cert = %self.target.name, "certificate renewal abandoned: {err:#}"),
        }
        outcome
    }

    async fn run(&mut self) -> Result<()> {
        while self.state != OrderState::Done {
            match self.step().await {
                Ok(()) => {
                    self.retries = ACME_RETRY;
                }
                Err(err) => {
                    self.phase = HttpPhase::Request;
                    self.retries -= 1;
                    if self.retries == 0 {
                        return Err(err);
                    }
                    warn!(
                        state = ?self.state,
                        retries_left = self.retries,
                        "renewal step failed, retrying: {err:#}"
                    );
                }
            }
        }
        Ok(())
    }

    /// One request/response exchange for the current state, or a no-op
    /// advance when the state has nothing left to send.
    async fn step(&mut self) -> Result<()> {
        let request = match self.build_step()? {
            Plan::Send(request) => request,
            Plan::Skip(next) => {
                debug!(from = ?self.state, to = ?next, "state drained, advancing");
                self.advance(next);
                return Ok(());
            }
        };

        self.phase = HttpPhase::Response;
        let response = self.http.issue(&request, self.state_label()).await?;
        self.handle_response(&response)?;
        self.phase = HttpPhase::Request;
        Ok(())
    }

    /// Builds the request for the current state. Pure protocol assembly:
    /// no network, testable in isolation.
    fn build_step(&mut self) -> Result<Plan> {
        let plan = match self.state {
            OrderState::Resources => Plan::Send(StepRequest::get(&self.cfg.directory)),
            OrderState::NewNonce => Plan::Send(StepRequest::head(&self.directory()?.new_nonce)),
            OrderState::CheckAccount => {
                let url = self.directory()?.new_account.clone();
                self.signed(&url, Some(r#"{"onlyReturnExisting":true}"#))?
            }
            OrderState::NewAccount => {
                let contact = self.cfg.contact.as_deref().ok_or_else(|| {
                    anyhow!(
                        "a 'contact' address is required to create an account for '{}'",
                        self.cfg.name
                    )
                })?;
                let payload = serde_json::to_string(&serde_json::json!({
                    "termsOfServiceAgreed": true,
                    "contact": [contact],
                }))?;
                let url = self.directory()?.new_account.clone();
                self.signed(&url, Some(&payload))?
            }
            OrderState::NewOrder => {
                let identifiers: Vec<serde_json::Value> = self
                    .target
                    .domains
                    .iter()
                    .map(|domain| serde_json::json!({ "type": "dns", "value": domain }))
                    .collect();
                let payload =
                    serde_json::to_string(&serde_json::json!({ "identifiers": identifiers }))?;
                let url = self.directory()?.new_order.clone();
                self.signed(&url, Some(&payload))?
            }
            OrderState::Auth => match self.auths.get(self.next_auth) {
                // POST-as-GET: the authorization fetch signs an empty payload.
                Some(auth) => self.signed(&auth.url.clone(), None)?,
                None => Plan::Skip(OrderState::Challenge),
            },
            OrderState::Challenge => match self.auths.get(self.next_auth) {
                Some(auth) => {
                    let url = self.challenge_url(auth)?;
                    self.signed(&url, Some("{}"))?
                }
                None => Plan::Skip(OrderState::CheckChallenge),
            },
            OrderState::CheckChallenge => match self.auths.get(self.next_auth) {
                Some(auth) => {
                    let url = self.challenge_url(auth)?;
                    self.signed(&url, None)?
                }
                None => Plan::Skip(OrderState::Finalize),
            },
            OrderState::Finalize => {
                let url = self
                    .finalize_url
                    .clone()
                    .ok_or_else(|| anyhow!("no finalize URL recorded for the order"))?;
                let payload = serde_json::to_string(
                    &serde_json::json!({ "csr": jws::b64(&self.csr_der) }),
                )?;
                self.signed(&url, Some(&payload))?
            }
            OrderState::CheckOrder => {
                let url = self
                    .order_url
                    .clone()
                    .ok_or_else(|| anyhow!("no order URL recorded"))?;
                self.signed(&url, None)?
            }
            OrderState::Certificate => {
                let url = self
                    .certificate_url
                    .clone()
                    .ok_or_else(|| anyhow!("no certificate URL recorded"))?;
                self.signed(&url, None)?
            }
            OrderState::Done => bail!("the renewal already completed"),
        };
        Ok(plan)
    }

    /// Consumes the response for the current state: harvest the nonce
    /// first, then classify and advance. Pure protocol interpretation,
    /// testable in isolation.
    fn handle_response(&mut self, response: &StepResponse) -> Result<()> {
        // Every response rotates the nonce, error responses included; a
        // badNonce failure is retried with the nonce carried here.
        if let Some(nonce) = &response.nonce {
            self.nonce = Some(nonce.clone());
        }

        match self.state {
            OrderState::Resources => {
                self.require_success(response)?;
                self.directory = Some(response.json("getting the directory URL")?);
                self.advance(OrderState::NewNonce);
            }
            OrderState::NewNonce => {
                self.require_success(response)?;
                if response.nonce.is_none() {
                    return Err(StepError::MissingHeader {
                        header: "Replay-Nonce",
                        what: "getting a new nonce",
                    }
                    .into());
                }
                self.advance(OrderState::CheckAccount);
            }
            OrderState::CheckAccount => {
                if response.is_success() {
                    self.kid = Some(self.required_location(response)?);
                    debug!(kid = ?self.kid, "existing ACME account found");
                    self.advance(OrderState::NewOrder);
                } else if response
                    .problem()
                    .is_some_and(|p| p.is_account_does_not_exist())
                {
                    debug!("no ACME account registered yet, creating one");
                    self.advance(OrderState::NewAccount);
                } else {
                    return Err(response.status_error(self.state_label()).into());
                }
            }
            OrderState::NewAccount => {
                self.require_success(response)?;
                self.kid = Some(self.required_location(response)?);
                info!(kid = ?self.kid, "ACME account created");
                self.advance(OrderState::NewOrder);
            }
            OrderState::NewOrder => {
                self.require_success(response)?;
                let order: Order = response.json(self.state_label())?;
                match order.status {
                    // `ready` still walks the (possibly empty) authorization
                    // list; finalize is required either way.
                    OrderStatus::Pending | OrderStatus::Ready => {}
                    status => bail!(
                        "unexpected order status {status:?} from newOrder{}",
                        render_problem(order.error.as_ref())
                    ),
                }
                self.order_url = Some(self.required_location(response)?);
                self.finalize_url = order.finalize;
                self.auths = order
                    .authorizations
                    .into_iter()
                    .map(AuthzSlot::new)
                    .collect();
                info!(
                    order = ?self.order_url,
                    authorizations = self.auths.len(),
                    "order created"
                );
                self.advance(OrderState::Auth);
            }
            OrderState::Auth => {
                self.require_success(response)?;
                let authz: Authorization = response.json(self.state_label())?;
                self.select_challenge(&authz)?;
                self.next_auth += 1;
            }
            OrderState::Challenge => {
                self.require_success(response)?;
                debug!(auth = self.next_auth, "challenge signalled ready");
                self.next_auth += 1;
            }
            OrderState::CheckChallenge => {
                self.require_success(response)?;
                let challenge: Challenge = response.json(self.state_label())?;
                match challenge.status {
                    Some(ChallengeStatus::Valid) => {
                        debug!(auth = self.next_auth, "challenge validated");
                        self.next_auth += 1;
                    }
                    Some(ChallengeStatus::Pending | ChallengeStatus::Processing) | None => {
                        bail!("challenge at {} is still pending", challenge.url)
                    }
                    Some(ChallengeStatus::Invalid) => bail!(
                        "challenge at {} failed{}",
                        challenge.url,
                        render_problem(challenge.error.as_ref())
                    ),
                }
            }
            OrderState::Finalize => {
                self.require_success(response)?;
                self.advance(OrderState::CheckOrder);
            }
            OrderState::CheckOrder => {
                self.require_success(response)?;
                let order: Order = response.json(self.state_label())?;
                match order.status {
                    OrderStatus::Valid => {
                        self.certificate_url = Some(order.certificate.ok_or_else(|| {
                            anyhow!("order is valid but carries no certificate URL")
                        })?);
                        self.advance(OrderState::Certificate);
                    }
                    OrderStatus::Pending | OrderStatus::Ready | OrderStatus::Processing => {
                        bail!("order is not valid yet")
                    }
                    OrderStatus::Invalid => {
                        bail!("order failed{}", render_problem(order.error.as_ref()))
                    }
                }
            }
            OrderState::Certificate => {
                self.require_success(response)?;
                let pem = std::str::from_utf8(&response.body)
                    .context("the certificate response is not valid UTF-8")?
                    .to_string();
                self.install_certificate(&pem)?;
                self.advance(OrderState::Done);
            }
            OrderState::Done => bail!("response received after the renewal completed"),
        }
        Ok(())
    }

    fn select_challenge(&mut self, authz: &Authorization) -> Result<()> {
        let wanted = self.cfg.challenge;
        let challenge = authz
            .challenges
            .iter()
            .find(|challenge| wanted.matches(&challenge.kind))
            .ok_or_else(|| {
                anyhow!(
                    "no {wanted} challenge offered for '{}' (offered: {})",
                    authz.identifier.value,
                    authz
                        .challenges
                        .iter()
                        .map(|c| c.kind.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })?;
        let token = challenge
            .token
            .clone()
            .ok_or_else(|| anyhow!("the selected challenge carries no token"))?;

        let key_auth = self.cfg.account_key.key_authorization(&token)?;
        let value = match wanted {
            ChallengeKind::Http01 => key_auth,
            ChallengeKind::Dns01 => jws::dns01_digest(&key_auth),
        };
        self.publisher
            .publish(&authz.identifier.value, wanted, &token, &value)
            .context("publishing the challenge response")?;

        let slot = &mut self.auths[self.next_auth];
        slot.chall_url = Some(challenge.url.clone());
        slot.token = Some(token);
        slot.identifier = Some(authz.identifier.value.clone());
        Ok(())
    }

    /// Parses the downloaded PEM chain into the duplicate entry, attaches
    /// the fresh leaf key, and hands the result to the hot-swap installer.
    /// The key lives in its own field, so PEM ingestion can never clobber
    /// it.
    fn install_certificate(&mut self, pem: &str) -> Result<()> {
        let chain_der = crate::store::parse_chain_pem(pem)?;
        self.log_leaf(&chain_der[0]);

        let mut entry = self.target.clone();
        entry.chain_pem = pem.to_string();
        entry.chain_der = chain_der;
        entry.key_pem = self.leaf_key.to_pem();
        entry.key = rustls::pki_types::PrivateKeyDer::from(
            rustls::pki_types::PrivatePkcs8KeyDer::from(self.leaf_key.to_pkcs8_der()),
        );
        self.store
            .install(&self.target.name, entry)
            .context("installing the renewed certificate")?;
        Ok(())
    }

    fn log_leaf(&self, der: &[u8]) {
        match x509_parser::parse_x509_certificate(der) {
            Ok((_, cert)) => {
                let not_after = cert.validity().not_after;
                let days_left = (not_after.to_datetime() - time::OffsetDateTime::now_utc())
                    .whole_days();
                info!(
                    cert = %self.target.name,
                    subject = %cert.subject(),
                    not_after = %not_after,
                    days_left,
                    "certificate issued"
                );
            }
            Err(err) => warn!("could not parse the issued leaf certificate: {err}"),
        }
    }

    fn retract_published(&self) {
        for auth in &self.auths {
            // identifier and token are filled together when the challenge
            // is selected.
            if let (Some(identifier), Some(token)) = (&auth.identifier, &auth.token) {
                self.publisher.retract(identifier, token);
            }
        }
    }

    /// Signs a POST for the current account state: `kid` once the account
    /// URL is known, the public `jwk` before that.
    fn signed(&self, url: &str, payload: Option<&str>) -> Result<Plan> {
        let nonce = self
            .nonce
            .as_deref()
            .ok_or_else(|| anyhow!("no nonce available for signing"))?;
        let jws = self
            .cfg
            .account_key
            .sign(url, nonce, self.kid.as_deref(), payload)
            .context("building the request JWS")?;
        Ok(Plan::Send(StepRequest::post(url, serde_json::to_string(&jws)?)))
    }

    fn challenge_url(&self, auth: &AuthzSlot) -> Result<String> {
        auth.chall_url
            .clone()
            .ok_or_else(|| anyhow!("no challenge selected for authorization {}", auth.url))
    }

    fn directory(&self) -> Result<&Directory> {
        self.directory
            .as_ref()
            .ok_or_else(|| anyhow!("the directory has not been fetched yet"))
    }

    fn require_success(&self, response: &StepResponse) -> Result<(), StepError> {
        if response.is_success() {
            Ok(())
        } else {
            Err(response.status_error(self.state_label()))
        }
    }

    fn required_location(&self, response: &StepResponse) -> Result<String, StepError> {
        response.location.clone().ok_or(StepError::MissingHeader {
            header: "Location",
            what: self.state_label(),
        })
    }

    fn advance(&mut self, next: OrderState) {
        debug!(from = ?self.state, to = ?next, "order state advanced");
        self.state = next;
        self.next_auth = 0;
    }

    fn state_label(&self) -> &'static str {
        match self.state {
            OrderState::Resources => "getting the directory URL",
            OrderState::NewNonce => "getting a new nonce",
            OrderState::CheckAccount => "checking the account",
            OrderState::NewAccount => "creating the account",
            OrderState::NewOrder => "getting the newOrder URL",
            OrderState::Auth => "getting the authorization URL",
            OrderState::Challenge => "signalling the challenge",
            OrderState::CheckChallenge => "checking the challenge",
            OrderState::Finalize => "finalizing the order",
            OrderState::CheckOrder => "checking the order",
            OrderState::Certificate => "downloading the certificate",
            OrderState::Done => "completing the renewal",
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::acme::csr::{self, KeyPolicy};
    use crate::acme::jws::AccountKey;
    use crate::acme::publisher::LogPublisher;
    use crate::acme::types::ChallengeKind;
    use crate::config::AcmeConfig;
    use crate::store::CertStore;

    use super::*;

    fn test_cfg(challenge: ChallengeKind) -> Arc<AcmeConfig> {
        let pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let account_key = AccountKey::from_pkcs8_der(&pair.serialize_der()).unwrap();
        let thumbprint = account_key.thumbprint().unwrap();
        Arc::new(AcmeConfig {
            name: "test-ca".to_string(),
            directory: "https://ca.example/directory".to_string(),
            contact: Some("mailto:admin@example.com".to_string()),
            account_path: "test-ca.account.key".into(),
            account_key,
            thumbprint,
            challenge,
            key_policy: KeyPolicy::default(),
        })
    }

    fn test_entry(domains: &[&str]) -> CertEntry {
        let rcgen::CertifiedKey { cert, signing_key } = rcgen::generate_simple_self_signed(
            domains.iter().map(ToString::to_string).collect::<Vec<_>>(),
        )
        .unwrap();
        let key_pem = signing_key.serialize_pem();
        let key = rustls_pemfile::private_key(&mut key_pem.as_bytes())
            .unwrap()
            .unwrap();
        CertEntry {
            name: "site.pem".to_string(),
            cert_path: "site.pem".into(),
            key_path: "site.key".into(),
            domains: domains.iter().map(ToString::to_string).collect(),
            acme: Some("test-ca".to_string()),
            chain_pem: cert.pem(),
            chain_der: vec![cert.der().to_vec()],
            key_pem,
            key,
            bindings: Vec::new(),
        }
    }

    fn test_renewal(challenge: ChallengeKind, domains: &[&str]) -> Renewal {
        let cfg = test_cfg(challenge);
        let leaf_key = csr::LeafKey::generate(&cfg.key_policy).unwrap();
        let entry = test_entry(domains);
        let csr_der = csr::build_csr(&leaf_key, &entry.domains).unwrap();
        Renewal::new(
            cfg,
            leaf_key,
            csr_der,
            entry,
            HttpStep::new().unwrap(),
            Arc::new(CertStore::new()),
            Arc::new(LogPublisher),
        )
    }

    fn response(status: u16, nonce: Option<&str>, body: serde_json::Value) -> StepResponse {
        StepResponse {
            status,
            nonce: nonce.map(ToString::to_string),
            location: None,
            body: serde_json::to_vec(&body).unwrap(),
        }
    }

    fn decoded_protected(request: &StepRequest) -> serde_json::Value {
        use base64::Engine;
        let body: serde_json::Value =
            serde_json::from_str(request.body.as_deref().unwrap()).unwrap();
        let protected = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(body["protected"].as_str().unwrap())
            .unwrap();
        serde_json::from_slice(&protected).unwrap()
    }

    fn prime_directory(renewal: &mut Renewal) {
        renewal.directory = Some(Directory {
            new_nonce: "https://ca.example/new-nonce".to_string(),
            new_account: "https://ca.example/new-account".to_string(),
            new_order: "https://ca.example/new-order".to_string(),
        });
        renewal.nonce = Some("nonce-0".to_string());
    }

    #[test]
    fn test_nonce_rotates_even_on_error_responses() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::NewOrder;

        let err = renewal.handle_response(&response(
            400,
            Some("fresh-nonce"),
            serde_json::json!({
                "type": "urn:ietf:params:acme:error:badNonce",
                "detail": "bad nonce"
            }),
        ));
        assert!(err.is_err());
        // The nonce of the failed exchange is the one the retry must sign with.
        assert_eq!(renewal.nonce.as_deref(), Some("fresh-nonce"));
        let Plan::Send(request) = renewal.build_step().unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(decoded_protected(&request)["nonce"], "fresh-nonce");
    }

    #[test]
    fn test_missing_replay_nonce_keeps_the_stored_nonce() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::Challenge;
        let slots: Vec<AuthzSlot> = (1..=2)
            .map(|i| {
                let mut slot = AuthzSlot::new(format!("https://ca.example/authz/{i}"));
                slot.chall_url = Some(format!("https://ca.example/chall/{i}"));
                slot.token = Some(format!("t{i}"));
                slot
            })
            .collect();
        renewal.auths = slots;

        renewal
            .handle_response(&response(200, None, serde_json::json!({ "status": "pending" })))
            .unwrap();
        // The next POST signs with the previously stored nonce; the server
        // may reject it with badNonce, which is retried.
        let Plan::Send(request) = renewal.build_step().unwrap() else {
            panic!("expected a request");
        };
        assert_eq!(decoded_protected(&request)["nonce"], "nonce-0");
    }

    #[test]
    fn test_account_probe_routes_to_creation_when_absent() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::CheckAccount;

        renewal
            .handle_response(&response(
                400,
                Some("n1"),
                serde_json::json!({
                    "type": "urn:ietf:params:acme:error:accountDoesNotExist",
                    "detail": "no such account"
                }),
            ))
            .unwrap();
        assert_eq!(renewal.state(), OrderState::NewAccount);
    }

    #[test]
    fn test_account_location_becomes_kid_and_replaces_jwk() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::CheckAccount;

        // Before the account is known, POSTs embed the public JWK.
        let Plan::Send(request) = renewal.build_step().unwrap() else {
            panic!("expected a request");
        };
        let protected = decoded_protected(&request);
        assert!(protected.get("jwk").is_some());
        assert!(protected.get("kid").is_none());

        let mut resp = response(200, Some("n1"), serde_json::json!({ "status": "valid" }));
        resp.location = Some("https://ca.example/acct/7".to_string());
        renewal.handle_response(&resp).unwrap();
        assert_eq!(renewal.state(), OrderState::NewOrder);

        // Afterwards, every POST carries the kid and no JWK.
        let Plan::Send(request) = renewal.build_step().unwrap() else {
            panic!("expected a request");
        };
        let protected = decoded_protected(&request);
        assert_eq!(protected["kid"], "https://ca.example/acct/7");
        assert!(protected.get("jwk").is_none());
    }

    #[test]
    fn test_new_order_ready_status_still_iterates_authorizations() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::NewOrder;

        let mut resp = response(
            201,
            Some("n1"),
            serde_json::json!({
                "status": "ready",
                "finalize": "https://ca.example/finalize/1",
                "authorizations": []
            }),
        );
        resp.location = Some("https://ca.example/order/1".to_string());
        renewal.handle_response(&resp).unwrap();
        assert_eq!(renewal.state(), OrderState::Auth);

        // Zero authorizations: Auth, Challenge and CheckChallenge all drain
        // without issuing a request; finalize still runs.
        let Plan::Skip(next) = renewal.build_step().unwrap() else {
            panic!("expected a drained state");
        };
        assert_eq!(next, OrderState::Challenge);
        renewal.advance(next);
        let Plan::Skip(next) = renewal.build_step().unwrap() else {
            panic!("expected a drained state");
        };
        assert_eq!(next, OrderState::CheckChallenge);
        renewal.advance(next);
        let Plan::Skip(next) = renewal.build_step().unwrap() else {
            panic!("expected a drained state");
        };
        assert_eq!(next, OrderState::Finalize);
    }

    #[test]
    fn test_missing_location_on_new_order_is_an_error() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::NewOrder;

        let err = renewal
            .handle_response(&response(
                201,
                Some("n1"),
                serde_json::json!({
                    "status": "pending",
                    "finalize": "https://ca.example/finalize/1",
                    "authorizations": ["https://ca.example/authz/1"]
                }),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("Location"));
    }

    #[test]
    fn test_challenge_selection_mismatch_fails() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::Auth;
        renewal.auths = vec![AuthzSlot::new("https://ca.example/authz/1".to_string())];

        let err = renewal
            .handle_response(&response(
                200,
                Some("n1"),
                serde_json::json!({
                    "status": "pending",
                    "identifier": { "type": "dns", "value": "example.com" },
                    "challenges": [
                        { "type": "dns-01", "url": "https://ca.example/chall/1", "token": "t" }
                    ]
                }),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("no http-01 challenge offered"));
    }

    #[test]
    fn test_challenge_selection_is_case_insensitive_and_fills_slot() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::Auth;
        renewal.auths = vec![AuthzSlot::new("https://ca.example/authz/1".to_string())];

        renewal
            .handle_response(&response(
                200,
                Some("n1"),
                serde_json::json!({
                    "status": "pending",
                    "identifier": { "type": "dns", "value": "example.com" },
                    "challenges": [
                        { "type": "dns-01", "url": "https://ca.example/chall/dns", "token": "td" },
                        { "type": "HTTP-01", "url": "https://ca.example/chall/http", "token": "th" }
                    ]
                }),
            ))
            .unwrap();
        assert_eq!(
            renewal.auths[0].chall_url.as_deref(),
            Some("https://ca.example/chall/http")
        );
        assert_eq!(renewal.auths[0].token.as_deref(), Some("th"));
        assert_eq!(renewal.next_auth, 1);
    }

    #[test]
    fn test_pending_challenge_poll_is_a_step_failure_that_stays_put() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::CheckChallenge;
        let mut slot = AuthzSlot::new("https://ca.example/authz/1".to_string());
        slot.chall_url = Some("https://ca.example/chall/1".to_string());
        slot.token = Some("t".to_string());
        renewal.auths = vec![slot];

        let err = renewal
            .handle_response(&response(
                200,
                Some("n1"),
                serde_json::json!({
                    "type": "http-01",
                    "url": "https://ca.example/chall/1",
                    "token": "t",
                    "status": "processing"
                }),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("still pending"));
        assert_eq!(renewal.state(), OrderState::CheckChallenge);
        assert_eq!(renewal.next_auth, 0);
    }

    #[test]
    fn test_valid_order_poll_captures_certificate_url() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.state = OrderState::CheckOrder;
        renewal.order_url = Some("https://ca.example/order/1".to_string());

        let err = renewal
            .handle_response(&response(
                200,
                Some("n1"),
                serde_json::json!({
                    "status": "processing",
                    "finalize": "https://ca.example/finalize/1"
                }),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("not valid yet"));

        renewal
            .handle_response(&response(
                200,
                Some("n2"),
                serde_json::json!({
                    "status": "valid",
                    "finalize": "https://ca.example/finalize/1",
                    "certificate": "https://ca.example/cert/1"
                }),
            ))
            .unwrap();
        assert_eq!(renewal.state(), OrderState::Certificate);
        assert_eq!(
            renewal.certificate_url.as_deref(),
            Some("https://ca.example/cert/1")
        );
    }

    #[test]
    fn test_post_without_nonce_is_rejected() {
        let mut renewal = test_renewal(ChallengeKind::Http01, &["example.com"]);
        prime_directory(&mut renewal);
        renewal.nonce = None;
        renewal.state = OrderState::CheckAccount;
        let err = renewal.build_step().unwrap_err();
        assert!(err.to_string().contains("no nonce available"));
    }

    #[test]
    fn test_dns01_publishes_digest_not_key_authorization() {
        use std::sync::Mutex as StdMutex;

        struct Recorder(StdMutex<Vec<(String, String)>>);
        impl ChallengePublisher for Recorder {
            fn publish(
                &self,
                _identifier: &str,
                _kind: ChallengeKind,
                token: &str,
                value: &str,
            ) -> anyhow::Result<()> {
                self.0
                    .lock()
                    .unwrap()
                    .push((token.to_string(), value.to_string()));
                Ok(())
            }
        }

        let recorder = Arc::new(Recorder(StdMutex::new(Vec::new())));
        let mut renewal = test_renewal(ChallengeKind::Dns01, &["example.com"]);
        renewal.publisher = recorder.clone();
        prime_directory(&mut renewal);
        renewal.state = OrderState::Auth;
        renewal.auths = vec![AuthzSlot::new("https://ca.example/authz/1".to_string())];

        renewal
            .handle_response(&response(
                200,
                Some("n1"),
                serde_json::json!({
                    "status": "pending",
                    "identifier": { "type": "dns", "value": "example.com" },
                    "challenges": [
                        { "type": "dns-01", "url": "https://ca.example/chall/1", "token": "tok" }
                    ]
                }),
            ))
            .unwrap();

        let published = recorder.0.lock().unwrap();
        assert_eq!(published.len(), 1);
        let key_auth = renewal.cfg.account_key.key_authorization("tok").unwrap();
        assert_eq!(published[0].1, jws::dns01_digest(&key_auth));
    }
}
