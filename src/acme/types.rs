use serde::Deserialize;
use thiserror::Error;

pub const ERROR_URN_PREFIX: &str = "urn:ietf:params:acme:error:";

const URN_BAD_NONCE: &str = "urn:ietf:params:acme:error:badNonce";
const URN_ACCOUNT_DOES_NOT_EXIST: &str = "urn:ietf:params:acme:error:accountDoesNotExist";

/// The directory resource: the ACME server's entry point enumerating the
/// endpoint URLs every other step needs.
#[derive(Debug, Deserialize, Clone)]
pub struct Directory {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

/// The challenge type an ACME identity is configured to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChallengeKind {
    #[default]
    Http01,
    Dns01,
}

impl ChallengeKind {
    /// The `type` value used on the wire (RFC 8555 §8).
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Http01 => "http-01",
            Self::Dns01 => "dns-01",
        }
    }

    /// Case-insensitive match against a challenge object's `type` field.
    pub fn matches(self, wire_type: &str) -> bool {
        wire_type.eq_ignore_ascii_case(self.wire_name())
    }

    /// Parses the configuration spelling (`HTTP-01` / `DNS-01`, any case).
    pub fn parse(value: &str) -> Option<Self> {
        if value.eq_ignore_ascii_case("http-01") {
            Some(Self::Http01)
        } else if value.eq_ignore_ascii_case("dns-01") {
            Some(Self::Dns01)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ChallengeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Order {
    pub status: OrderStatus,
    pub finalize: Option<String>,
    #[serde(default)]
    pub authorizations: Vec<String>,
    pub certificate: Option<String>,
    pub error: Option<Problem>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Identifier {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct Authorization {
    pub status: AuthorizationStatus,
    pub identifier: Identifier,
    pub challenges: Vec<Challenge>,
}

/// One entry of an authorization's `challenges` array. The `type` stays a
/// plain string so servers offering types we do not know about still parse;
/// selection compares case-insensitively against the configured kind.
#[derive(Debug, Deserialize, Clone)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub token: Option<String>,
    pub status: Option<ChallengeStatus>,
    pub error: Option<Problem>,
}

/// RFC 7807 problem document as ACME servers emit it (RFC 8555 §6.7).
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Problem {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub detail: Option<String>,
}

impl Problem {
    pub fn is(&self, urn: &str) -> bool {
        self.kind.as_deref() == Some(urn)
    }

    pub fn is_bad_nonce(&self) -> bool {
        self.is(URN_BAD_NONCE)
    }

    pub fn is_account_does_not_exist(&self) -> bool {
        self.is(URN_ACCOUNT_DOES_NOT_EXIST)
    }
}

pub(crate) fn render_problem(problem: Option<&Problem>) -> String {
    let Some(problem) = problem else {
        return String::new();
    };
    match (problem.detail.as_deref(), problem.kind.as_deref()) {
        (Some(detail), Some(kind)) => format!(": '{detail}' ({kind})"),
        (Some(detail), None) => format!(": '{detail}'"),
        (None, Some(kind)) => format!(": ({kind})"),
        (None, None) => String::new(),
    }
}

/// A single failed exchange with the ACME server. The driver consumes one
/// retry per `StepError` and branches on the embedded problem document.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("invalid HTTP status code {status} when {what}{}", render_problem(.problem.as_ref()))]
    Status {
        status: u16,
        what: &'static str,
        problem: Option<Problem>,
    },

    #[error("error when {what}: {source}")]
    Transport {
        what: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("missing {header} header when {what}")]
    MissingHeader {
        header: &'static str,
        what: &'static str,
    },

    #[error("invalid response body when {what}: {source}")]
    Body {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl StepError {
    pub fn problem(&self) -> Option<&Problem> {
        match self {
            Self::Status { problem, .. } => problem.as_ref(),
            _ => None,
        }
    }
}
