//! SASL negotiation boundary.
//!
//! Only the start/step contract lives here: a [`SaslSession`] owns an
//! opaque mechanism chosen at `start` and threads client payloads through
//! it. Mechanisms consult the password database for verification material
//! and never see plaintext user records beyond that. A minimal PLAIN
//! mechanism is carried in-tree so the server authenticates end to end;
//! SCRAM variants plug in through the same [`Mechanism`] trait.

use std::fmt;
use std::sync::Arc;

use miette::Diagnostic;
use parking_lot::RwLock;
use rand::RngCore;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

/// Mechanisms advertised by this build, strongest first.
const MECHANISMS: &[&str] = &["PLAIN"];

/// Callback overriding client-nonce generation, for deterministic tests of
/// nonce-bearing mechanisms.
pub type CnonceCallback = Arc<dyn Fn() -> Vec<u8> + Send + Sync>;

/// Errors surfaced by SASL negotiation.
#[derive(Debug, Error, Diagnostic)]
pub enum SaslError {
    /// The requested mechanism is not supported.
    #[error("unknown SASL mechanism: {name}")]
    #[diagnostic(
        code(tidemark::sasl::unknown_mechanism),
        help("Ask the server for its mechanism list with SASL_LIST_MECHS.")
    )]
    UnknownMechanism { name: String },

    /// Malformed client payload.
    #[error("malformed SASL payload: {reason}")]
    #[diagnostic(code(tidemark::sasl::bad_param))]
    BadParam { reason: String },

    /// `step` called before a successful `start`.
    #[error("SASL step without an active mechanism")]
    #[diagnostic(code(tidemark::sasl::no_mechanism))]
    NoMechanism,

    /// Credentials did not verify.
    #[error("authentication failed")]
    #[diagnostic(code(tidemark::sasl::auth_failed))]
    AuthFailed,
}

/// Progress of a negotiation after `start` or `step`.
#[derive(Debug, PartialEq, Eq)]
pub enum SaslStep {
    /// Authentication complete; optional final server payload.
    Done(Option<Vec<u8>>),
    /// More round-trips required; the payload goes back to the client.
    Continue(Vec<u8>),
}

/// The password database consulted by mechanisms.
///
/// Loaded from the JSON user/password file. Mechanisms fetch verification
/// material per user; nothing else is exposed.
#[derive(Debug, Default)]
pub struct PasswordDatabase {
    users: RwLock<FxHashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct PasswordFile {
    users: FxHashMap<String, String>,
}

impl PasswordDatabase {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the JSON password file: `{"users": {"<name>": "<secret>"}}`.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let parsed: PasswordFile = serde_json::from_str(json)?;
        Ok(Self {
            users: RwLock::new(parsed.users),
        })
    }

    /// Replace the database contents (hot reload).
    pub fn reload_json(&self, json: &str) -> Result<(), serde_json::Error> {
        let parsed: PasswordFile = serde_json::from_str(json)?;
        *self.users.write() = parsed.users;
        Ok(())
    }

    pub fn insert(&self, user: impl Into<String>, password: impl Into<String>) {
        self.users.write().insert(user.into(), password.into());
    }

    fn verify(&self, user: &str, password: &[u8]) -> bool {
        self.users
            .read()
            .get(user)
            .is_some_and(|stored| constant_time_eq(stored.as_bytes(), password))
    }
}

/// Constant-time comparison so verification does not leak prefix lengths.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// One SASL mechanism implementation.
pub trait Mechanism: Send {
    fn name(&self) -> &'static str;
    fn start(&mut self, input: &[u8]) -> Result<SaslStep, SaslError>;
    fn step(&mut self, input: &[u8]) -> Result<SaslStep, SaslError>;
    /// The authenticated username, available once negotiation completed.
    fn username(&self) -> Option<&str>;
}

/// PLAIN (RFC 4616): a single `authzid \0 authcid \0 password` message.
struct PlainMechanism {
    db: Arc<PasswordDatabase>,
    username: Option<String>,
}

impl Mechanism for PlainMechanism {
    fn name(&self) -> &'static str {
        "PLAIN"
    }

    fn start(&mut self, input: &[u8]) -> Result<SaslStep, SaslError> {
        let mut parts = input.split(|&b| b == 0);
        let _authzid = parts.next().ok_or_else(|| SaslError::BadParam {
            reason: "missing authorization id".into(),
        })?;
        let authcid = parts.next().ok_or_else(|| SaslError::BadParam {
            reason: "missing authentication id".into(),
        })?;
        let password = parts.next().ok_or_else(|| SaslError::BadParam {
            reason: "missing password".into(),
        })?;
        if parts.next().is_some() {
            return Err(SaslError::BadParam {
                reason: "trailing data after password".into(),
            });
        }
        let user = String::from_utf8(authcid.to_vec()).map_err(|_| SaslError::BadParam {
            reason: "authentication id is not valid UTF-8".into(),
        })?;
        if !self.db.verify(&user, password) {
            return Err(SaslError::AuthFailed);
        }
        self.username = Some(user);
        Ok(SaslStep::Done(None))
    }

    fn step(&mut self, _input: &[u8]) -> Result<SaslStep, SaslError> {
        // PLAIN completes in the initial message.
        Err(SaslError::BadParam {
            reason: "PLAIN does not take additional steps".into(),
        })
    }

    fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }
}

/// A per-connection SASL negotiation handle.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tidemark::auth::{PasswordDatabase, SaslSession, SaslStep};
///
/// let db = Arc::new(PasswordDatabase::new());
/// db.insert("app", "secret");
/// let mut session = SaslSession::new(db);
/// let step = session.start("PLAIN", b"\0app\0secret").unwrap();
/// assert_eq!(step, SaslStep::Done(None));
/// assert_eq!(session.username(), Some("app"));
/// ```
pub struct SaslSession {
    db: Arc<PasswordDatabase>,
    mechanism: Option<Box<dyn Mechanism>>,
    cnonce_callback: Option<CnonceCallback>,
}

impl SaslSession {
    #[must_use]
    pub fn new(db: Arc<PasswordDatabase>) -> Self {
        Self {
            db,
            mechanism: None,
            cnonce_callback: None,
        }
    }

    /// Override nonce generation for deterministic tests.
    #[must_use]
    pub fn with_cnonce_callback(mut self, callback: CnonceCallback) -> Self {
        self.cnonce_callback = Some(callback);
        self
    }

    /// Begin negotiation with the named mechanism.
    pub fn start(&mut self, mechanism: &str, client_in: &[u8]) -> Result<SaslStep, SaslError> {
        let mut backend: Box<dyn Mechanism> = match mechanism {
            "PLAIN" => Box::new(PlainMechanism {
                db: Arc::clone(&self.db),
                username: None,
            }),
            other => {
                return Err(SaslError::UnknownMechanism {
                    name: other.to_string(),
                })
            }
        };
        let step = backend.start(client_in)?;
        self.mechanism = Some(backend);
        Ok(step)
    }

    /// Continue a multi-step negotiation.
    pub fn step(&mut self, client_in: &[u8]) -> Result<SaslStep, SaslError> {
        self.mechanism
            .as_mut()
            .ok_or(SaslError::NoMechanism)?
            .step(client_in)
    }

    /// The authenticated username, once negotiation completed.
    #[must_use]
    pub fn username(&self) -> Option<&str> {
        self.mechanism.as_ref().and_then(|m| m.username())
    }

    /// Generate a nonce, honoring the test callback when installed.
    #[must_use]
    pub fn nonce(&self) -> Vec<u8> {
        if let Some(callback) = &self.cnonce_callback {
            return callback();
        }
        let mut buf = vec![0u8; 16];
        rand::rng().fill_bytes(&mut buf);
        buf
    }
}

impl fmt::Debug for SaslSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SaslSession")
            .field(
                "mechanism",
                &self.mechanism.as_ref().map(|m| m.name()).unwrap_or("-"),
            )
            .field("username", &self.username())
            .finish()
    }
}

/// Render the advertised mechanism list as
/// `prefix + sep-joined-names + suffix`.
#[must_use]
pub fn list_mechanisms(prefix: &str, sep: &str, suffix: &str) -> String {
    format!("{prefix}{}{suffix}", MECHANISMS.join(sep))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Arc<PasswordDatabase> {
        let db = PasswordDatabase::new();
        db.insert("alice", "wonderland");
        Arc::new(db)
    }

    #[test]
    fn plain_accepts_valid_credentials() {
        let mut session = SaslSession::new(db());
        let step = session.start("PLAIN", b"\0alice\0wonderland").unwrap();
        assert_eq!(step, SaslStep::Done(None));
        assert_eq!(session.username(), Some("alice"));
    }

    #[test]
    fn plain_rejects_bad_password() {
        let mut session = SaslSession::new(db());
        assert!(matches!(
            session.start("PLAIN", b"\0alice\0queen"),
            Err(SaslError::AuthFailed)
        ));
    }

    #[test]
    fn unknown_mechanism_is_bad_param() {
        let mut session = SaslSession::new(db());
        assert!(matches!(
            session.start("OAUTHBEARER", b""),
            Err(SaslError::UnknownMechanism { .. })
        ));
    }

    #[test]
    fn mechanism_list_formatting() {
        assert_eq!(list_mechanisms("[", " ", "]"), "[PLAIN]");
    }
}
