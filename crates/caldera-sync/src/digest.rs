//! # Digest Authentication
//!
//! Reactive responder for HTTP Digest challenges (RFC 2617 / RFC 7616).
//!
//! ## Challenge Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    One request, at most one re-send per nonce           │
//! │                                                                         │
//! │  send (Basic, or Digest if a challenge is cached)                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  401 + WWW-Authenticate: Digest realm, nonce, qop, opaque, algorithm   │
//! │       │                                                                 │
//! │       ├── digest rejected (second stale too) ──► AuthFailure (no loop) │
//! │       ▼                                                                 │
//! │  remember challenge (new nonce → nc reset to 1)                        │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  re-send with Authorization: Digest ... nc=00000001 ...                │
//! │       │                                                                 │
//! │       ├── 401 stale=true ──► remember fresh nonce, re-send once more   │
//! │       ▼                                                                 │
//! │  response                                                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Response Computation
//! ```text
//! HA1 = H(username:realm:password)                  (-sess: H(HA1:nonce:cnonce))
//! HA2 = H(method:uri)                               uri = path[?query]
//! qop=auth   response = H(HA1:nonce:nc:cnonce:auth:HA2)
//! legacy     response = H(HA1:nonce:HA2)            (no qop/nc/cnonce sent)
//! ```

use std::collections::HashMap;
use std::sync::Mutex;

use md5::Md5;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

// =============================================================================
// Algorithm
// =============================================================================

/// Hash function named by the challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestAlgorithm {
    #[default]
    Md5,
    Md5Sess,
    Sha256,
    Sha256Sess,
}

impl DigestAlgorithm {
    /// Parses the `algorithm` parameter; `None` for unsupported values.
    pub fn parse(token: &str) -> Option<Self> {
        match token.trim().to_ascii_uppercase().as_str() {
            "MD5" => Some(DigestAlgorithm::Md5),
            "MD5-SESS" => Some(DigestAlgorithm::Md5Sess),
            "SHA-256" => Some(DigestAlgorithm::Sha256),
            "SHA-256-SESS" => Some(DigestAlgorithm::Sha256Sess),
            _ => None,
        }
    }

    fn is_session(&self) -> bool {
        matches!(self, DigestAlgorithm::Md5Sess | DigestAlgorithm::Sha256Sess)
    }

    /// Lowercase hex digest of `data`.
    pub fn hash(&self, data: &str) -> String {
        match self {
            DigestAlgorithm::Md5 | DigestAlgorithm::Md5Sess => {
                let mut hasher = Md5::new();
                hasher.update(data.as_bytes());
                hex::encode(hasher.finalize())
            }
            DigestAlgorithm::Sha256 | DigestAlgorithm::Sha256Sess => {
                let mut hasher = Sha256::new();
                hasher.update(data.as_bytes());
                hex::encode(hasher.finalize())
            }
        }
    }
}

// =============================================================================
// Challenge
// =============================================================================

/// Parsed `WWW-Authenticate: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    /// Offered qop values, lowercased (`auth`, `auth-int`).
    pub qop: Vec<String>,
    pub algorithm: DigestAlgorithm,
    /// `algorithm` exactly as the server sent it, echoed back unchanged.
    pub algorithm_token: Option<String>,
    pub stale: bool,
}

impl DigestChallenge {
    /// Parses one header value.
    ///
    /// ## Returns
    /// `None` if the value is not a Digest challenge, lacks a nonce, or names
    /// an unsupported algorithm.
    pub fn parse(header: &str) -> Option<Self> {
        let lower = header.to_ascii_lowercase();
        let params_at = if lower.trim_start().starts_with("digest ") {
            lower.find("digest ").map(|i| i + "digest ".len())?
        } else {
            lower.find(", digest ").map(|i| i + ", digest ".len())?
        };

        let mut realm = None;
        let mut nonce = None;
        let mut opaque = None;
        let mut qop = Vec::new();
        let mut algorithm_token = None;
        let mut stale = false;

        for (key, value) in parse_params(&header[params_at..]) {
            match key.as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "opaque" => opaque = Some(value),
                "qop" => {
                    qop = value
                        .split(',')
                        .map(|q| q.trim().to_ascii_lowercase())
                        .filter(|q| !q.is_empty())
                        .collect()
                }
                "algorithm" => algorithm_token = Some(value),
                "stale" => stale = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let algorithm = match algorithm_token.as_deref() {
            Some(token) => DigestAlgorithm::parse(token)?,
            None => DigestAlgorithm::Md5,
        };

        Some(DigestChallenge {
            realm: realm.unwrap_or_default(),
            nonce: nonce.filter(|n| !n.is_empty())?,
            opaque,
            qop,
            algorithm,
            algorithm_token,
            stale,
        })
    }

    /// First Digest challenge among several header values.
    pub fn from_headers<'a>(values: impl IntoIterator<Item = &'a str>) -> Option<Self> {
        values.into_iter().find_map(Self::parse)
    }

    /// `auth` if offered, otherwise legacy mode (no qop at all).
    pub fn selected_qop(&self) -> Option<&'static str> {
        if self.qop.iter().any(|q| q == "auth") {
            Some("auth")
        } else {
            None
        }
    }
}

/// Splits `key=value, key="quoted, value"` lists.
///
/// Stops at the next scheme token, so a trailing `Basic realm=...` in the
/// same header does not leak into the Digest parameters.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }

        let mut key = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c == ',' || c.is_whitespace() {
                break;
            }
            key.push(c);
            chars.next();
        }
        if key.is_empty() {
            break;
        }

        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }
        if chars.peek() != Some(&'=') {
            break;
        }
        chars.next();
        while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
            chars.next();
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            while let Some(c) = chars.next() {
                match c {
                    '\\' => {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    }
                    '"' => break,
                    _ => value.push(c),
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
            value = value.trim().to_string();
        }

        out.push((key.to_ascii_lowercase(), value));
    }

    out
}

// =============================================================================
// Computation
// =============================================================================

/// Inputs of one Authorization header.
#[derive(Debug, Clone)]
pub struct DigestParams<'a> {
    pub username: &'a str,
    pub password: &'a str,
    pub method: &'a str,
    /// Request-URI: path and query only.
    pub uri: &'a str,
    pub nc: u32,
    pub cnonce: &'a str,
}

/// `HA1` for the challenge (session variants folded in).
pub fn ha1(challenge: &DigestChallenge, username: &str, password: &str, cnonce: &str) -> String {
    let alg = challenge.algorithm;
    let base = alg.hash(&format!("{}:{}:{}", username, challenge.realm, password));
    if alg.is_session() {
        alg.hash(&format!("{}:{}:{}", base, challenge.nonce, cnonce))
    } else {
        base
    }
}

/// `HA2` for `auth` (and legacy) qop.
pub fn ha2(algorithm: DigestAlgorithm, method: &str, uri: &str) -> String {
    algorithm.hash(&format!("{}:{}", method, uri))
}

/// The `response` parameter.
pub fn response(challenge: &DigestChallenge, params: &DigestParams<'_>) -> String {
    let alg = challenge.algorithm;
    let ha1 = ha1(challenge, params.username, params.password, params.cnonce);
    let ha2 = ha2(alg, params.method, params.uri);
    match challenge.selected_qop() {
        Some(qop) => alg.hash(&format!(
            "{}:{}:{:08x}:{}:{}:{}",
            ha1, challenge.nonce, params.nc, params.cnonce, qop, ha2
        )),
        None => alg.hash(&format!("{}:{}:{}", ha1, challenge.nonce, ha2)),
    }
}

/// Full `Authorization` header value.
pub fn authorization(challenge: &DigestChallenge, params: &DigestParams<'_>) -> String {
    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\"",
        quote(params.username),
        quote(&challenge.realm),
        quote(&challenge.nonce),
        quote(params.uri)
    );
    if let Some(ref token) = challenge.algorithm_token {
        header.push_str(&format!(", algorithm={}", token));
    }
    header.push_str(&format!(", response=\"{}\"", response(challenge, params)));
    if let Some(ref opaque) = challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", quote(opaque)));
    }
    if let Some(qop) = challenge.selected_qop() {
        header.push_str(&format!(
            ", qop={}, nc={:08x}, cnonce=\"{}\"",
            qop,
            params.nc,
            quote(params.cnonce)
        ));
    }
    header
}

fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Request-URI sent in the `uri` parameter.
pub fn request_uri(url: &Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}

/// Random client nonce.
pub fn generate_cnonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.gen();
    hex::encode(bytes)
}

// =============================================================================
// Session State
// =============================================================================

/// Per-client Digest state.
///
/// Holds the latest challenge and the nonce-count for each `(realm, nonce)`.
/// All requests of one client share it, so the counter never repeats.
#[derive(Debug, Default)]
pub struct DigestSession {
    inner: Mutex<SessionState>,
}

#[derive(Debug, Default)]
struct SessionState {
    challenge: Option<DigestChallenge>,
    counts: HashMap<(String, String), u32>,
}

impl DigestSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a challenge from a 401.
    ///
    /// A different nonce starts at count 1; a stale challenge always does.
    pub fn remember(&self, challenge: DigestChallenge) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (challenge.realm.clone(), challenge.nonce.clone());
        state.counts.retain(|k, _| *k == key);
        if challenge.stale {
            state.counts.insert(key, 0);
        } else {
            state.counts.entry(key).or_insert(0);
        }
        debug!(realm = %challenge.realm, stale = challenge.stale, "Stored digest challenge");
        state.challenge = Some(challenge);
    }

    /// Current challenge, if any.
    pub fn challenge(&self) -> Option<DigestChallenge> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.challenge.clone()
    }

    /// Builds an Authorization header, consuming the next nonce-count.
    ///
    /// ## Returns
    /// The header and the nonce it was computed for, or `None` before any
    /// challenge was seen.
    pub fn authorize(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> Option<(String, String)> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let challenge = state.challenge.clone()?;
        let key = (challenge.realm.clone(), challenge.nonce.clone());
        let nc = {
            let count = state.counts.entry(key).or_insert(0);
            *count += 1;
            *count
        };
        drop(state);

        let cnonce = generate_cnonce();
        let params = DigestParams {
            username,
            password,
            method,
            uri,
            nc,
            cnonce: &cnonce,
        };
        Some((authorization(&challenge, &params), challenge.nonce))
    }

    /// Next count that would be used for the current nonce.
    pub fn next_count(&self) -> Option<u32> {
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let challenge = state.challenge.as_ref()?;
        let key = (challenge.realm.clone(), challenge.nonce.clone());
        Some(state.counts.get(&key).copied().unwrap_or(0) + 1)
    }

    /// Forgets the challenge (credentials changed).
    pub fn clear(&self) {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        state.challenge = None;
        state.counts.clear();
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
