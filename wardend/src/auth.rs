//! Authentication: constant-time token checks with per-IP lockout, token
//! generation, optional HMAC-signed tokens, and the optional session store.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use crate::error::{AgentError, AgentResult};

type HmacSha256 = Hmac<Sha256>;

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
pub const TOKEN_MIN_LENGTH: usize = 32;

/// Compare two tokens without an early exit on the first differing byte.
/// Every byte pair is visited and mismatches are OR-folded into one flag,
/// so the comparison time does not leak where the difference sits.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut mismatch = 0u8;
    for i in 0..a.len() {
        mismatch |= a[i] ^ b[i];
    }
    mismatch == 0
}

/// Generate a fresh 32-byte token, hex encoded.
pub fn generate_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct AttemptInfo {
    count: u32,
    locked_until: Option<Instant>,
}

/// Request authenticator shared by both transports.
pub struct AuthGate {
    token: String,
    failed: Mutex<HashMap<IpAddr, AttemptInfo>>,
}

impl AuthGate {
    /// An empty configured token gets replaced by a generated one, which is
    /// logged so the operator can pair a client.
    pub fn new(configured_token: &str) -> Self {
        let token = if configured_token.is_empty() {
            let generated = generate_token();
            warn!(
                token = %generated,
                "no auth token configured; generated one for this run"
            );
            generated
        } else {
            configured_token.to_string()
        };
        Self {
            token,
            failed: Mutex::new(HashMap::new()),
        }
    }

    /// Whether requests from `ip` are currently locked out.
    pub fn is_locked(&self, ip: IpAddr) -> bool {
        let failed = self.failed.lock().unwrap();
        match failed.get(&ip).and_then(|info| info.locked_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Record a failed attempt; returns true when the IP just got locked.
    fn record_failure(&self, ip: IpAddr) -> bool {
        let mut failed = self.failed.lock().unwrap();
        let info = failed.entry(ip).or_insert(AttemptInfo {
            count: 0,
            locked_until: None,
        });
        info.count += 1;
        if info.count >= MAX_FAILED_ATTEMPTS {
            info.locked_until = Some(Instant::now() + LOCKOUT_DURATION);
            warn!(%ip, attempts = info.count, "client locked out");
            return true;
        }
        false
    }

    fn clear_failures(&self, ip: IpAddr) {
        self.failed.lock().unwrap().remove(&ip);
    }

    /// Interceptor check for one request. `Authenticate` itself is exempt
    /// from the token requirement but still subject to the lockout.
    pub fn check(&self, ip: IpAddr, token: Option<&str>, method: &str) -> AgentResult<()> {
        if self.is_locked(ip) {
            return Err(AgentError::ResourceExhausted(
                "too many failed authentication attempts, try again later".into(),
            ));
        }
        if method == "Authenticate" {
            return Ok(());
        }

        let Some(token) = token else {
            self.record_failure(ip);
            return Err(AgentError::Unauthenticated("missing auth token".into()));
        };
        let token = token.strip_prefix("Bearer ").unwrap_or(token);

        if !constant_time_eq(token, &self.token) {
            if self.record_failure(ip) {
                return Err(AgentError::ResourceExhausted(
                    "too many failed authentication attempts, client locked".into(),
                ));
            }
            return Err(AgentError::Unauthenticated("invalid auth token".into()));
        }

        self.clear_failures(ip);
        Ok(())
    }

    /// Credential check for the `Authenticate` method itself. Failures count
    /// toward the lockout like any other bad token.
    pub fn authenticate(&self, ip: IpAddr, token: &str) -> bool {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        if constant_time_eq(token, &self.token) {
            self.clear_failures(ip);
            info!(%ip, "client authenticated");
            true
        } else {
            self.record_failure(ip);
            false
        }
    }

    /// Bearer check for the HTTP API (no lockout: the API surface is
    /// read-only).
    pub fn verify_bearer(&self, header_value: &str) -> bool {
        let token = header_value
            .strip_prefix("Bearer ")
            .unwrap_or(header_value);
        constant_time_eq(token, &self.token)
    }
}

// ---------------------------------------------------------------------------
// Signed tokens (optional path)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct TokenClaims {
    tok: String,
    iat: i64,
    exp: i64,
}

/// Build `base64url(payload).base64url(hmac-sha256(secret, payload))` with
/// the given lifetime.
pub fn generate_signed_token(secret: &[u8], ttl: Duration) -> AgentResult<String> {
    let now = chrono::Utc::now().timestamp();
    let claims = TokenClaims {
        tok: generate_token(),
        iat: now,
        exp: now + ttl.as_secs() as i64,
    };
    let payload = serde_json::to_vec(&claims)
        .map_err(|e| AgentError::Internal(format!("encoding claims: {}", e)))?;
    let payload_b64 = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(payload);

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AgentError::Internal(format!("hmac init: {}", e)))?;
    mac.update(payload_b64.as_bytes());
    let sig = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", payload_b64, sig))
}

/// Verify signature (constant time) then expiry.
pub fn validate_signed_token(token: &str, secret: &[u8]) -> AgentResult<()> {
    let Some((payload_b64, sig_b64)) = token.split_once('.') else {
        return Err(AgentError::Unauthenticated("invalid token format".into()));
    };

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| AgentError::Internal(format!("hmac init: {}", e)))?;
    mac.update(payload_b64.as_bytes());
    let expected = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    if !constant_time_eq(sig_b64, &expected) {
        return Err(AgentError::Unauthenticated("invalid token signature".into()));
    }

    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AgentError::Unauthenticated("invalid token payload".into()))?;
    let claims: TokenClaims = serde_json::from_slice(&payload)
        .map_err(|_| AgentError::Unauthenticated("invalid token claims".into()))?;

    if chrono::Utc::now().timestamp() > claims.exp {
        return Err(AgentError::Unauthenticated("token expired".into()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Sessions (optional)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub enable_expiry: bool,
    pub expiry: Duration,
    pub allow_refresh: bool,
    pub refresh_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable_expiry: false,
            expiry: Duration::from_secs(7 * 24 * 3600),
            allow_refresh: true,
            refresh_window: Duration::from_secs(24 * 3600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub client_addr: String,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
    pub last_used: Instant,
}

/// Server-side record of currently valid token bindings. Only consulted
/// when session expiry is enabled.
pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, token: &str, client_addr: &str) -> Session {
        let now = Instant::now();
        let session = Session {
            token: token.to_string(),
            client_addr: client_addr.to_string(),
            created_at: now,
            expires_at: self.config.enable_expiry.then(|| now + self.config.expiry),
            last_used: now,
        };
        self.sessions
            .lock()
            .unwrap()
            .insert(token.to_string(), session.clone());
        session
    }

    /// Validate a presented token against its session and refresh
    /// `last_used`. Unknown tokens fall back to the static check (Ok(None)).
    pub fn validate(&self, token: &str) -> AgentResult<Option<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(token) else {
            return Ok(None);
        };
        if let Some(expires_at) = session.expires_at {
            if Instant::now() > expires_at {
                sessions.remove(token);
                return Err(AgentError::Unauthenticated(
                    "session expired, re-authenticate".into(),
                ));
            }
        }
        session.last_used = Instant::now();
        Ok(Some(session.clone()))
    }

    pub fn refresh(&self, token: &str) -> AgentResult<Session> {
        if !self.config.allow_refresh {
            return Err(AgentError::PermissionDenied("token refresh disabled".into()));
        }
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(token) else {
            return Err(AgentError::NotFound("session not found".into()));
        };
        if self.config.enable_expiry {
            let expires_at = session.expires_at.expect("expiry enabled");
            let refresh_start = expires_at - self.config.refresh_window;
            if Instant::now() < refresh_start {
                return Err(AgentError::FailedPrecondition(
                    "not yet inside the refresh window".into(),
                ));
            }
            session.expires_at = Some(Instant::now() + self.config.expiry);
        }
        session.last_used = Instant::now();
        Ok(session.clone())
    }

    pub fn revoke(&self, token: &str) {
        self.sessions.lock().unwrap().remove(token);
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Drop expired sessions. Called from a 5-minute loop when expiry is on.
    pub fn cleanup(&self) {
        if !self.config.enable_expiry {
            return;
        }
        let now = Instant::now();
        self.sessions
            .lock()
            .unwrap()
            .retain(|_, s| s.expires_at.map(|e| now <= e).unwrap_or(true));
    }

    /// Spawn the periodic cleanup when expiry is enabled.
    pub fn spawn_cleanup_loop(self: &std::sync::Arc<Self>) {
        if !self.config.enable_expiry {
            return;
        }
        let manager = std::sync::Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5 * 60));
            interval.tick().await;
            loop {
                interval.tick().await;
                manager.cleanup();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        format!("203.0.113.{}", last).parse().unwrap()
    }

    #[test]
    fn constant_time_eq_basics() {
        assert!(constant_time_eq("secret-token-123", "secret-token-123"));
        assert!(!constant_time_eq("secret-token-123", "secret-token-124"));
        assert!(!constant_time_eq("short", "much-longer-string"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn generated_tokens_are_32_byte_hex() {
        let token = generate_token();
        assert_eq!(token.len(), 64);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(token, generate_token());
        assert!(token.len() >= TOKEN_MIN_LENGTH);
    }

    #[test]
    fn valid_token_passes_check() {
        let gate = AuthGate::new("the-right-token-0123456789abcdef");
        assert!(gate
            .check(ip(1), Some("the-right-token-0123456789abcdef"), "GetSystemInfo")
            .is_ok());
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let gate = AuthGate::new("tok-abcdef0123456789abcdef01234567");
        assert!(gate
            .check(
                ip(1),
                Some("Bearer tok-abcdef0123456789abcdef01234567"),
                "GetSystemInfo"
            )
            .is_ok());
    }

    #[test]
    fn five_failures_lock_the_ip_for_all_methods() {
        let gate = AuthGate::new("correct-token-0123456789abcdef01");
        let attacker = ip(5);
        for _ in 0..MAX_FAILED_ATTEMPTS {
            assert!(!gate.authenticate(attacker, "wrong"));
        }
        assert!(gate.is_locked(attacker));

        // All further calls come back resource-exhausted, even Authenticate.
        let err = gate
            .check(attacker, Some("correct-token-0123456789abcdef01"), "GetSystemInfo")
            .unwrap_err();
        assert_eq!(err.code(), wardend_protocol::ErrorCode::ResourceExhausted);
        let err = gate.check(attacker, None, "Authenticate").unwrap_err();
        assert_eq!(err.code(), wardend_protocol::ErrorCode::ResourceExhausted);
    }

    #[test]
    fn other_ips_are_unaffected_by_lockout() {
        let gate = AuthGate::new("correct-token-0123456789abcdef01");
        for _ in 0..MAX_FAILED_ATTEMPTS {
            gate.authenticate(ip(6), "wrong");
        }
        assert!(gate.is_locked(ip(6)));
        assert!(!gate.is_locked(ip(7)));
        assert!(gate
            .check(ip(7), Some("correct-token-0123456789abcdef01"), "GetSystemInfo")
            .is_ok());
    }

    #[test]
    fn success_clears_the_failure_counter() {
        let gate = AuthGate::new("correct-token-0123456789abcdef01");
        let client = ip(8);
        for _ in 0..MAX_FAILED_ATTEMPTS - 1 {
            gate.authenticate(client, "wrong");
        }
        assert!(gate.authenticate(client, "correct-token-0123456789abcdef01"));
        // Counter reset: four more failures do not lock.
        for _ in 0..MAX_FAILED_ATTEMPTS - 1 {
            gate.authenticate(client, "wrong");
        }
        assert!(!gate.is_locked(client));
    }

    #[test]
    fn missing_token_is_unauthenticated() {
        let gate = AuthGate::new("correct-token-0123456789abcdef01");
        let err = gate.check(ip(9), None, "GetSystemInfo").unwrap_err();
        assert_eq!(err.code(), wardend_protocol::ErrorCode::Unauthenticated);
    }

    #[test]
    fn authenticate_method_bypasses_token_requirement() {
        let gate = AuthGate::new("correct-token-0123456789abcdef01");
        assert!(gate.check(ip(10), None, "Authenticate").is_ok());
    }

    #[test]
    fn signed_token_roundtrip() {
        let secret = b"wardend-hmac-secret";
        let token = generate_signed_token(secret, Duration::from_secs(3600)).unwrap();
        assert!(validate_signed_token(&token, secret).is_ok());
    }

    #[test]
    fn signed_token_rejects_tampering() {
        let secret = b"wardend-hmac-secret";
        let token = generate_signed_token(secret, Duration::from_secs(3600)).unwrap();
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(validate_signed_token(&tampered, secret).is_err());
        assert!(validate_signed_token(&token, b"other-secret").is_err());
        assert!(validate_signed_token("not-a-signed-token", secret).is_err());
    }

    #[test]
    fn signed_token_expires() {
        let secret = b"wardend-hmac-secret";
        let token = generate_signed_token(secret, Duration::from_secs(0)).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(validate_signed_token(&token, secret).is_err());
    }

    #[test]
    fn sessions_without_expiry_validate_forever() {
        let mgr = SessionManager::new(SessionConfig::default());
        mgr.create("tok", "203.0.113.9:1000");
        let got = mgr.validate("tok").unwrap();
        assert!(got.is_some());
        assert!(got.unwrap().expires_at.is_none());
    }

    #[test]
    fn unknown_session_falls_back_to_static_check() {
        let mgr = SessionManager::new(SessionConfig::default());
        assert!(mgr.validate("unknown").unwrap().is_none());
    }

    #[test]
    fn expired_session_is_rejected_and_removed() {
        let config = SessionConfig {
            enable_expiry: true,
            expiry: Duration::from_millis(10),
            ..Default::default()
        };
        let mgr = SessionManager::new(config);
        mgr.create("tok", "addr");
        std::thread::sleep(Duration::from_millis(30));
        assert!(mgr.validate("tok").is_err());
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn cleanup_drops_expired_sessions() {
        let config = SessionConfig {
            enable_expiry: true,
            expiry: Duration::from_millis(10),
            ..Default::default()
        };
        let mgr = SessionManager::new(config);
        mgr.create("a", "x");
        mgr.create("b", "y");
        std::thread::sleep(Duration::from_millis(30));
        mgr.cleanup();
        assert_eq!(mgr.active_count(), 0);
    }

    #[test]
    fn revoke_removes_session() {
        let mgr = SessionManager::new(SessionConfig::default());
        mgr.create("tok", "addr");
        mgr.revoke("tok");
        assert_eq!(mgr.active_count(), 0);
    }
}
