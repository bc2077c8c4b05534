//! HMAC-signed bearer tokens: mint, validate, revoke, exchange, refresh.
//!
//! A token is `<prefix><base64url(payload_json || hmac_sha256(secret,
//! payload_json))>`. The 32-byte secret and the 16-byte server id live in
//! `~/.cdev/token_secret.json` (mode 0600). Regenerating the secret
//! invalidates every outstanding token at once - that is how
//! `revoke_all` works.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write as IoWrite;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD as BASE64_URL};
use base64::Engine;
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const SECRET_LEN: usize = 32;
const SERVER_ID_LEN: usize = 16;
const NONCE_LEN: usize = 16;
const SIG_LEN: usize = 32; // HMAC-SHA256

/// Validation failures, each surfaced as a distinct 401 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    #[error("invalid_format")]
    InvalidFormat,
    #[error("invalid_token")]
    InvalidToken,
    #[error("expired")]
    Expired,
    #[error("revoked")]
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Pairing,
    Session,
    Access,
    Refresh,
}

impl TokenType {
    fn prefix(&self) -> &'static str {
        match self {
            Self::Pairing => "cdev_p_",
            Self::Session | Self::Access => "cdev_s_",
            Self::Refresh => "cdev_r_",
        }
    }

    fn matches_prefix(&self, prefix: &str) -> bool {
        self.prefix() == prefix
    }
}

/// Signed token payload. Reserved fields (`agent_id`, `device_id`,
/// `user_id`, `mode`) exist for a future cloud mode and are serialized
/// only when set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenPayload {
    pub v: u8,
    pub typ: TokenType,
    /// Server id, base64; rejects tokens minted by other installations.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    /// Base64 of 16 random bytes; the unit of revocation.
    pub nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

/// A freshly minted token plus its payload.
#[derive(Debug, Clone)]
pub struct Minted {
    pub token: String,
    pub payload: TokenPayload,
}

/// Access + refresh pair returned by exchange and refresh.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access: Minted,
    pub refresh: Minted,
}

#[derive(Serialize, Deserialize)]
struct SecretFile {
    server_id: String,
    secret_b64: String,
}

struct Keys {
    key: hmac::Key,
    server_id: String,
    secret: [u8; SECRET_LEN],
}

pub struct TokenManager {
    path: PathBuf,
    rng: SystemRandom,
    /// Read for every sign/verify; written only by `revoke_all`.
    keys: RwLock<Keys>,
    /// nonce -> original expiry; swept periodically.
    revoked: Mutex<HashMap<String, i64>>,
    pairing_ttl: Duration,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenManager {
    /// Load the secret file, creating it on first run.
    pub fn load_or_create(
        path: PathBuf,
        pairing_ttl: Duration,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> anyhow::Result<Self> {
        let rng = SystemRandom::new();
        let keys = match std::fs::read(&path) {
            Ok(bytes) => {
                let file: SecretFile = serde_json::from_slice(&bytes)?;
                let decoded = BASE64.decode(&file.secret_b64)?;
                anyhow::ensure!(decoded.len() == SECRET_LEN, "token secret has wrong length");
                let mut secret = [0u8; SECRET_LEN];
                secret.copy_from_slice(&decoded);
                Keys {
                    key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
                    server_id: file.server_id,
                    secret,
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keys = generate_keys(&rng)?;
                write_secret_file(&path, &keys, true)?;
                info!(
                    component = "tokens",
                    event = "tokens.secret_generated",
                    path = %path.display(),
                    "Generated token secret"
                );
                keys
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            rng,
            keys: RwLock::new(keys),
            revoked: Mutex::new(HashMap::new()),
            pairing_ttl,
            access_ttl,
            refresh_ttl,
        })
    }

    pub fn default_ttl(&self, typ: TokenType) -> Duration {
        match typ {
            TokenType::Pairing => self.pairing_ttl,
            TokenType::Session | TokenType::Access => self.access_ttl,
            TokenType::Refresh => self.refresh_ttl,
        }
    }

    /// Mint a token of `typ` valid for `ttl`.
    pub fn mint(&self, typ: TokenType, ttl: Duration) -> Minted {
        self.mint_at(typ, now_unix(), ttl, None)
    }

    /// Mint with a device binding (refresh/access pairs).
    pub fn mint_for_device(&self, typ: TokenType, ttl: Duration, device_id: &str) -> Minted {
        self.mint_at(typ, now_unix(), ttl, Some(device_id.to_string()))
    }

    fn mint_at(&self, typ: TokenType, iat: i64, ttl: Duration, device_id: Option<String>) -> Minted {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .expect("system rng failure is unrecoverable");
        let keys = self.keys.read().expect("token keys poisoned");
        let payload = TokenPayload {
            v: 1,
            typ,
            sid: keys.server_id.clone(),
            iat,
            exp: iat + ttl.as_secs() as i64,
            nonce: BASE64.encode(nonce),
            agent_id: None,
            device_id,
            user_id: None,
            mode: None,
        };
        let token = encode_token(&keys.key, &payload);
        Minted { token, payload }
    }

    /// Validate a token of any type.
    pub fn validate(&self, token: &str) -> Result<TokenPayload, TokenError> {
        self.validate_at(token, now_unix())
    }

    fn validate_at(&self, token: &str, now: i64) -> Result<TokenPayload, TokenError> {
        let (prefix, encoded) = split_prefix(token).ok_or(TokenError::InvalidFormat)?;
        let blob = BASE64_URL
            .decode(encoded)
            .map_err(|_| TokenError::InvalidFormat)?;
        if blob.len() <= SIG_LEN {
            return Err(TokenError::InvalidFormat);
        }
        let (payload_bytes, sig) = blob.split_at(blob.len() - SIG_LEN);

        let keys = self.keys.read().expect("token keys poisoned");
        hmac::verify(&keys.key, payload_bytes, sig).map_err(|_| TokenError::InvalidToken)?;

        let payload: TokenPayload =
            serde_json::from_slice(payload_bytes).map_err(|_| TokenError::InvalidFormat)?;
        if payload.sid != keys.server_id {
            return Err(TokenError::InvalidToken);
        }
        if !payload.typ.matches_prefix(prefix) {
            return Err(TokenError::InvalidToken);
        }
        drop(keys);

        if now > payload.exp {
            return Err(TokenError::Expired);
        }
        if self
            .revoked
            .lock()
            .expect("revocation set poisoned")
            .contains_key(&payload.nonce)
        {
            return Err(TokenError::Revoked);
        }
        Ok(payload)
    }

    /// Expect a specific token type.
    pub fn validate_typed(&self, token: &str, typ: TokenType) -> Result<TokenPayload, TokenError> {
        let payload = self.validate(token)?;
        let type_ok = payload.typ == typ
            || (typ == TokenType::Access && payload.typ == TokenType::Session)
            || (typ == TokenType::Session && payload.typ == TokenType::Access);
        if !type_ok {
            return Err(TokenError::InvalidToken);
        }
        Ok(payload)
    }

    /// Revoke a single token by adding its nonce to the revocation set.
    pub fn revoke(&self, token: &str) -> Result<(), TokenError> {
        let payload = self.validate(token)?;
        self.revoke_nonce(&payload.nonce, payload.exp);
        Ok(())
    }

    fn revoke_nonce(&self, nonce: &str, exp: i64) {
        self.revoked
            .lock()
            .expect("revocation set poisoned")
            .insert(nonce.to_string(), exp);
    }

    /// Regenerate the secret, invalidating every outstanding token
    /// atomically, and clear the (now pointless) revocation set.
    pub fn revoke_all(&self) -> anyhow::Result<()> {
        let new_keys = generate_keys(&self.rng)?;
        write_secret_file(&self.path, &new_keys, false)?;
        {
            let mut keys = self.keys.write().expect("token keys poisoned");
            *keys = new_keys;
        }
        self.revoked
            .lock()
            .expect("revocation set poisoned")
            .clear();
        info!(
            component = "tokens",
            event = "tokens.revoked_all",
            "Server secret regenerated, all tokens invalidated"
        );
        Ok(())
    }

    /// One-shot: consume a pairing token, return an access+refresh pair.
    pub fn exchange_pairing(
        &self,
        pairing_token: &str,
        device_id: &str,
    ) -> Result<TokenPair, TokenError> {
        let payload = self.validate_typed(pairing_token, TokenType::Pairing)?;
        // Consume before returning new tokens: replay of the pairing
        // token must fail even if the caller aborts mid-exchange.
        self.revoke_nonce(&payload.nonce, payload.exp);
        Ok(self.mint_pair(device_id))
    }

    /// One-shot refresh: consume the presented refresh token and rotate.
    /// Re-use of an already consumed refresh token is an attack signal
    /// and surfaces as `invalid_token`.
    pub fn refresh(&self, refresh_token: &str) -> Result<(TokenPair, TokenPayload), TokenError> {
        let payload = match self.validate_typed(refresh_token, TokenType::Refresh) {
            Ok(p) => p,
            Err(TokenError::Revoked) => return Err(TokenError::InvalidToken),
            Err(e) => return Err(e),
        };
        self.revoke_nonce(&payload.nonce, payload.exp);
        let device_id = payload.device_id.clone().unwrap_or_default();
        Ok((self.mint_pair(&device_id), payload))
    }

    fn mint_pair(&self, device_id: &str) -> TokenPair {
        TokenPair {
            access: self.mint_for_device(TokenType::Access, self.access_ttl, device_id),
            refresh: self.mint_for_device(TokenType::Refresh, self.refresh_ttl, device_id),
        }
    }

    /// Drop revocation entries whose original expiry has passed; their
    /// tokens fail `expired` before the set is ever consulted.
    pub fn sweep_revoked(&self) {
        let now = now_unix();
        let mut revoked = self.revoked.lock().expect("revocation set poisoned");
        let before = revoked.len();
        revoked.retain(|_, exp| *exp >= now);
        let swept = before - revoked.len();
        if swept > 0 {
            info!(
                component = "tokens",
                event = "tokens.revocation_swept",
                swept = swept,
                remaining = revoked.len(),
                "Swept expired revocation entries"
            );
        }
    }
}

fn generate_keys(rng: &SystemRandom) -> anyhow::Result<Keys> {
    let mut secret = [0u8; SECRET_LEN];
    rng.fill(&mut secret)
        .map_err(|_| anyhow::anyhow!("failed to generate token secret"))?;
    let mut server_id = [0u8; SERVER_ID_LEN];
    rng.fill(&mut server_id)
        .map_err(|_| anyhow::anyhow!("failed to generate server id"))?;
    Ok(Keys {
        key: hmac::Key::new(hmac::HMAC_SHA256, &secret),
        server_id: BASE64.encode(server_id),
        secret,
    })
}

/// Persist the secret with owner-only permissions.
///
/// First write uses `create_new` so a concurrent starter loses cleanly;
/// regeneration goes through `tmp + rename` so readers never observe a
/// half-written file.
fn write_secret_file(path: &std::path::Path, keys: &Keys, create_new: bool) -> anyhow::Result<()> {
    let contents = serde_json::to_vec_pretty(&SecretFile {
        server_id: keys.server_id.clone(),
        secret_b64: BASE64.encode(keys.secret),
    })?;

    if create_new {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(path)
        {
            Ok(mut file) => {
                file.write_all(&contents)?;
                return Ok(());
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // Another process won the race; caller will re-read.
                warn!(
                    component = "tokens",
                    event = "tokens.secret_race",
                    path = %path.display(),
                    "Token secret created concurrently"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }

    let tmp = path.with_extension("json.tmp");
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp)?;
        file.write_all(&contents)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn encode_token(key: &hmac::Key, payload: &TokenPayload) -> String {
    let payload_json = serde_json::to_vec(payload).expect("payload serialization cannot fail");
    let sig = hmac::sign(key, &payload_json);
    let mut blob = payload_json;
    blob.extend_from_slice(sig.as_ref());
    format!("{}{}", payload.typ.prefix(), BASE64_URL.encode(blob))
}

fn split_prefix(token: &str) -> Option<(&str, &str)> {
    for prefix in ["cdev_p_", "cdev_s_", "cdev_r_"] {
        if let Some(rest) = token.strip_prefix(prefix) {
            return Some((prefix, rest));
        }
    }
    None
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(dir: &tempfile::TempDir) -> TokenManager {
        TokenManager::load_or_create(
            dir.path().join("token_secret.json"),
            Duration::from_secs(300),
            Duration::from_secs(3600),
            Duration::from_secs(30 * 24 * 3600),
        )
        .unwrap()
    }

    #[test]
    fn mint_validate_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let minted = mgr.mint(TokenType::Access, Duration::from_secs(60));
        assert!(minted.token.starts_with("cdev_s_"));

        let payload = mgr.validate(&minted.token).expect("valid token");
        assert_eq!(payload.typ, TokenType::Access);
        assert_eq!(payload.exp, minted.payload.exp);
        assert_eq!(payload.sid, minted.payload.sid);
    }

    #[test]
    fn secret_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let minted = {
            let mgr = manager(&dir);
            mgr.mint(TokenType::Refresh, Duration::from_secs(60))
        };
        let mgr = manager(&dir);
        assert!(mgr.validate(&minted.token).is_ok());
    }

    #[test]
    fn tamper_rejection_on_every_byte() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let minted = mgr.mint(TokenType::Pairing, Duration::from_secs(60));

        let bytes = minted.token.as_bytes();
        for i in 0..bytes.len() {
            let mut tampered = bytes.to_vec();
            tampered[i] = if tampered[i] == b'A' { b'B' } else { b'A' };
            if tampered == bytes {
                continue;
            }
            let Ok(tampered) = String::from_utf8(tampered) else {
                continue;
            };
            match mgr.validate(&tampered) {
                Err(TokenError::InvalidFormat) | Err(TokenError::InvalidToken) => {}
                other => panic!("byte {i}: tampered token accepted or misclassified: {other:?}"),
            }
        }
    }

    #[test]
    fn expired_and_revoked_are_distinct() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let minted = mgr.mint_at(TokenType::Access, now_unix() - 120, Duration::from_secs(60), None);
        assert_eq!(mgr.validate(&minted.token), Err(TokenError::Expired));

        let minted = mgr.mint(TokenType::Access, Duration::from_secs(60));
        mgr.revoke(&minted.token).unwrap();
        assert_eq!(mgr.validate(&minted.token), Err(TokenError::Revoked));
    }

    #[test]
    fn unknown_prefix_is_invalid_format() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        assert_eq!(mgr.validate("nope_abcdef"), Err(TokenError::InvalidFormat));
        assert_eq!(mgr.validate(""), Err(TokenError::InvalidFormat));
    }

    #[test]
    fn foreign_server_id_is_invalid_token() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mgr_a = manager(&dir_a);
        let mgr_b = manager(&dir_b);

        let minted = mgr_a.mint(TokenType::Access, Duration::from_secs(60));
        // Different secret: signature check fails first, same surface.
        assert_eq!(mgr_b.validate(&minted.token), Err(TokenError::InvalidToken));
    }

    #[test]
    fn refresh_is_one_shot() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let pair = mgr.exchange_pairing(
            &mgr.mint(TokenType::Pairing, Duration::from_secs(60)).token,
            "device-1",
        )
        .unwrap();

        let (rotated, consumed) = mgr.refresh(&pair.refresh.token).unwrap();
        assert_eq!(consumed.device_id.as_deref(), Some("device-1"));
        assert!(mgr.validate(&rotated.access.token).is_ok());

        // Second use of the same refresh token is an attack signal.
        assert_eq!(
            mgr.refresh(&pair.refresh.token).err(),
            Some(TokenError::InvalidToken)
        );
    }

    #[test]
    fn exchange_consumes_pairing_token() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let pairing = mgr.mint(TokenType::Pairing, Duration::from_secs(60));

        mgr.exchange_pairing(&pairing.token, "device-1").unwrap();
        assert_eq!(mgr.validate(&pairing.token), Err(TokenError::Revoked));
    }

    #[test]
    fn revoke_all_invalidates_everything_and_new_tokens_work() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let access = mgr.mint(TokenType::Access, Duration::from_secs(3600));
        let refresh = mgr.mint(TokenType::Refresh, Duration::from_secs(3600));

        mgr.revoke_all().unwrap();

        assert_eq!(mgr.validate(&access.token), Err(TokenError::InvalidToken));
        assert_eq!(mgr.validate(&refresh.token), Err(TokenError::InvalidToken));

        let fresh = mgr.mint(TokenType::Access, Duration::from_secs(60));
        assert!(mgr.validate(&fresh.token).is_ok());
    }

    #[test]
    fn sweep_drops_only_expired_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);

        let live = mgr.mint(TokenType::Access, Duration::from_secs(3600));
        mgr.revoke(&live.token).unwrap();
        mgr.revoke_nonce("stale-nonce", now_unix() - 10);

        mgr.sweep_revoked();

        let revoked = mgr.revoked.lock().unwrap();
        assert!(revoked.contains_key(&live.payload.nonce));
        assert!(!revoked.contains_key("stale-nonce"));
    }

    #[test]
    fn prefix_type_mismatch_is_invalid_token() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(&dir);
        let refresh = mgr.mint(TokenType::Refresh, Duration::from_secs(60));
        assert_eq!(
            mgr.validate_typed(&refresh.token, TokenType::Access),
            Err(TokenError::InvalidToken)
        );
    }

    #[test]
    fn secret_file_is_owner_only() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let _mgr = manager(&dir);
        let mode = std::fs::metadata(dir.path().join("token_secret.json"))
            .unwrap()
            .mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
