use crate::config::Environment;
use crate::domain::errors::BrokerError;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Broker-imposed floor between two token issues, end to end.
const REFRESH_INTERVAL: ChronoDuration = ChronoDuration::seconds(60);
/// Refresh this long before the broker-side expiry.
const EXPIRY_MARGIN: ChronoDuration = ChronoDuration::seconds(60);
/// A lock file older than this belongs to a dead process.
const LOCK_STALE_AFTER: Duration = Duration::from_secs(120);

/// Persisted OAuth token state. Single row; only the token manager writes it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokenState {
    pub access_token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TokenState {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at - now > EXPIRY_MARGIN
    }
}

/// Issues a brand-new token from the broker. Implemented by the brokerage
/// client; mocked in tests.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<TokenState, BrokerError>;
}

/// On-disk store for token state with owner-only permissions and
/// write-temp + rename persistence.
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(data_root: &Path, environment: Environment) -> Self {
        let path = data_root
            .join("token")
            .join(format!("token_info_{environment}.json"));
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<TokenState> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!("Token file {} unparsable, ignoring: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn save(&self, state: &TokenState) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(state)?;

        {
            let mut options = std::fs::OpenOptions::new();
            options.write(true).create(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                options.mode(0o600);
            }
            let mut file = options.open(&tmp)?;
            use std::io::Write;
            file.write_all(&body)?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp, &self.path)
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Take the cross-process refresh lock. Spins on the lock file with a
    /// short sleep; breaks locks left behind by dead processes.
    async fn acquire_lock(&self) -> std::io::Result<FileLockGuard> {
        let lock_path = self.lock_path();
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Ok(FileLockGuard {
                        path: lock_path,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stale = std::fs::metadata(&lock_path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|mtime| mtime.elapsed().ok())
                        .map(|age| age > LOCK_STALE_AFTER)
                        .unwrap_or(false);
                    if stale {
                        warn!(
                            "Breaking stale token lock at {} (older than {:?})",
                            lock_path.display(),
                            LOCK_STALE_AFTER
                        );
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct FileLockGuard {
    path: PathBuf,
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Owns `TokenState`. Everything else receives `get_valid_token()` through
/// a shared reference and never caches the value.
pub struct TokenManager {
    store: TokenStore,
    issuer: Arc<dyn TokenIssuer>,
    state: RwLock<Option<TokenState>>,
    /// In-process refresh serialization; concurrent callers wait here, not
    /// on the file lock, so one process never convoys another's waiters.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(store: TokenStore, issuer: Arc<dyn TokenIssuer>) -> Self {
        let state = store.load();
        Self {
            store,
            issuer,
            state: RwLock::new(state),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn get_valid_token(&self) -> Result<String, BrokerError> {
        {
            let state = self.state.read().await;
            if let Some(token) = state.as_ref().filter(|t| t.is_fresh(Utc::now())) {
                return Ok(token.access_token.clone());
            }
        }
        self.refresh(None).await
    }

    /// Refresh because the token aged out locally.
    pub async fn force_refresh(&self) -> Result<String, BrokerError> {
        self.refresh(None).await
    }

    /// Refresh because the broker rejected `rejected_token` as expired.
    /// A token equal to the rejected one is never handed back, however
    /// fresh its local timestamps look.
    pub async fn refresh_after_reject(&self, rejected_token: &str) -> Result<String, BrokerError> {
        self.refresh(Some(rejected_token)).await
    }

    /// Refresh, serialized in-process (the gate) and across processes (the
    /// file lock). While holding the file lock the on-disk state is re-read
    /// first: another process may have refreshed already, in which case its
    /// value is adopted without issuing a new token.
    async fn refresh(&self, rejected: Option<&str>) -> Result<String, BrokerError> {
        let usable = |token: &TokenState| {
            token.is_fresh(Utc::now()) && Some(token.access_token.as_str()) != rejected
        };

        let _gate = self.refresh_gate.lock().await;

        // A concurrent caller may have finished the refresh while this one
        // waited on the gate.
        {
            let state = self.state.read().await;
            if let Some(token) = state.as_ref().filter(|t| usable(t)) {
                return Ok(token.access_token.clone());
            }
        }

        let _lock = self
            .store
            .acquire_lock()
            .await
            .map_err(|e| BrokerError::RefreshFailed {
                attempts: 0,
                reason: format!("token lock: {e}"),
            })?;

        if let Some(disk) = self.store.load() {
            if usable(&disk) {
                info!("Adopting token refreshed by another process");
                let token = disk.access_token.clone();
                *self.state.write().await = Some(disk);
                return Ok(token);
            }
            // One refresh per minute, measured from the stored issue time.
            let elapsed = Utc::now() - disk.issued_at;
            if elapsed < REFRESH_INTERVAL {
                let wait = (REFRESH_INTERVAL - elapsed)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                info!("Honoring broker refresh interval, sleeping {:?}", wait);
                tokio::time::sleep(wait).await;
            }
        }

        let fresh = self.issue_with_backoff().await?;
        self.store.save(&fresh).map_err(|e| BrokerError::RefreshFailed {
            attempts: 1,
            reason: format!("persist token: {e}"),
        })?;
        info!("Access token refreshed, expires at {}", fresh.expires_at);

        let token = fresh.access_token.clone();
        *self.state.write().await = Some(fresh);
        Ok(token)
    }

    async fn issue_with_backoff(&self) -> Result<TokenState, BrokerError> {
        const MAX_ATTEMPTS: u32 = 3;
        let mut delay = Duration::from_millis(500);
        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            match self.issuer.issue().await {
                Ok(state) => return Ok(state),
                Err(e) => {
                    warn!("Token issue attempt {}/{} failed: {}", attempt, MAX_ATTEMPTS, e);
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(BrokerError::RefreshFailed {
            attempts: MAX_ATTEMPTS,
            reason: last_error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockIssuer {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl MockIssuer {
        fn new(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl TokenIssuer for MockIssuer {
        async fn issue(&self) -> Result<TokenState, BrokerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(BrokerError::Http {
                    status: 500,
                    body: "issuer down".to_string(),
                });
            }
            Ok(TokenState {
                access_token: format!("token-{n}"),
                issued_at: Utc::now(),
                expires_at: Utc::now() + ChronoDuration::hours(24),
            })
        }
    }

    fn store(dir: &tempfile::TempDir) -> TokenStore {
        TokenStore::new(dir.path(), Environment::Virtual)
    }

    #[test]
    fn test_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let state = TokenState {
            access_token: "abc".to_string(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + ChronoDuration::hours(24),
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store
            .save(&TokenState {
                access_token: "abc".to_string(),
                issued_at: Utc::now(),
                expires_at: Utc::now() + ChronoDuration::hours(24),
            })
            .unwrap();
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_fresh_token_returned_without_issue() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.save(&TokenState {
            access_token: "still-good".to_string(),
            issued_at: Utc::now() - ChronoDuration::hours(1),
            expires_at: Utc::now() + ChronoDuration::hours(23),
        })
        .unwrap();

        let issuer = Arc::new(MockIssuer::new(0));
        let manager = TokenManager::new(store(&dir), issuer.clone());
        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token, "still-good");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_triggers_single_issue() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        s.save(&TokenState {
            access_token: "expired".to_string(),
            issued_at: Utc::now() - ChronoDuration::hours(25),
            expires_at: Utc::now() - ChronoDuration::hours(1),
        })
        .unwrap();

        let issuer = Arc::new(MockIssuer::new(0));
        let manager = Arc::new(TokenManager::new(store(&dir), issuer.clone()));

        // Two concurrent callers share one refresh.
        let (a, b) = tokio::join!(manager.get_valid_token(), manager.get_valid_token());
        assert_eq!(a.unwrap(), "token-0");
        assert_eq!(b.unwrap(), "token-0");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_issue_retries_then_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(MockIssuer::new(2));
        let manager = TokenManager::new(store(&dir), issuer.clone());
        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token, "token-2");
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_issue_gives_up_after_three_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(MockIssuer::new(10));
        let manager = TokenManager::new(store(&dir), issuer.clone());
        let err = manager.get_valid_token().await.unwrap_err();
        assert!(matches!(err, BrokerError::RefreshFailed { attempts: 3, .. }));
        assert_eq!(issuer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_lock_released_after_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let manager = TokenManager::new(store(&dir), Arc::new(MockIssuer::new(0)));
        manager.get_valid_token().await.unwrap();
        let lock_path = store(&dir).lock_path();
        assert!(!lock_path.exists());
    }

    #[tokio::test]
    async fn test_stale_lock_is_broken() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(&dir);
        let lock_path = s.lock_path();
        std::fs::create_dir_all(lock_path.parent().unwrap()).unwrap();
        std::fs::write(&lock_path, b"").unwrap();
        // Age the lock beyond the stale horizon.
        let old = std::time::SystemTime::now() - Duration::from_secs(300);
        let file = std::fs::File::options().write(true).open(&lock_path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        let manager = TokenManager::new(store(&dir), Arc::new(MockIssuer::new(0)));
        let token = manager.get_valid_token().await.unwrap();
        assert_eq!(token, "token-0");
    }
}
