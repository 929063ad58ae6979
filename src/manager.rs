//! Session Manager: the only component exposed to the HTTP layer.
//!
//! Owns policy — which images are allowed, which sessions are leased, how
//! pool/cold paths are chosen — while the Driver owns mechanism.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use tracing::{info, warn};

use crate::config::Config;
use crate::driver::{CreateOptions, Driver};
use crate::error::{Result, SandkastenError};
use crate::pool::Pool;
use crate::protocol::Request;
use crate::store::{SessionRecord, SessionStatus, Store};

/// Image name pattern: starts with an alphanumeric, then any run of
/// alphanumerics/underscore/dash, length <= 64.
pub fn is_valid_image_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    let mut chars = name.chars();
    let first_ok = chars.next().map(|c| c.is_ascii_alphanumeric()).unwrap_or(false);
    first_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Workspace ID pattern: `^[a-z0-9][a-z0-9-]*[a-z0-9]$`, 2-64 characters
/// long.
pub fn is_valid_workspace_id(id: &str) -> bool {
    if id.len() < 2 || id.len() > 64 {
        return false;
    }
    let bytes = id.as_bytes();
    let is_lower_alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    is_lower_alnum(bytes[0])
        && is_lower_alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| is_lower_alnum(b) || b == b'-')
}

fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let hi: u32 = rng.gen();
    let lo: u16 = rng.gen::<u16>() & 0x0fff;
    format!("{hi:08x}-{lo:03x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireSource {
    Pool,
    Cold,
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub record: SessionRecord,
    pub acquire_source: AcquireSource,
    pub acquire_detail: Option<String>,
}

pub struct ExecResult {
    pub exit_code: i32,
    pub cwd: String,
    pub output: String,
    pub truncated: bool,
    pub duration_ms: u64,
}

pub struct Manager {
    config: Config,
    store: Arc<Store>,
    driver: Arc<Driver>,
    pool: Option<Arc<Pool>>,
    mutexes: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Manager {
    pub fn new(config: Config, store: Arc<Store>, driver: Arc<Driver>) -> Arc<Manager> {
        let pool = if config.pool.enabled {
            Some(Self::build_pool(&config, store.clone(), driver.clone()))
        } else {
            None
        };

        Arc::new(Manager {
            config,
            store,
            driver,
            pool,
            mutexes: Mutex::new(HashMap::new()),
        })
    }

    fn build_pool(config: &Config, store: Arc<Store>, driver: Arc<Driver>) -> Arc<Pool> {
        let mut targets = HashMap::new();
        for (image, count) in &config.pool.images {
            targets.insert((image.clone(), String::new()), *count);
        }

        let create_fn: crate::pool::CreateFunc = Arc::new(move |image, workspace_id| {
            let session_id = generate_session_id();
            let state = driver.create(CreateOptions {
                session_id: session_id.clone(),
                image: image.to_string(),
                workspace_id: workspace_id.to_string(),
            })?;

            let now = Utc::now();
            let record = SessionRecord {
                id: session_id.clone(),
                image: image.to_string(),
                init_pid: state.init_pid,
                cgroup_path: state.cgroup_path.clone(),
                status: SessionStatus::PoolIdle,
                cwd: "/workspace".to_string(),
                workspace_id: workspace_id.to_string(),
                created_at: now,
                // Far in the future so the reaper never treats a pooled
                // session as expired.
                expires_at: now + ChronoDuration::days(365),
                last_activity: now,
            };
            if let Err(e) = store.create_session(&record) {
                let _ = driver.destroy(&session_id);
                return Err(e);
            }
            Ok(session_id)
        });

        Arc::new(Pool::new(targets, create_fn))
    }

    /// Runs an initial `refill_all` if pooling is enabled. Call once at
    /// startup after the Manager is constructed.
    pub fn warm_pool(&self) {
        if let Some(pool) = &self.pool {
            pool.refill_all();
        }
    }

    fn session_mutex(&self, session_id: &str) -> Arc<Mutex<()>> {
        self.mutexes
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Removes a session's mutex entry. Called by `destroy` and by the
    /// reaper after reconciliation.
    pub fn forget_mutex(&self, session_id: &str) {
        self.mutexes.lock().unwrap().remove(session_id);
    }

    /// Creates a new session, trying the pool before falling back to a
    /// cold create.
    pub fn create(
        &self,
        image: Option<String>,
        workspace_id: Option<String>,
        ttl_seconds: i64,
    ) -> Result<SessionInfo> {
        let image = image.filter(|s| !s.is_empty()).unwrap_or_else(|| self.config.default_image.clone());
        if !is_valid_image_name(&image) {
            return Err(SandkastenError::InvalidImage(format!(
                "'{image}' fails the image name pattern"
            )));
        }
        if !self.config.allowed_images.is_empty() && !self.config.allowed_images.contains(&image) {
            return Err(SandkastenError::InvalidImage(format!(
                "'{image}' is not in allowed_images"
            )));
        }

        let ttl = if ttl_seconds <= 0 {
            self.config.session_ttl_seconds as i64
        } else {
            ttl_seconds
        };

        let workspace_id = workspace_id.unwrap_or_default();
        if !workspace_id.is_empty() {
            if !is_valid_workspace_id(&workspace_id) {
                return Err(SandkastenError::InvalidRequest(format!(
                    "'{workspace_id}' fails the workspace ID pattern"
                )));
            }
            let dir = self.config.workspaces_dir().join(&workspace_id);
            if !dir.exists() {
                std::fs::create_dir_all(&dir)?;
                #[cfg(target_os = "linux")]
                {
                    let _ = nix::unistd::chown(
                        &dir,
                        Some(nix::unistd::Uid::from_raw(1000)),
                        Some(nix::unistd::Gid::from_raw(1000)),
                    );
                }
            }
        }

        if let Some(info) = self.try_pool_acquire(&image, &workspace_id, ttl)? {
            return Ok(info);
        }

        self.cold_create(&image, &workspace_id, ttl, None)
    }

    fn try_pool_acquire(
        &self,
        image: &str,
        workspace_id: &str,
        ttl: i64,
    ) -> Result<Option<SessionInfo>> {
        let Some(pool) = &self.pool else {
            return Ok(None);
        };

        // A mismatched warm image/workspace pair still needs the
        // *requested* key, but a pool entry with the exact matching key is
        // tried first.
        let Some(session_id) = pool.get(image, workspace_id) else {
            return Ok(None);
        };

        let record = match self.store.get_session(&session_id)? {
            Some(r) => r,
            None => {
                warn!(session_id, "pool entry had no matching store row, falling back to cold create");
                return Ok(Some(self.cold_create(
                    image,
                    workspace_id,
                    ttl,
                    Some("pool entry missing store row".to_string()),
                )?));
            }
        };

        let result = (|| -> Result<SessionInfo> {
            if record.workspace_id == workspace_id {
                self.promote_pool_entry(record.clone(), ttl)
            } else if record.workspace_id.is_empty() && !workspace_id.is_empty() {
                self.driver.mount_workspace(&session_id, workspace_id)?;
                self.store.update_session_workspace(&session_id, workspace_id)?;
                let mut record = record.clone();
                record.workspace_id = workspace_id.to_string();
                self.promote_pool_entry(record, ttl)
            } else {
                // Workspace-bound session that doesn't match the request:
                // destroy it, refill that key, fall through to cold create.
                let _ = self.driver.destroy(&session_id);
                let _ = self.store.update_session_status(&session_id, SessionStatus::Destroyed);
                pool.refill(image, &record.workspace_id, 1);
                Err(SandkastenError::NotFound)
            }
        })();

        match result {
            Ok(info) => {
                pool.refill(image, workspace_id, 1);
                Ok(Some(info))
            }
            Err(SandkastenError::NotFound) => {
                self.cold_create(image, workspace_id, ttl, Some("pool workspace mismatch".to_string()))
                    .map(Some)
            }
            Err(e) => {
                warn!(session_id, error = %e, "pool acquire step failed, destroying entry and falling back");
                let _ = self.driver.destroy(&session_id);
                let _ = self.store.update_session_status(&session_id, SessionStatus::Destroyed);
                pool.refill(image, workspace_id, 1);
                self.cold_create(image, workspace_id, ttl, Some(format!("pool acquire failed: {e}")))
                    .map(Some)
            }
        }
    }

    fn promote_pool_entry(&self, record: SessionRecord, ttl: i64) -> Result<SessionInfo> {
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl);
        self.store.update_session_status(&record.id, SessionStatus::Running)?;
        self.store.update_session_activity(&record.id, &record.cwd, expires_at)?;

        let mut record = record;
        record.status = SessionStatus::Running;
        record.expires_at = expires_at;
        Ok(SessionInfo {
            record,
            acquire_source: AcquireSource::Pool,
            acquire_detail: None,
        })
    }

    fn cold_create(
        &self,
        image: &str,
        workspace_id: &str,
        ttl: i64,
        acquire_detail: Option<String>,
    ) -> Result<SessionInfo> {
        let session_id = generate_session_id();
        let state = self.driver.create(CreateOptions {
            session_id: session_id.clone(),
            image: image.to_string(),
            workspace_id: workspace_id.to_string(),
        })?;

        let now = Utc::now();
        let record = SessionRecord {
            id: session_id.clone(),
            image: image.to_string(),
            init_pid: state.init_pid,
            cgroup_path: state.cgroup_path,
            status: SessionStatus::Running,
            cwd: "/workspace".to_string(),
            workspace_id: workspace_id.to_string(),
            created_at: now,
            expires_at: now + ChronoDuration::seconds(ttl),
            last_activity: now,
        };

        if let Err(e) = self.store.create_session(&record) {
            let _ = self.driver.destroy(&session_id);
            return Err(e);
        }

        if let Some(pool) = &self.pool {
            pool.refill(image, workspace_id, 1);
        }

        info!(session_id, image, "session created via cold path");
        Ok(SessionInfo {
            record,
            acquire_source: AcquireSource::Cold,
            acquire_detail,
        })
    }

    fn validate_running(&self, session_id: &str) -> Result<SessionRecord> {
        let record = self.store.get_session(session_id)?.ok_or(SandkastenError::NotFound)?;
        if record.status != SessionStatus::Running {
            return Err(SandkastenError::NotRunning);
        }
        if record.expires_at <= Utc::now() {
            return Err(SandkastenError::Expired);
        }
        Ok(record)
    }

    /// Runs a command inside a running session, enforcing the inline
    /// command-size cap and clamping the requested timeout.
    pub fn exec(&self, session_id: &str, cmd: &str, timeout_ms: i64, raw_output: bool) -> Result<ExecResult> {
        // The wire staging mechanism described for oversized commands (write
        // to a file, then `bash <path>`) is deliberately not engaged here:
        // the Manager fails outright and points the caller at the
        // filesystem API instead of silently staging on their behalf (see
        // DESIGN.md's resolution of the "do not attempt to stage" open
        // question). The HTTP layer attaches the `cmd_bytes`/
        // `max_cmd_bytes`/`recommendation` detail object to this error kind.
        if cmd.len() > crate::protocol::MAX_EXEC_INLINE_CMD_BYTES {
            return Err(SandkastenError::InvalidRequest(
                "command exceeds the inline exec size cap".to_string(),
            ));
        }

        let record = self.validate_running(session_id)?;
        let mutex = self.session_mutex(session_id);
        let _guard = mutex.lock().unwrap();

        let clamped_timeout = clamp_timeout(timeout_ms, self.config.defaults.max_exec_timeout_ms);

        let request = Request::Exec {
            id: uuid::Uuid::new_v4().to_string(),
            cmd: cmd.to_string(),
            timeout_ms: clamped_timeout,
            raw_output,
        };

        let response = self.driver.exec(session_id, &request)?;
        self.handle_exec_response(session_id, &record, response)
    }

    fn handle_exec_response(
        &self,
        session_id: &str,
        prior: &SessionRecord,
        response: crate::protocol::Response,
    ) -> Result<ExecResult> {
        match response {
            crate::protocol::Response::Error { error, .. } => Err(SandkastenError::RunnerError(error)),
            resp if resp.is_exec_timeout() => Err(SandkastenError::Timeout(
                "command exceeded its deadline".to_string(),
            )),
            crate::protocol::Response::Exec {
                exit_code,
                cwd,
                output,
                truncated,
                duration_ms,
                ..
            } => {
                let cwd = if cwd.is_empty() { prior.cwd.clone() } else { cwd };
                let expires_at = Utc::now() + ChronoDuration::seconds(self.config.session_ttl_seconds as i64);
                self.store.update_session_activity(session_id, &cwd, expires_at)?;
                Ok(ExecResult {
                    exit_code,
                    cwd,
                    output,
                    truncated,
                    duration_ms,
                })
            }
            _ => Err(SandkastenError::Internal(
                "runner returned an unexpected response type for exec".to_string(),
            )),
        }
    }

    /// Writes a file into the session's `/workspace`, via the runner's
    /// `write` request.
    pub fn write(
        &self,
        session_id: &str,
        path: &str,
        text: Option<String>,
        content_base64: Option<String>,
    ) -> Result<()> {
        self.validate_running(session_id)?;
        let mutex = self.session_mutex(session_id);
        let _guard = mutex.lock().unwrap();

        let request = Request::Write {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            text,
            content_base64,
        };
        match self.driver.exec(session_id, &request)? {
            crate::protocol::Response::Write { ok: true, .. } => Ok(()),
            crate::protocol::Response::Write { ok: false, .. } => {
                Err(SandkastenError::RunnerError("write was rejected by the runner".to_string()))
            }
            crate::protocol::Response::Error { error, .. } => Err(SandkastenError::RunnerError(error)),
            _ => Err(SandkastenError::Internal(
                "runner returned an unexpected response type for write".to_string(),
            )),
        }
    }

    /// Reads a file from the session's `/workspace`, via the runner's `read`
    /// request. `max_bytes <= 0` is rejected
    /// except for exactly `0`, which means "use the default cap".
    pub fn read(&self, session_id: &str, path: &str, max_bytes: i64) -> Result<(String, bool)> {
        if max_bytes < 0 {
            return Err(SandkastenError::InvalidRequest(
                "max_bytes must be >= 0".to_string(),
            ));
        }
        self.validate_running(session_id)?;
        let mutex = self.session_mutex(session_id);
        let _guard = mutex.lock().unwrap();

        let request = Request::Read {
            id: uuid::Uuid::new_v4().to_string(),
            path: path.to_string(),
            max_bytes,
        };
        match self.driver.exec(session_id, &request)? {
            crate::protocol::Response::Read {
                content_base64,
                truncated,
                ..
            } => Ok((content_base64, truncated)),
            crate::protocol::Response::Error { error, .. } => Err(SandkastenError::RunnerError(error)),
            _ => Err(SandkastenError::Internal(
                "runner returned an unexpected response type for read".to_string(),
            )),
        }
    }

    /// Tears down a session and releases its pool/store bookkeeping.
    pub fn destroy(&self, session_id: &str) -> Result<()> {
        let record = self.store.get_session(session_id)?.ok_or(SandkastenError::NotFound)?;
        let _ = record;
        self.store.update_session_status(session_id, SessionStatus::Destroying)?;
        self.driver.destroy(session_id)?;
        self.store.update_session_status(session_id, SessionStatus::Destroyed)?;
        self.forget_mutex(session_id);
        Ok(())
    }

    pub fn get(&self, session_id: &str) -> Result<SessionRecord> {
        self.store.get_session(session_id)?.ok_or(SandkastenError::NotFound)
    }

    pub fn list(&self) -> Result<Vec<SessionRecord>> {
        self.store.list_sessions()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }
}

/// Clamps `timeout_ms` to `[1, max]`; `<= 0` means "use the max".
fn clamp_timeout(timeout_ms: i64, max: u64) -> u64 {
    if timeout_ms <= 0 {
        max
    } else {
        (timeout_ms as u64).clamp(1, max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_pattern_matches_spec() {
        assert!(is_valid_image_name("base"));
        assert!(is_valid_image_name("python3-9"));
        assert!(!is_valid_image_name(""));
        assert!(!is_valid_image_name("/etc/passwd"));
        assert!(!is_valid_image_name(&"a".repeat(65)));
    }

    #[test]
    fn workspace_id_pattern_matches_spec() {
        assert!(is_valid_workspace_id("ws-1"));
        assert!(!is_valid_workspace_id("a"));
        assert!(!is_valid_workspace_id("-abc"));
        assert!(!is_valid_workspace_id("abc-"));
        assert!(!is_valid_workspace_id("ABC"));
    }

    #[test]
    fn session_id_is_twelve_characters_with_dash() {
        let id = generate_session_id();
        assert_eq!(id.len(), 12);
        assert_eq!(id.chars().nth(8), Some('-'));
    }

    #[test]
    fn clamp_timeout_uses_max_for_non_positive() {
        assert_eq!(clamp_timeout(0, 120_000), 120_000);
        assert_eq!(clamp_timeout(-5, 120_000), 120_000);
    }

    #[test]
    fn clamp_timeout_clamps_within_bounds() {
        assert_eq!(clamp_timeout(999_999_999, 120_000), 120_000);
        assert_eq!(clamp_timeout(10, 120_000), 10);
    }
}
