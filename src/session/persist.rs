//! Dual-channel persistence for the session.
//!
//! The serialized session is mirrored into a keyed store (the client-side
//! channel) and a same-named cookie (the channel a server-side gatekeeper
//! reads). Both sinks are private to `Persistence`; the only writers are
//! `persist` and `clear`, so the two channels cannot drift apart.

use crate::{error::ApiError, session::Session};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};
use url::form_urlencoded;

/// Keyed string storage, the client-side channel.
pub trait KeyValueStore: Send + Sync {
    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, ApiError>;

    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), ApiError>;

    /// Removing a missing key is not an error.
    ///
    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be written.
    fn remove(&self, key: &str) -> Result<(), ApiError>;
}

/// Cookie storage, the channel visible to the gatekeeper.
pub trait CookieJar: Send + Sync {
    /// Returns `None` for missing or expired cookies.
    ///
    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be read.
    fn get(&self, name: &str) -> Result<Option<SessionCookie>, ApiError>;

    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be written.
    fn set(&self, cookie: SessionCookie) -> Result<(), ApiError>;

    /// # Errors
    /// Returns `ApiError::Storage` if the backend cannot be written.
    fn remove(&self, name: &str) -> Result<(), ApiError>;
}

/// A cookie carrying the serialized session. `value` is percent-encoded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCookie {
    pub name: String,
    pub value: String,
    pub path: String,
    pub max_age: u64,
    pub same_site: String,
    /// Unix seconds.
    pub expires_at: u64,
}

impl SessionCookie {
    #[must_use]
    pub fn new(name: &str, raw_value: &str, max_age: Duration) -> Self {
        Self {
            name: name.to_string(),
            value: encode_cookie_value(raw_value),
            path: "/".to_string(),
            max_age: max_age.as_secs(),
            same_site: "Strict".to_string(),
            expires_at: unix_now().saturating_add(max_age.as_secs()),
        }
    }

    /// The decoded cookie payload.
    #[must_use]
    pub fn decoded_value(&self) -> String {
        decode_cookie_value(&self.value)
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= unix_now()
    }

    /// Renders the cookie as a `Set-Cookie` header value.
    #[must_use]
    pub fn to_header(&self) -> String {
        format!(
            "{}={}; Path={}; Max-Age={}; SameSite={}",
            self.name, self.value, self.path, self.max_age, self.same_site
        )
    }

    /// `Set-Cookie` value that deletes the cookie.
    #[must_use]
    pub fn removal_header(name: &str) -> String {
        format!("{name}=; Path=/; Max-Age=0; SameSite=Strict")
    }
}

#[must_use]
pub fn encode_cookie_value(raw: &str) -> String {
    form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}

#[must_use]
pub fn decode_cookie_value(encoded: &str) -> String {
    // byte_serialize escapes '&' and '=', so the whole value decodes as one key
    form_urlencoded::parse(encoded.as_bytes())
        .map(|(key, _)| key.into_owned())
        .next()
        .unwrap_or_default()
}

/// Writes and clears both channels through one path.
#[derive(Clone)]
pub struct Persistence {
    store: Arc<dyn KeyValueStore>,
    cookies: Arc<dyn CookieJar>,
    key: String,
    cookie_max_age: Duration,
}

impl Persistence {
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        cookies: Arc<dyn CookieJar>,
        key: &str,
        cookie_max_age: Duration,
    ) -> Self {
        Self {
            store,
            cookies,
            key: key.to_string(),
            cookie_max_age,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Serializes `session` once and writes the same bytes to both channels.
    /// If either sink fails, both are cleared so they never disagree.
    ///
    /// # Errors
    /// Returns an error if serialization or either sink fails.
    pub fn persist(&self, session: &Session) -> Result<(), ApiError> {
        let serialized = serde_json::to_string(session)
            .map_err(|err| ApiError::Serialization(format!("Failed to encode session: {err}")))?;

        let written = self.store.set(&self.key, &serialized).and_then(|()| {
            self.cookies.set(SessionCookie::new(
                &self.key,
                &serialized,
                self.cookie_max_age,
            ))
        });

        if let Err(err) = written {
            warn!("Failed to persist session, clearing both channels: {}", err);
            let _ = self.clear();
            return Err(err);
        }

        debug!(key = %self.key, "session persisted");

        Ok(())
    }

    /// Deletes both channels. Both removals are attempted even if one fails.
    ///
    /// # Errors
    /// Returns the first sink error.
    pub fn clear(&self) -> Result<(), ApiError> {
        let store_result = self.store.remove(&self.key);
        let cookie_result = self.cookies.remove(&self.key);

        if let Err(err) = &store_result {
            warn!("Failed to clear persisted session: {}", err);
        }
        if let Err(err) = &cookie_result {
            warn!("Failed to clear session cookie: {}", err);
        }

        store_result.and(cookie_result)
    }

    /// Reads the session back from the keyed store.
    ///
    /// # Errors
    /// Returns an error if the store cannot be read or the record is not valid JSON.
    pub fn load(&self) -> Result<Option<Session>, ApiError> {
        let Some(raw) = self.store.get(&self.key)? else {
            return Ok(None);
        };

        let session = serde_json::from_str::<Session>(&raw)
            .map_err(|err| ApiError::Parse(format!("Failed to decode stored session: {err}")))?;

        Ok(Some(session))
    }

    /// Raw payloads of both channels, for diagnostics.
    ///
    /// # Errors
    /// Returns an error if either sink cannot be read.
    pub fn channels(&self) -> Result<(Option<String>, Option<String>), ApiError> {
        let stored = self.store.get(&self.key)?;
        let cookie = self
            .cookies
            .get(&self.key)?
            .map(|cookie| cookie.decoded_value());
        Ok((stored, cookie))
    }
}

/// In-memory keyed store.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ApiError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ApiError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

/// In-memory cookie jar.
#[derive(Default)]
pub struct MemoryCookieJar {
    cookies: Mutex<HashMap<String, SessionCookie>>,
}

impl MemoryCookieJar {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CookieJar for MemoryCookieJar {
    fn get(&self, name: &str) -> Result<Option<SessionCookie>, ApiError> {
        let cookies = self.cookies.lock().map_err(|_| poisoned())?;
        Ok(cookies
            .get(name)
            .filter(|cookie| !cookie.is_expired())
            .cloned())
    }

    fn set(&self, cookie: SessionCookie) -> Result<(), ApiError> {
        let mut cookies = self.cookies.lock().map_err(|_| poisoned())?;
        cookies.insert(cookie.name.clone(), cookie);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<(), ApiError> {
        let mut cookies = self.cookies.lock().map_err(|_| poisoned())?;
        cookies.remove(name);
        Ok(())
    }
}

/// Keyed store backed by one JSON file per key inside a directory.
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, ApiError> {
        read_optional(&self.path_for(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ApiError> {
        write_private(&self.path_for(key), value.as_bytes())
    }

    fn remove(&self, key: &str) -> Result<(), ApiError> {
        remove_optional(&self.path_for(key))
    }
}

/// Cookie jar persisted as a JSON list in a single file.
pub struct FileCookieJar {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileCookieJar {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> Result<Vec<SessionCookie>, ApiError> {
        match read_optional(&self.path)? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .map_err(|err| ApiError::Storage(format!("Failed to decode cookie jar: {err}"))),
            _ => Ok(Vec::new()),
        }
    }

    fn write_all(&self, cookies: &[SessionCookie]) -> Result<(), ApiError> {
        let raw = serde_json::to_vec_pretty(cookies)
            .map_err(|err| ApiError::Storage(format!("Failed to encode cookie jar: {err}")))?;
        write_private(&self.path, &raw)
    }
}

impl CookieJar for FileCookieJar {
    fn get(&self, name: &str) -> Result<Option<SessionCookie>, ApiError> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        Ok(self
            .read_all()?
            .into_iter()
            .find(|cookie| cookie.name == name && !cookie.is_expired()))
    }

    fn set(&self, cookie: SessionCookie) -> Result<(), ApiError> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut cookies = self.read_all()?;
        cookies.retain(|existing| existing.name != cookie.name && !existing.is_expired());
        cookies.push(cookie);
        self.write_all(&cookies)
    }

    fn remove(&self, name: &str) -> Result<(), ApiError> {
        let _guard = self.lock.lock().map_err(|_| poisoned())?;
        let mut cookies = self.read_all()?;
        let before = cookies.len();
        cookies.retain(|existing| existing.name != name);
        if cookies.len() == before {
            return Ok(());
        }
        self.write_all(&cookies)
    }
}

fn poisoned() -> ApiError {
    ApiError::Storage("storage lock poisoned".to_string())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs())
}

fn read_optional(path: &Path) -> Result<Option<String>, ApiError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ApiError::Storage(format!(
            "Failed to read {}: {err}",
            path.display()
        ))),
    }
}

fn remove_optional(path: &Path) -> Result<(), ApiError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ApiError::Storage(format!(
            "Failed to remove {}: {err}",
            path.display()
        ))),
    }
}

/// Writes through a temp file and rename; tokens are readable by the owner only.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), ApiError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;

    Ok(())
}
