//! Users, address patterns and Argon2id credential checks.

use std::{
    collections::BTreeMap,
    fmt, fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use arc_swap::ArcSwap;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sluice::tunnel::spec::HostPort;

pub const ANONYMOUS: &str = "anonymous";

#[derive(Debug, Error)]
pub enum AuthError {
    /// The only failure a client ever sees.
    #[error("authentication failed")]
    Rejected,
    #[error("invalid password hash for user {0:?}")]
    InvalidHash(String),
    #[error("hash password: {0}")]
    Hashing(String),
    #[error("invalid address pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid user name {0:?}")]
    InvalidName(String),
    #[error("duplicate user {0:?}")]
    Duplicate(String),
    #[error("read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse {}: {msg}", path.display())]
    Parse { path: PathBuf, msg: String },
    #[error("{0}")]
    Invalid(String),
    #[error("user {0:?} not found")]
    NotFound(String),
    #[error("write {}: {msg}", path.display())]
    Write { path: PathBuf, msg: String },
}

/// Minimum length for passwords set through the admin API.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Rules for users created or replaced at runtime. Files written by hand
/// only go through [`UserRecord::new`].
pub fn validate_new_user(name: &str, password: &str, addresses: &[String]) -> Result<(), AuthError> {
    if name.is_empty() || !name.chars().all(char::is_alphanumeric) {
        return Err(AuthError::Invalid(
            "name must be alphanumeric with no special characters".into(),
        ));
    }
    validate_password(password)?;
    validate_addresses(addresses)
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Invalid(format!(
            "password must have a minimum length of {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_addresses(addresses: &[String]) -> Result<(), AuthError> {
    if addresses.is_empty() {
        return Err(AuthError::Invalid("at least one address must be provided".into()));
    }
    if addresses.iter().any(|a| a.trim().is_empty()) {
        return Err(AuthError::Invalid(
            "address pattern must not be empty, use '.*' to match all".into(),
        ));
    }
    Ok(())
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| AuthError::Hashing(e.to_string()))
}

/// `Ok(false)` on mismatch; `Err` only when `hash` is not a valid PHC string.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|_| AuthError::InvalidHash(String::new()))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(e) => Err(AuthError::Hashing(e.to_string())),
    }
}

/// Verified against for unknown users so both failure paths cost one Argon2
/// verification. Default Argon2id parameters; the digest matches no password.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$SHIdhLDTL6bht693QsinBg$B3BXCH+4+RwwNXvfzvTEUkAOCnHVBIPxfx8oiV5w344";

/// A regex matched in full against `port` or `host:port`.
#[derive(Clone)]
pub struct AddrPattern {
    source: String,
    re: Regex,
}

impl AddrPattern {
    pub fn new(pattern: &str) -> Result<Self, AuthError> {
        let re = Regex::new(&format!("^(?:{pattern})$")).map_err(|source| AuthError::Pattern {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self {
            source: pattern.to_string(),
            re,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, addr: &HostPort) -> bool {
        self.re.is_match(&addr.port.to_string()) || self.re.is_match(&addr.to_string())
    }
}

impl fmt::Debug for AddrPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.source)
    }
}

#[derive(Clone)]
pub struct UserRecord {
    pub name: String,
    password_hash: String,
    pub addresses: Vec<AddrPattern>,
    pub admin: bool,
}

impl fmt::Debug for UserRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserRecord")
            .field("name", &self.name)
            .field("addresses", &self.addresses)
            .field("admin", &self.admin)
            .finish_non_exhaustive()
    }
}

impl UserRecord {
    pub fn new(
        name: &str,
        password_hash: &str,
        addresses: &[String],
        admin: bool,
    ) -> Result<Self, AuthError> {
        let valid_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_name {
            return Err(AuthError::InvalidName(name.to_string()));
        }
        PasswordHash::new(password_hash).map_err(|_| AuthError::InvalidHash(name.to_string()))?;
        let addresses = addresses
            .iter()
            .map(|p| AddrPattern::new(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.to_string(),
            password_hash: password_hash.to_string(),
            addresses,
            admin,
        })
    }

    /// The identity every credential maps to when no users file is configured.
    pub fn anonymous(name: &str) -> Self {
        let name = if name.is_empty() { ANONYMOUS } else { name };
        Self {
            name: name.to_string(),
            password_hash: String::new(),
            addresses: AddrPattern::new(".*").into_iter().collect(),
            admin: false,
        }
    }

    pub fn may_use(&self, addr: &HostPort) -> bool {
        self.addresses.iter().any(|p| p.matches(addr))
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct FileUsers {
    #[serde(default)]
    users: Vec<FileUser>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
struct FileUser {
    name: String,
    password_hash: String,
    #[serde(default)]
    addresses: Vec<String>,
    #[serde(default)]
    admin: bool,
}

impl From<&UserRecord> for FileUser {
    fn from(r: &UserRecord) -> Self {
        Self {
            name: r.name.clone(),
            password_hash: r.password_hash.clone(),
            addresses: r.addresses.iter().map(|p| p.as_str().to_string()).collect(),
            admin: r.admin,
        }
    }
}

fn file_format(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

/// A snapshot of all known users. Replaced wholesale on reload.
#[derive(Debug, Default)]
pub struct UserStore {
    users: BTreeMap<String, Arc<UserRecord>>,
    open: bool,
}

impl UserStore {
    /// No users configured: every credential is accepted.
    pub fn open() -> Self {
        Self {
            users: BTreeMap::new(),
            open: true,
        }
    }

    pub fn from_records(records: Vec<UserRecord>) -> Result<Self, AuthError> {
        let mut users = BTreeMap::new();
        for r in records {
            if users.contains_key(&r.name) {
                return Err(AuthError::Duplicate(r.name));
            }
            users.insert(r.name.clone(), Arc::new(r));
        }
        Ok(Self { users, open: false })
    }

    /// Loads a users file; the format follows the extension (toml, yaml/yml, json).
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let data = fs::read_to_string(path).map_err(|source| AuthError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |msg: String| AuthError::Parse {
            path: path.to_path_buf(),
            msg,
        };

        let file: FileUsers = match file_format(path).as_str() {
            "toml" => toml::from_str(&data).map_err(|e| parse_err(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::from_str(&data).map_err(|e| parse_err(e.to_string()))?,
            "json" => serde_json::from_str(&data).map_err(|e| parse_err(e.to_string()))?,
            other => return Err(parse_err(format!("unsupported extension {other:?}"))),
        };

        let records = file
            .users
            .into_iter()
            .map(|u| UserRecord::new(u.name.trim(), u.password_hash.trim(), &u.addresses, u.admin))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_records(records)
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<UserRecord>> {
        self.users.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<UserRecord>> {
        self.users.values()
    }

    /// Writes the store in the format its extension names, replacing `path`
    /// only once the new content is fully on disk.
    pub fn save(&self, path: &Path) -> Result<(), AuthError> {
        let write_err = |msg: String| AuthError::Write {
            path: path.to_path_buf(),
            msg,
        };
        let file = FileUsers {
            users: self.iter().map(|u| FileUser::from(u.as_ref())).collect(),
        };
        let data = match file_format(path).as_str() {
            "toml" => toml::to_string(&file).map_err(|e| write_err(e.to_string()))?,
            "yaml" | "yml" => serde_yaml::to_string(&file).map_err(|e| write_err(e.to_string()))?,
            "json" => serde_json::to_string_pretty(&file).map_err(|e| write_err(e.to_string()))?,
            other => return Err(write_err(format!("unsupported extension {other:?}"))),
        };

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, data).map_err(|e| write_err(e.to_string()))?;
        fs::rename(&tmp, path).map_err(|e| write_err(e.to_string()))
    }
}

/// Checks credentials against the current [`UserStore`].
///
/// Verification is CPU-bound; async callers should run it on the blocking pool.
#[derive(Debug)]
pub struct Authenticator {
    store: ArcSwap<UserStore>,
    path: Option<PathBuf>,
    /// Serializes read-modify-write cycles on the store and the file.
    edit: Mutex<()>,
}

impl Authenticator {
    pub fn new(store: UserStore) -> Self {
        Self {
            store: ArcSwap::from_pointee(store),
            path: None,
            edit: Mutex::new(()),
        }
    }

    /// `None` runs in open mode.
    pub fn from_file(path: Option<&Path>) -> Result<Self, AuthError> {
        let Some(path) = path else {
            return Ok(Self::new(UserStore::open()));
        };
        let store = UserStore::load(path)?;
        Ok(Self {
            store: ArcSwap::from_pointee(store),
            path: Some(path.to_path_buf()),
            edit: Mutex::new(()),
        })
    }

    pub fn users_file(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn store(&self) -> Arc<UserStore> {
        self.store.load_full()
    }

    pub fn replace(&self, store: UserStore) {
        self.store.store(Arc::new(store));
    }

    /// Re-reads the users file. On error the previous users stay in effect.
    pub fn reload(&self) -> Result<usize, AuthError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let _edit = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        let store = UserStore::load(path)?;
        let n = store.len();
        self.replace(store);
        Ok(n)
    }

    pub fn authenticate(&self, user: &str, secret: &str) -> Result<Arc<UserRecord>, AuthError> {
        let store = self.store.load();
        if store.is_open() {
            return Ok(Arc::new(UserRecord::anonymous(user)));
        }

        let record = store.get(user);
        let hash = record
            .as_ref()
            .map(|r| r.password_hash.as_str())
            .unwrap_or(DUMMY_HASH);
        let ok = verify_password(secret, hash).unwrap_or(false);

        match record {
            Some(r) if ok => Ok(r),
            _ => {
                metrics::counter!("sluice_auth_failures_total").increment(1);
                Err(AuthError::Rejected)
            }
        }
    }

    /// Applies `change` to a copy of the current users, persists the result
    /// to the users file (if any) and only then makes it live.
    fn modify<F>(&self, change: F) -> Result<(), AuthError>
    where
        F: FnOnce(&mut BTreeMap<String, Arc<UserRecord>>) -> Result<(), AuthError>,
    {
        let _edit = self.edit.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.store.load_full();
        if current.is_open() {
            return Err(AuthError::Invalid("no users file configured".into()));
        }
        let mut users = current.users.clone();
        change(&mut users)?;
        let next = UserStore { users, open: false };
        if let Some(path) = &self.path {
            next.save(path)?;
        }
        self.replace(next);
        Ok(())
    }

    pub fn add_user(&self, record: UserRecord) -> Result<(), AuthError> {
        self.modify(|users| {
            if users.contains_key(&record.name) {
                return Err(AuthError::Duplicate(record.name.clone()));
            }
            users.insert(record.name.clone(), Arc::new(record));
            Ok(())
        })
    }

    /// Changes `name` in place. `None` keeps the current hash or addresses.
    pub fn update_user(
        &self,
        name: &str,
        password_hash: Option<&str>,
        addresses: Option<&[String]>,
        admin: bool,
    ) -> Result<(), AuthError> {
        self.modify(|users| {
            let old = users
                .get(name)
                .ok_or_else(|| AuthError::NotFound(name.to_string()))?;
            let hash = password_hash.unwrap_or(&old.password_hash);
            let addrs: Vec<String> = match addresses {
                Some(a) => a.to_vec(),
                None => old.addresses.iter().map(|p| p.as_str().to_string()).collect(),
            };
            let next = UserRecord::new(name, hash, &addrs, admin)?;
            users.insert(name.to_string(), Arc::new(next));
            Ok(())
        })
    }

    pub fn remove_user(&self, name: &str) -> Result<(), AuthError> {
        self.modify(|users| {
            users
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| AuthError::NotFound(name.to_string()))
        })
    }

    /// Replaces every user at once.
    pub fn replace_users(&self, records: Vec<UserRecord>) -> Result<(), AuthError> {
        let fresh = UserStore::from_records(records)?;
        self.modify(move |users| {
            *users = fresh.users;
            Ok(())
        })
    }

    /// Like [`Authenticator::authenticate`] but also requires the admin flag.
    pub fn authenticate_admin(
        &self,
        user: &str,
        secret: &str,
    ) -> Result<Arc<UserRecord>, AuthError> {
        if self.store.load().is_open() {
            return Err(AuthError::Rejected);
        }
        let r = self.authenticate(user, secret)?;
        if !r.admin {
            return Err(AuthError::Rejected);
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use rand::{RngExt, rng};

    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sluice-auth-{}-{}-{}",
            name,
            std::process::id(),
            rng().random::<u64>()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn hp(host: &str, port: u16) -> HostPort {
        HostPort::new(host, port)
    }

    #[test]
    fn port_pattern_authorizes_only_that_port() {
        let hash = hash_password("pw").unwrap();
        let u = UserRecord::new("alice", &hash, &["8080".into()], false).unwrap();
        assert!(u.may_use(&hp("0.0.0.0", 8080)));
        assert!(!u.may_use(&hp("0.0.0.0", 9090)));
        // full match, not substring
        assert!(!u.may_use(&hp("0.0.0.0", 18080)));
    }

    #[test]
    fn host_port_patterns_and_wildcards() {
        let p = AddrPattern::new(r"db\.internal:54\d\d").unwrap();
        assert!(p.matches(&hp("db.internal", 5432)));
        assert!(!p.matches(&hp("db.internal", 6379)));
        assert!(!p.matches(&hp("evil.internal", 5432)));

        let all = AddrPattern::new(".*").unwrap();
        assert!(all.matches(&hp("anything", 1)));

        assert!(matches!(
            AddrPattern::new("(unclosed"),
            Err(AuthError::Pattern { .. })
        ));
    }

    #[test]
    fn dummy_hash_uses_default_params_and_matches_nothing() {
        let parsed = PasswordHash::new(DUMMY_HASH).unwrap();
        assert_eq!(parsed.algorithm.as_str(), "argon2id");
        let real = hash_password("x").unwrap();
        let real = PasswordHash::new(&real).unwrap();
        assert_eq!(parsed.params, real.params);
        assert!(!verify_password("", DUMMY_HASH).unwrap());
        assert!(!verify_password("sluice", DUMMY_HASH).unwrap());
    }

    #[test]
    fn wrong_secret_and_unknown_user_fail_identically() {
        let hash = hash_password("correct horse").unwrap();
        let store = UserStore::from_records(vec![
            UserRecord::new("alice", &hash, &[".*".into()], false).unwrap(),
        ])
        .unwrap();
        let auth = Authenticator::new(store);

        let ok = auth.authenticate("alice", "correct horse").unwrap();
        assert_eq!(ok.name, "alice");

        let wrong = auth.authenticate("alice", "battery staple").unwrap_err();
        let unknown = auth.authenticate("mallory", "correct horse").unwrap_err();
        assert!(matches!(wrong, AuthError::Rejected));
        assert!(matches!(unknown, AuthError::Rejected));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[test]
    fn open_mode_accepts_anyone_with_full_access() {
        let auth = Authenticator::from_file(None).unwrap();
        let u = auth.authenticate("", "whatever").unwrap();
        assert_eq!(u.name, ANONYMOUS);
        assert!(u.may_use(&hp("0.0.0.0", 22)));
        assert!(!u.admin);
        assert!(auth.authenticate_admin("x", "y").is_err());
    }

    #[test]
    fn users_file_loads_and_reloads() {
        let dir = temp_dir("reload");
        let path = dir.join("users.toml");
        let h1 = hash_password("one").unwrap();
        fs::write(
            &path,
            format!(
                "[[users]]\nname = \"alice\"\npassword_hash = \"{h1}\"\naddresses = [\"80\"]\nadmin = true\n"
            ),
        )
        .unwrap();

        let auth = Authenticator::from_file(Some(&path)).unwrap();
        assert!(auth.authenticate_admin("alice", "one").is_ok());
        let dbg = format!("{:?}", auth.store().get("alice").unwrap());
        assert!(!dbg.contains(&h1));

        let h2 = hash_password("two").unwrap();
        fs::write(
            &path,
            format!("[[users]]\nname = \"bob\"\npassword_hash = \"{h2}\"\n"),
        )
        .unwrap();
        assert_eq!(auth.reload().unwrap(), 1);
        assert!(auth.authenticate("alice", "one").is_err());
        let bob = auth.authenticate("bob", "two").unwrap();
        assert!(bob.addresses.is_empty());
        assert!(!bob.may_use(&hp("0.0.0.0", 80)));

        // a broken file keeps the previous users
        fs::write(&path, "[[users]]\nname = \"bob\"\n").unwrap();
        assert!(auth.reload().is_err());
        assert!(auth.authenticate("bob", "two").is_ok());
    }

    #[test]
    fn yaml_and_json_users_files() {
        let dir = temp_dir("formats");
        let h = hash_password("pw").unwrap();

        let y = dir.join("users.yaml");
        fs::write(
            &y,
            format!("users:\n  - name: carol\n    password_hash: \"{h}\"\n    addresses: [\".*\"]\n"),
        )
        .unwrap();
        assert_eq!(UserStore::load(&y).unwrap().len(), 1);

        let j = dir.join("users.json");
        let body = serde_json::json!({
            "users": [
                { "name": "dave", "password_hash": h },
                { "name": "dave", "password_hash": h },
            ]
        });
        fs::write(&j, body.to_string()).unwrap();
        assert!(matches!(UserStore::load(&j), Err(AuthError::Duplicate(_))));
    }

    fn admin_store(path: Option<&Path>) -> Authenticator {
        let h = hash_password("root-pass").unwrap();
        let store = UserStore::from_records(vec![
            UserRecord::new("root", &h, &[".*".into()], true).unwrap(),
        ])
        .unwrap();
        match path {
            Some(p) => {
                store.save(p).unwrap();
                Authenticator::from_file(Some(p)).unwrap()
            }
            None => Authenticator::new(store),
        }
    }

    #[test]
    fn runtime_user_validation() {
        let addrs = vec!["8080".to_string()];
        assert!(validate_new_user("alice2", "longenough", &addrs).is_ok());
        assert!(validate_new_user("al-ice", "longenough", &addrs).is_err());
        assert!(validate_new_user("", "longenough", &addrs).is_err());
        assert!(validate_new_user("alice", "short", &addrs).is_err());
        assert!(validate_new_user("alice", "longenough", &[]).is_err());
        assert!(validate_new_user("alice", "longenough", &["".into()]).is_err());
    }

    #[test]
    fn mutations_apply_in_memory() {
        let auth = admin_store(None);
        let h = hash_password("bob-password").unwrap();
        auth.add_user(UserRecord::new("bob", &h, &["80".into()], false).unwrap())
            .unwrap();
        assert!(matches!(
            auth.add_user(UserRecord::new("bob", &h, &["80".into()], false).unwrap()),
            Err(AuthError::Duplicate(_))
        ));
        assert!(auth.authenticate("bob", "bob-password").is_ok());

        auth.update_user("bob", None, Some(&["9090".into()]), true)
            .unwrap();
        let bob = auth.authenticate_admin("bob", "bob-password").unwrap();
        assert!(bob.may_use(&hp("0.0.0.0", 9090)));
        assert!(!bob.may_use(&hp("0.0.0.0", 80)));

        assert!(matches!(
            auth.update_user("nobody", None, None, false),
            Err(AuthError::NotFound(_))
        ));
        auth.remove_user("bob").unwrap();
        assert!(auth.authenticate("bob", "bob-password").is_err());
        assert!(matches!(auth.remove_user("bob"), Err(AuthError::NotFound(_))));
    }

    #[test]
    fn open_mode_refuses_mutations() {
        let auth = Authenticator::from_file(None).unwrap();
        let h = hash_password("whatever1").unwrap();
        let r = UserRecord::new("bob", &h, &["80".into()], false).unwrap();
        assert!(matches!(auth.add_user(r), Err(AuthError::Invalid(_))));
    }

    #[test]
    fn mutations_are_written_back_in_the_file_format() {
        for ext in ["toml", "yaml", "json"] {
            let dir = temp_dir("writeback");
            let path = dir.join(format!("users.{ext}"));
            let auth = admin_store(Some(&path));
            let h = hash_password("carol-password").unwrap();
            auth.add_user(UserRecord::new("carol", &h, &["5432".into()], false).unwrap())
                .unwrap();

            let reread = UserStore::load(&path).unwrap();
            assert_eq!(reread.len(), 2, "{ext}");
            let carol = reread.get("carol").unwrap();
            assert_eq!(carol.addresses[0].as_str(), "5432");
            assert!(!dir.join(format!("users.{ext}.tmp")).exists());

            // a reload of what we wrote is a no-op
            assert_eq!(auth.reload().unwrap(), 2);
            assert!(auth.authenticate("carol", "carol-password").is_ok());
        }
    }

    #[test]
    fn replace_users_rejects_duplicates_and_keeps_old_set() {
        let auth = admin_store(None);
        let h = hash_password("dave-password").unwrap();
        let dup = vec![
            UserRecord::new("dave", &h, &["1".into()], true).unwrap(),
            UserRecord::new("dave", &h, &["2".into()], true).unwrap(),
        ];
        assert!(auth.replace_users(dup).is_err());
        assert!(auth.authenticate_admin("root", "root-pass").is_ok());

        auth.replace_users(vec![UserRecord::new("dave", &h, &["1".into()], true).unwrap()])
            .unwrap();
        assert!(auth.authenticate("root", "root-pass").is_err());
        assert_eq!(auth.store().len(), 1);
    }

    #[test]
    fn rejects_bad_records() {
        assert!(matches!(
            UserRecord::new("alice", "not-a-phc-string", &[], false),
            Err(AuthError::InvalidHash(_))
        ));
        let h = hash_password("pw").unwrap();
        assert!(matches!(
            UserRecord::new("bad name", &h, &[], false),
            Err(AuthError::InvalidName(_))
        ));
    }
}
