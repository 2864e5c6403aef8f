//! On-disk repository
//!
//! Owns the server data directory:
//!
//! ```text
//! <root>/
//!   config                     # key = value defaults
//!   orgs/
//!     <org-name>/
//!       users/
//!         <user-uuid>/
//!           config             # user = <display-name>
//!           tx.data            # append-only log: JSON tasks + sync keys
//!           tx.tmp.data        # transient, exists only during append
//! ```
//!
//! The user directory name is the user's key (a v4 UUID). Transaction logs
//! strictly grow; an append builds `tx.tmp.data` (copy of the current log
//! plus the new lines) and renames it over `tx.data`, so readers never see
//! a partial append.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::config::{keys, Config, DEFAULT_QUEUE_SIZE, DEFAULT_REQUEST_LIMIT};
use crate::error::{Error, Result};

const ORGS_DIR: &str = "orgs";
const USERS_DIR: &str = "users";
const CONFIG_FILE: &str = "config";
const TX_FILE: &str = "tx.data";
const TX_TEMP_FILE: &str = "tx.tmp.data";

/// An organization and its discovered users.
#[derive(Debug, Clone, PartialEq)]
pub struct Organization {
    pub name: String,
    pub users: Vec<User>,
}

/// A user: display name plus the key that names its directory. The org
/// back-reference is the organization name, resolved on demand.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub name: String,
    pub key: String,
    pub org: String,
}

/// Handle on a server data directory.
#[derive(Debug, Clone)]
pub struct Repository {
    root: PathBuf,
    config: Config,
}

impl Repository {
    /// Initialize a brand-new repository. The root must exist, be a
    /// directory, be empty, and be writable.
    pub fn create(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let metadata = fs::metadata(root)
            .map_err(|err| Error::Repository(format!("{}: {err}", root.display())))?;
        if !metadata.is_dir() {
            return Err(Error::Repository(format!(
                "{}: directory expected",
                root.display()
            )));
        }
        let root = root
            .canonicalize()
            .map_err(|err| Error::Repository(format!("{}: {err}", root.display())))?;
        if fs::read_dir(&root)?.next().is_some() {
            return Err(Error::Repository(format!("{}: not empty", root.display())));
        }

        create_dir(&root.join(ORGS_DIR))?;

        let temp = std::env::temp_dir();
        let mut config = Config::new(root.join(CONFIG_FILE));
        config.set(keys::CONFIRMATION, "true");
        config.set(keys::LOG, temp.join("taskd.log").display().to_string());
        config.set(keys::PID_FILE, temp.join("taskd.pid").display().to_string());
        config.set(keys::QUEUE_SIZE, DEFAULT_QUEUE_SIZE.to_string());
        config.set(keys::REQUEST_LIMIT, DEFAULT_REQUEST_LIMIT.to_string());
        config.set(keys::ROOT, root.display().to_string());
        config.set(keys::TRUST, "strict");
        config.set(keys::VERBOSE, "true");
        config.save()?;

        Ok(Self { root, config })
    }

    /// Open an existing repository by reading its config.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.join(ORGS_DIR).is_dir() {
            return Err(Error::NotARepo(root));
        }
        let config = Config::load(root.join(CONFIG_FILE))?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    fn org_path(&self, org: &str) -> PathBuf {
        self.root.join(ORGS_DIR).join(org)
    }

    fn user_path(&self, org: &str, key: &str) -> PathBuf {
        self.org_path(org).join(USERS_DIR).join(key)
    }

    /// Enumerate organizations, one directory level under `orgs/`.
    pub fn orgs(&self) -> Result<Vec<Organization>> {
        let mut orgs = Vec::new();
        for entry in fs::read_dir(self.root.join(ORGS_DIR))? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match self.get_org(&name) {
                Ok(org) => orgs.push(org),
                Err(err) => warn!(org = %name, %err, "ignoring organization"),
            }
        }
        orgs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(orgs)
    }

    /// Load one organization, discovering its users by walking
    /// `orgs/<org>/users/` one level deep. A user directory with a
    /// malformed config is logged and skipped, not fatal.
    pub fn get_org(&self, name: &str) -> Result<Organization> {
        let users_root = self.org_path(name).join(USERS_DIR);
        if !users_root.is_dir() {
            return Err(Error::OrgNotFound(name.to_string()));
        }

        let mut users = Vec::new();
        for entry in fs::read_dir(&users_root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().into_owned();
            match Config::load(entry.path().join(CONFIG_FILE)) {
                Ok(user_config) => {
                    let Some(user_name) = user_config.get("user") else {
                        warn!(user = %key, "ignoring user: config has no `user` entry");
                        continue;
                    };
                    users.push(User {
                        name: user_name.to_string(),
                        key,
                        org: name.to_string(),
                    });
                }
                Err(err) => warn!(user = %key, %err, "ignoring user"),
            }
        }
        users.sort_by(|a, b| a.key.cmp(&b.key));

        Ok(Organization {
            name: name.to_string(),
            users,
        })
    }

    /// Create a new organization directory tree.
    pub fn new_org(&self, name: &str) -> Result<Organization> {
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(Error::InvalidArgument(format!(
                "invalid organization name: {name:?}"
            )));
        }
        let path = self.org_path(name);
        if path.exists() {
            return Err(Error::OrgExists(name.to_string()));
        }

        create_dir(&path)?;
        create_dir(&path.join(USERS_DIR))?;

        Ok(Organization {
            name: name.to_string(),
            users: Vec::new(),
        })
    }

    /// Add a user to an organization. The generated key both names the
    /// user directory and authenticates the user; display names need not
    /// be unique across orgs, only within one.
    pub fn add_user(&self, org_name: &str, user_name: &str) -> Result<User> {
        let org = self.get_org(org_name)?;
        if org.users.iter().any(|user| user.name == user_name) {
            return Err(Error::UserExists(user_name.to_string()));
        }

        let key = Uuid::new_v4().to_string();
        let path = self.user_path(org_name, &key);
        create_dir(&path)?;

        let mut user_config = Config::new(path.join(CONFIG_FILE));
        user_config.set("user", user_name);
        user_config.save()?;

        Ok(User {
            name: user_name.to_string(),
            key,
            org: org_name.to_string(),
        })
    }

    /// Resolve an `(org, user, key)` triple against the repository.
    pub fn authenticate(&self, org_name: &str, user_name: &str, key: &str) -> Result<User> {
        let org = self.get_org(org_name).map_err(|_| Error::InvalidOrg)?;
        org.users
            .into_iter()
            .find(|user| user.key == key && user.name == user_name)
            .ok_or(Error::InvalidCredentials)
    }

    /// Read the user's transaction log as lines, creating an empty log on
    /// first use.
    pub fn read(&self, user: &User) -> Result<Vec<String>> {
        let path = self.user_path(&user.org, &user.key).join(TX_FILE);
        let file = open_rw_create(&path)?;

        let mut lines = Vec::new();
        for line in BufReader::new(file).lines() {
            lines.push(line?);
        }
        Ok(lines)
    }

    /// Append lines to the user's transaction log. The new content is
    /// produced in `tx.tmp.data` (a copy of the current log plus the new
    /// lines) and renamed over `tx.data`; the temp file is closed before
    /// the rename.
    pub fn append(&self, user: &User, lines: &[String]) -> Result<()> {
        let dir = self.user_path(&user.org, &user.key);
        let path = dir.join(TX_FILE);
        let temp = dir.join(TX_TEMP_FILE);

        let mut file = if path.exists() {
            fs::copy(&path, &temp)?;
            OpenOptions::new().append(true).open(&temp)?
        } else {
            open_rw_create(&temp)?
        };

        for line in lines {
            file.write_all(line.as_bytes())?;
            file.write_all(b"\n")?;
        }
        file.sync_all()?;
        drop(file);

        fs::rename(&temp, &path)?;
        Ok(())
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path)?;
    set_dir_mode(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn open_rw_create(path: &Path) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o600)
        .open(path)?)
}

#[cfg(not(unix))]
fn open_rw_create(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn new_repo() -> (TempDir, Repository) {
        let temp = TempDir::new().unwrap();
        let repo = Repository::create(temp.path()).unwrap();
        (temp, repo)
    }

    #[test]
    fn create_writes_defaults() {
        let (temp, repo) = new_repo();
        assert!(temp.path().join("orgs").is_dir());

        let config = Config::load(temp.path().join("config")).unwrap();
        assert_eq!(config.get("trust"), Some("strict"));
        assert_eq!(config.get_usize("queue.size").unwrap(), Some(10));
        assert_eq!(config.get_usize("request.limit").unwrap(), Some(1_048_576));
        assert_eq!(config.get_bool("confirmation").unwrap(), Some(true));
        assert_eq!(repo.config().get("trust"), Some("strict"));
    }

    #[test]
    fn create_refuses_non_empty_and_missing_roots() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("leftover"), "x").unwrap();
        assert!(Repository::create(temp.path()).is_err());

        assert!(Repository::create(temp.path().join("nope")).is_err());
    }

    #[test]
    fn open_requires_the_layout() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(
            Repository::open(temp.path()),
            Err(Error::NotARepo(_))
        ));

        let (_temp, repo) = new_repo();
        let reopened = Repository::open(repo.root()).unwrap();
        assert_eq!(reopened.config().get("trust"), Some("strict"));
    }

    #[test]
    fn new_org_validates_names() {
        let (_temp, repo) = new_repo();
        repo.new_org("Public").unwrap();

        assert!(matches!(repo.new_org("Public"), Err(Error::OrgExists(_))));
        assert!(repo.new_org("bad/name").is_err());
        assert!(repo.new_org("bad\\name").is_err());
        assert!(repo.new_org("").is_err());
    }

    #[test]
    fn add_user_generates_a_key_and_rejects_duplicates() {
        let (_temp, repo) = new_repo();
        repo.new_org("Public").unwrap();

        let user = repo.add_user("Public", "alice").unwrap();
        assert_eq!(user.org, "Public");
        assert!(Uuid::parse_str(&user.key).is_ok());

        assert!(matches!(
            repo.add_user("Public", "alice"),
            Err(Error::UserExists(_))
        ));

        // Same display name in another org is fine.
        repo.new_org("Private").unwrap();
        repo.add_user("Private", "alice").unwrap();
    }

    #[test]
    fn authenticate_resolves_the_triple() {
        let (_temp, repo) = new_repo();
        repo.new_org("Public").unwrap();
        let user = repo.add_user("Public", "alice").unwrap();

        let found = repo.authenticate("Public", "alice", &user.key).unwrap();
        assert_eq!(found, user);

        assert!(matches!(
            repo.authenticate("Nope", "alice", &user.key),
            Err(Error::InvalidOrg)
        ));
        assert!(matches!(
            repo.authenticate("Public", "bob", &user.key),
            Err(Error::InvalidCredentials)
        ));
        assert!(matches!(
            repo.authenticate("Public", "alice", "wrong-key"),
            Err(Error::InvalidCredentials)
        ));
    }

    #[test]
    fn malformed_user_config_is_skipped() {
        let (temp, repo) = new_repo();
        repo.new_org("Public").unwrap();
        repo.add_user("Public", "alice").unwrap();

        let broken = temp
            .path()
            .join("orgs/Public/users/not-a-real-user");
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("config"), "no separator here\n").unwrap();

        let org = repo.get_org("Public").unwrap();
        assert_eq!(org.users.len(), 1);
        assert_eq!(org.users[0].name, "alice");
    }

    #[test]
    fn read_creates_an_empty_log() {
        let (temp, repo) = new_repo();
        repo.new_org("Public").unwrap();
        let user = repo.add_user("Public", "alice").unwrap();

        assert_eq!(repo.read(&user).unwrap(), Vec::<String>::new());
        assert!(temp
            .path()
            .join(format!("orgs/Public/users/{}/tx.data", user.key))
            .is_file());
    }

    #[test]
    fn append_grows_the_log_atomically() {
        let (temp, repo) = new_repo();
        repo.new_org("Public").unwrap();
        let user = repo.add_user("Public", "alice").unwrap();

        repo.append(&user, &["{\"uuid\":\"1\"}".into(), "key-1".into()])
            .unwrap();
        repo.append(&user, &["{\"uuid\":\"2\"}".into(), "key-2".into()])
            .unwrap();

        let lines = repo.read(&user).unwrap();
        assert_eq!(
            lines,
            vec![
                "{\"uuid\":\"1\"}".to_string(),
                "key-1".to_string(),
                "{\"uuid\":\"2\"}".to_string(),
                "key-2".to_string(),
            ]
        );

        // The temp file only exists during an append.
        assert!(!temp
            .path()
            .join(format!("orgs/Public/users/{}/tx.tmp.data", user.key))
            .exists());
    }

    #[test]
    fn orgs_enumerates_the_tree() {
        let (_temp, repo) = new_repo();
        repo.new_org("B-org").unwrap();
        repo.new_org("A-org").unwrap();
        repo.add_user("A-org", "alice").unwrap();

        let orgs = repo.orgs().unwrap();
        assert_eq!(orgs.len(), 2);
        assert_eq!(orgs[0].name, "A-org");
        assert_eq!(orgs[0].users.len(), 1);
        assert_eq!(orgs[1].name, "B-org");
        assert!(orgs[1].users.is_empty());
    }
}
