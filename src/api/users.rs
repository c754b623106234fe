//! API users and roles
//!
//! Users live in users.csv with a SHA-256 of their login token (user id
//! and password concatenated). Roles are strictly ordered by capability.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::support::crypto::sha256_hex;
use crate::support::errors::ConfigError;

/// Capability levels, weakest first. Each level includes everything the
/// previous levels may do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Status,
    Analysis,
    SessionPriority,
    Tags,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "Status",
            Self::Analysis => "Analysis",
            Self::SessionPriority => "SessionPriority",
            Self::Tags => "Tags",
            Self::Admin => "Admin",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "Status" => Some(Self::Status),
            "Analysis" => Some(Self::Analysis),
            "SessionPriority" => Some(Self::SessionPriority),
            "Tags" => Some(Self::Tags),
            "Admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// The weakest role allowed to run `command`. Everything not listed
    /// is Admin-only.
    fn required_for(command: &str) -> Role {
        match command {
            "GetGroups" | "GetChargers" => Role::Status,
            "GetTags" | "GetSessions" | "DrawAll" => Role::Analysis,
            "SetChargePriority" => Role::SessionPriority,
            "CreateTag" | "UpdateTag" | "DeleteTag" => Role::Tags,
            _ => Role::Admin,
        }
    }

    pub fn allows(&self, command: &str) -> bool {
        *self >= Role::required_for(command)
    }
}

#[derive(Debug, Clone)]
pub struct User {
    pub user_id: String,
    pub role: Role,
    pub description: Option<String>,
    pub auth_sha: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct UserRow {
    user_id: String,
    user_type: String,
    description: Option<String>,
    auth_sha: String,
}

pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut users = HashMap::new();
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(path)
            .map_err(|e| ConfigError::Csv {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
        for row in reader.deserialize() {
            let row: UserRow = row.map_err(|e| ConfigError::Csv {
                path: path.display().to_string(),
                message: e.to_string(),
            })?;
            let role = Role::parse(&row.user_type).ok_or_else(|| ConfigError::Csv {
                path: path.display().to_string(),
                message: format!("unknown user_type '{}'", row.user_type),
            })?;
            users.insert(
                row.user_id.clone(),
                User {
                    user_id: row.user_id,
                    role,
                    description: row.description.filter(|s| !s.is_empty()),
                    auth_sha: row.auth_sha,
                },
            );
        }
        info!(path = %path.display(), count = users.len(), "Users loaded");
        Ok(Self {
            users: RwLock::new(users),
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), ConfigError> {
        let users = self.users.read().expect("user lock poisoned");
        let mut writer = csv::Writer::from_path(path).map_err(|e| ConfigError::Csv {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let mut sorted: Vec<&User> = users.values().collect();
        sorted.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        for user in sorted {
            writer
                .serialize(UserRow {
                    user_id: user.user_id.clone(),
                    user_type: user.role.as_str().to_string(),
                    description: user.description.clone(),
                    auth_sha: user.auth_sha.clone(),
                })
                .map_err(|e| ConfigError::Csv {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
        }
        writer.flush().map_err(|e| ConfigError::Csv {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }

    /// Match a login token against the stored hashes.
    pub fn check_auth(&self, token: &str) -> Option<(String, Role)> {
        let token_sha = sha256_hex(token);
        let users = self.users.read().expect("user lock poisoned");
        users
            .values()
            .find(|u| u.auth_sha == token_sha)
            .map(|u| (u.user_id.clone(), u.role))
    }

    pub fn create(&self, user_id: &str, password: &str, role: Role, description: Option<String>) -> bool {
        let mut users = self.users.write().expect("user lock poisoned");
        if users.contains_key(user_id) {
            return false;
        }
        users.insert(
            user_id.to_string(),
            User {
                user_id: user_id.to_string(),
                role,
                description,
                auth_sha: sha256_hex(&format!("{}{}", user_id, password)),
            },
        );
        true
    }

    pub fn update(
        &self,
        user_id: &str,
        password: Option<&str>,
        role: Option<Role>,
        description: Option<String>,
    ) -> bool {
        let mut users = self.users.write().expect("user lock poisoned");
        let Some(user) = users.get_mut(user_id) else {
            return false;
        };
        if let Some(password) = password {
            user.auth_sha = sha256_hex(&format!("{}{}", user_id, password));
        }
        if let Some(role) = role {
            user.role = role;
        }
        if let Some(description) = description {
            user.description = Some(description);
        }
        true
    }

    pub fn delete(&self, user_id: &str) -> bool {
        self.users
            .write()
            .expect("user lock poisoned")
            .remove(user_id)
            .is_some()
    }

    pub fn list(&self) -> Vec<User> {
        let users = self.users.read().expect("user lock poisoned");
        let mut list: Vec<User> = users.values().cloned().collect();
        list.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        list
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_is_strict() {
        assert!(Role::Admin > Role::Tags);
        assert!(Role::Tags > Role::SessionPriority);
        assert!(Role::SessionPriority > Role::Analysis);
        assert!(Role::Analysis > Role::Status);
    }

    #[test]
    fn role_gating() {
        assert!(Role::Status.allows("GetChargers"));
        assert!(!Role::Status.allows("GetSessions"));
        assert!(Role::Analysis.allows("DrawAll"));
        assert!(!Role::Analysis.allows("SetChargePriority"));
        assert!(Role::Tags.allows("DeleteTag"));
        assert!(!Role::Tags.allows("DeleteCharger"));
        assert!(Role::Admin.allows("ReloadGroups"));
        assert!(Role::Admin.allows("GetChargers"));
    }

    #[test]
    fn check_auth_matches_token_hash() {
        let store = UserStore::new();
        assert!(store.create("ops", "secret", Role::Admin, None));
        assert_eq!(
            store.check_auth("opssecret"),
            Some(("ops".to_string(), Role::Admin))
        );
        assert!(store.check_auth("opswrong").is_none());
    }

    #[test]
    fn create_duplicate_fails() {
        let store = UserStore::new();
        assert!(store.create("ops", "secret", Role::Admin, None));
        assert!(!store.create("ops", "other", Role::Status, None));
    }

    #[test]
    fn update_changes_password() {
        let store = UserStore::new();
        store.create("ops", "secret", Role::Admin, None);
        assert!(store.update("ops", Some("newpass"), None, None));
        assert!(store.check_auth("opssecret").is_none());
        assert!(store.check_auth("opsnewpass").is_some());
    }

    #[test]
    fn csv_roundtrip() {
        let dir = std::env::temp_dir().join("ampshare_users_test");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("users.csv");

        let store = UserStore::new();
        store.create("ops", "secret", Role::Admin, Some("on-call".into()));
        store.create("viewer", "pw", Role::Status, None);
        store.write(&path).unwrap();

        let reloaded = UserStore::load(&path).unwrap();
        assert_eq!(reloaded.list().len(), 2);
        assert!(reloaded.check_auth("opssecret").is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
