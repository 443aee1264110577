// src/directory.rs
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::model::UserProfile;

/// Lookup of user employment data (FTE fraction, role). The engine treats
/// this as read-only reference data owned by the host system.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn get_user(&self, user_id: &str) -> Option<UserProfile>;

    /// Every known user id; drives the background reconciliation sweep.
    async fn user_ids(&self) -> Vec<String>;
}

/// Directory loaded once from a JSON file mapping user id to profile:
/// `{ "u1": { "fte": 1.0, "role": "manager" }, ... }`
pub struct FileUserDirectory {
    users: HashMap<String, UserProfile>,
}

impl FileUserDirectory {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json_string = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read users file {:?}: {}", path, e))?;
        let users: HashMap<String, UserProfile> = serde_json::from_str(&json_string)
            .map_err(|e| anyhow::anyhow!("Failed to parse users file {:?}: {}", path, e))?;
        info!("Loaded {} users from {:?}", users.len(), path);
        Ok(Self { users })
    }

    pub fn from_users(users: HashMap<String, UserProfile>) -> Self {
        Self { users }
    }

    /// Empty directory; every lookup misses and scheduled hours fall back
    /// to the standard day.
    pub fn empty() -> Self {
        warn!("User directory is empty; schedules fall back to the standard day");
        Self {
            users: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }
}

#[async_trait]
impl UserDirectory for FileUserDirectory {
    async fn get_user(&self, user_id: &str) -> Option<UserProfile> {
        self.users.get(user_id).cloned()
    }

    async fn user_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.users.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod directory_tests {
    use super::*;
    use crate::model::Role;
    use std::fs;

    #[tokio::test]
    async fn lookups_hit_and_miss() {
        let mut users = HashMap::new();
        users.insert(
            "u1".to_string(),
            UserProfile {
                fte: 1.0,
                role: Role::Manager,
            },
        );
        let directory = FileUserDirectory::from_users(users);

        let profile = directory.get_user("u1").await.expect("present");
        assert_eq!(profile.role, Role::Manager);
        assert!(directory.get_user("nobody").await.is_none());
        assert_eq!(directory.user_ids().await, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn loads_users_from_json_file() {
        let path = std::env::temp_dir().join("toilbank_directory_test_users.json");
        fs::write(
            &path,
            r#"{
                "alice": { "fte": 1.0, "role": "manager" },
                "bob": { "fte": 0.5, "role": "team-member" }
            }"#,
        )
        .expect("write users file");

        let directory = FileUserDirectory::load(&path).expect("load");
        assert_eq!(directory.len(), 2);
        let bob = directory.get_user("bob").await.expect("present");
        assert_eq!(bob.fte, 0.5);
        assert_eq!(bob.role, Role::TeamMember);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn load_fails_on_missing_file() {
        let result = FileUserDirectory::load("/definitely/not/a/real/path.json");
        assert!(result.is_err());
    }
}
