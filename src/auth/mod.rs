// vigil: Identity and permissions

pub mod password;
pub mod token;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};

pub use password::{hash_password, verify_password};
pub use token::{Claims, TokenIssuer};

/// Closed role set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

impl Role {
    pub fn parse(s: &str) -> Option<Role> {
        match s.to_ascii_lowercase().as_str() {
            "viewer" => Some(Role::Viewer),
            "operator" => Some(Role::Operator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Viewer => "viewer",
            Role::Operator => "operator",
            Role::Admin => "admin",
        }
    }

    /// Role permission sets are closed: viewer reads, operator additionally
    /// writes alerts and tasks, admin does everything
    pub fn allows(&self, permission: Permission) -> bool {
        match self {
            Role::Viewer => matches!(permission, Permission::Read),
            Role::Operator => matches!(
                permission,
                Permission::Read | Permission::WriteAlerts | Permission::WriteTasks
            ),
            Role::Admin => true,
        }
    }

    /// Forbidden unless the role allows the permission
    pub fn require(&self, permission: Permission) -> CoreResult<()> {
        if self.allows(permission) {
            Ok(())
        } else {
            Err(CoreError::Forbidden(format!(
                "{} may not {:?}",
                self.as_str(),
                permission
            )))
        }
    }
}

/// Privileged capabilities checked on every operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Read,
    WriteAlerts,
    WriteTasks,
    ManageUsers,
}

/// A service account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub email: String,
    pub role: Role,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// In-memory user store
pub struct UserStore {
    users: RwLock<HashMap<String, User>>,
}

impl UserStore {
    pub fn new() -> Self {
        Self {
            users: RwLock::new(HashMap::new()),
        }
    }

    /// Seed the admin account from configuration; no-op when it exists
    pub fn seed_admin(&self, username: &str, password: &str, email: &str) -> CoreResult<()> {
        if password.is_empty() {
            return Err(CoreError::NotConfigured(
                "admin password is not set".to_string(),
            ));
        }
        let mut users = self.users.write();
        if users.contains_key(username) {
            return Ok(());
        }
        users.insert(
            username.to_string(),
            User {
                username: username.to_string(),
                email: email.to_string(),
                role: Role::Admin,
                password_hash: hash_password(password)?,
                active: true,
                created_at: Utc::now(),
            },
        );
        info!(username, "Admin account seeded");
        Ok(())
    }

    /// Verify credentials; the error never reveals which factor failed
    pub fn authenticate(&self, username: &str, password: &str) -> CoreResult<User> {
        let denied = || CoreError::Unauthorized("invalid credentials".to_string());
        let user = self
            .users
            .read()
            .get(username)
            .cloned()
            .ok_or_else(denied)?;
        if !user.active {
            return Err(denied());
        }
        if !verify_password(password, &user.password_hash) {
            return Err(denied());
        }
        Ok(user)
    }

    pub fn create(
        &self,
        username: &str,
        email: &str,
        password: &str,
        role: Role,
    ) -> CoreResult<User> {
        if username.is_empty() || password.is_empty() {
            return Err(CoreError::InvalidInput(
                "username and password are required".to_string(),
            ));
        }
        let mut users = self.users.write();
        if users.contains_key(username) {
            return Err(CoreError::Conflict(format!(
                "user {} already exists",
                username
            )));
        }
        let user = User {
            username: username.to_string(),
            email: email.to_string(),
            role,
            password_hash: hash_password(password)?,
            active: true,
            created_at: Utc::now(),
        };
        users.insert(username.to_string(), user.clone());
        Ok(user)
    }

    pub fn update_password(&self, username: &str, password: &str) -> CoreResult<()> {
        if password.is_empty() {
            return Err(CoreError::InvalidInput("password is empty".to_string()));
        }
        let hash = hash_password(password)?;
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| CoreError::NotFound(format!("user {}", username)))?;
        user.password_hash = hash;
        Ok(())
    }

    pub fn deactivate(&self, username: &str) -> CoreResult<()> {
        let mut users = self.users.write();
        let user = users
            .get_mut(username)
            .ok_or_else(|| CoreError::NotFound(format!("user {}", username)))?;
        user.active = false;
        Ok(())
    }

    pub fn get(&self, username: &str) -> CoreResult<User> {
        self.users
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("user {}", username)))
    }

    pub fn list(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.read().values().cloned().collect();
        users.sort_by(|a, b| a.username.cmp(&b.username));
        users
    }
}

impl Default for UserStore {
    fn default() -> Self {
        Self::new()
    }
}
