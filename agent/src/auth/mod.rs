//! Current-user collaborator and control API authentication.

mod middleware;

pub use middleware::*;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// The signed-in user of this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }
}

/// Supplies the user every owner-scoped operation runs as.
pub trait Authenticator: Send + Sync {
    /// `None` when nobody is signed in.
    fn current_user(&self) -> Option<User>;
}

/// Session state that can change at runtime.
pub struct SessionAuth {
    tx: watch::Sender<Option<User>>,
}

impl SessionAuth {
    pub fn new(user: Option<User>) -> Self {
        let (tx, _rx) = watch::channel(user);
        Self { tx }
    }

    pub fn signed_in(user: User) -> Self {
        Self::new(Some(user))
    }

    pub fn sign_in(&self, user: User) {
        tracing::info!(user_id = %user.id, "User signed in");
        self.tx.send_replace(Some(user));
    }

    pub fn sign_out(&self) {
        if let Some(user) = self.tx.send_replace(None) {
            tracing::info!(user_id = %user.id, "User signed out");
        }
    }

    /// Watch sign-in changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.tx.subscribe()
    }
}

impl Authenticator for SessionAuth {
    fn current_user(&self) -> Option<User> {
        self.tx.borrow().clone()
    }
}
