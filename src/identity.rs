use std::sync::RwLock;

/// Source of the signed-in user.
pub trait IdentityProvider: Send + Sync {
    /// `None` while nobody is signed in.
    fn current_user_id(&self) -> Option<String>;
}

/// Identity held in memory and switched by sign-in/sign-out.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    user: RwLock<Option<String>>,
}

impl SessionIdentity {
    pub fn new(user_id: Option<String>) -> Self {
        Self {
            user: RwLock::new(user_id.filter(|u| !u.trim().is_empty())),
        }
    }

    pub fn signed_in(user_id: &str) -> Self {
        Self::new(Some(user_id.to_string()))
    }

    pub fn sign_in(&self, user_id: &str) {
        *self.user.write().unwrap() = Some(user_id.to_string());
    }

    pub fn sign_out(&self) {
        *self.user.write().unwrap() = None;
    }
}

impl IdentityProvider for SessionIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.user.read().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_in_and_out() {
        let identity = SessionIdentity::new(Some("  ".to_string()));
        assert!(identity.current_user_id().is_none());

        identity.sign_in("u1");
        assert_eq!(identity.current_user_id().as_deref(), Some("u1"));

        identity.sign_out();
        assert!(identity.current_user_id().is_none());
    }
}
