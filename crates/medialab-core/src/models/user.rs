//! User and balance models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User account with its balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,

    /// Chat identity, unique per user
    pub external_id: String,

    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    pub is_premium: bool,

    /// Every operation is free while set
    pub has_free_access: bool,

    /// Remaining free operation credits
    pub free_operations_left: i32,

    /// Balance in minor units, never negative
    pub balance: i64,

    pub last_activity_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Display name used in logs and notifications
    pub fn display_name(&self) -> String {
        match (&self.username, &self.first_name) {
            (Some(username), _) => format!("@{}", username),
            (None, Some(first)) => first.clone(),
            (None, None) => self.external_id.clone(),
        }
    }

    pub fn can_afford(&self, price: i64) -> bool {
        self.balance >= price
    }
}

/// Mutable profile fields supplied on every contact with a user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub external_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub language_code: Option<String>,
    #[serde(default)]
    pub is_premium: bool,
}

impl UserProfile {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        let now = Utc::now();
        User {
            id: 1,
            external_id: "42".to_string(),
            username: None,
            first_name: Some("Ada".to_string()),
            last_name: None,
            language_code: Some("en".to_string()),
            is_premium: false,
            has_free_access: false,
            free_operations_left: 0,
            balance: 100,
            last_activity_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_display_name() {
        let mut u = user();
        assert_eq!(u.display_name(), "Ada");
        u.username = Some("ada".to_string());
        assert_eq!(u.display_name(), "@ada");
    }

    #[test]
    fn test_can_afford() {
        let u = user();
        assert!(u.can_afford(100));
        assert!(!u.can_afford(101));
    }
}
