//! RFID tags (authorization cards)

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagStatus {
    Activated,
    Blocked,
}

impl fmt::Display for TagStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Activated => write!(f, "Activated"),
            Self::Blocked => write!(f, "Blocked"),
        }
    }
}

impl From<&str> for TagStatus {
    fn from(s: &str) -> Self {
        if s.eq_ignore_ascii_case("blocked") {
            Self::Blocked
        } else {
            Self::Activated
        }
    }
}

/// A tag. Members of the same `parent_id_tag` group may stop each other's
/// sessions.
#[derive(Debug, Clone)]
pub struct Tag {
    /// Stored uppercase; chargers are inconsistent about casing.
    pub id_tag: String,
    pub user_name: Option<String>,
    pub parent_id_tag: Option<String>,
    pub description: Option<String>,
    pub status: TagStatus,
    pub priority: Option<i32>,
}

impl Tag {
    pub fn new(
        id_tag: impl Into<String>,
        user_name: Option<String>,
        parent_id_tag: Option<String>,
        description: Option<String>,
        status: TagStatus,
        priority: Option<i32>,
    ) -> Self {
        Self {
            id_tag: id_tag.into().to_uppercase(),
            user_name,
            parent_id_tag,
            description,
            status,
            priority,
        }
    }
}
