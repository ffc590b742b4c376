//! JWT claims and participant roles.

use serde::{Deserialize, Serialize};

/// Participant role.
///
/// The wire form is the uppercase tag (`"NURSE"`, `"PATIENT"`, `"ADMIN"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    /// Home-visit nurse.
    #[serde(alias = "nurse")]
    Nurse,
    /// Patient requesting visits.
    #[serde(alias = "patient")]
    Patient,
    /// Platform administrator.
    #[serde(alias = "admin")]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Nurse => "NURSE",
            Role::Patient => "PATIENT",
            Role::Admin => "ADMIN",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nurse" => Ok(Role::Nurse),
            "patient" => Ok(Role::Patient),
            "admin" => Ok(Role::Admin),
            _ => Err(format!("unknown role: {}", s)),
        }
    }
}

/// JWT claims structure.
///
/// The chat gateway needs `sub`, `name` and a recognised role. Claims not
/// listed here are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,

    /// Expiration time (as Unix timestamp).
    pub exp: i64,

    /// Issued at (as Unix timestamp).
    #[serde(default)]
    pub iat: Option<i64>,

    /// User's display name.
    #[serde(default)]
    pub name: Option<String>,

    /// User's roles.
    #[serde(default)]
    pub roles: Vec<String>,

    /// Custom role claim (alternative to roles array).
    #[serde(default)]
    pub role: Option<String>,
}

impl Claims {
    /// The first recognised role, checking `role` before `roles`.
    ///
    /// Returns `None` when no claim names a known role. Unlike a plain user
    /// directory there is no default: an unroled token cannot chat.
    pub fn effective_role(&self) -> Option<Role> {
        self.role
            .iter()
            .chain(self.roles.iter())
            .find_map(|r| r.parse::<Role>().ok())
    }

    /// Check if the user has admin role.
    pub fn is_admin(&self) -> bool {
        self.effective_role() == Some(Role::Admin)
    }

    /// Non-empty display name, if the token carries one.
    pub fn display_name(&self) -> Option<&str> {
        self.name.as_deref().map(str::trim).filter(|n| !n.is_empty())
    }
}
