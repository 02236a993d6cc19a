use serde::Deserialize;

/// A username/password pair for the target database.
///
/// When credentials come from a federated identity provider the username may
/// carry a provider prefix such as `okta:alice`; [`DbCredentials::login_name`]
/// strips it for statements that need the bare database user.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DbCredentials {
    pub username: String,
    pub password: String,
}

impl DbCredentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The database-level user name, without any identity provider prefix.
    pub fn login_name(&self) -> &str {
        match self.username.split_once(':') {
            Some((_, name)) => name,
            None => &self.username,
        }
    }
}
