use std::fmt::{self, Debug, Display, Formatter};

/// Identifies a logical MySQL endpoint.
///
/// Two connections with equal keys are interchangeable from the point of
/// view of a pool: same server, same schema, same credentials. Equality and
/// hashing cover every field, including the password.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl ConnectionKey {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    /// The key that results from a successful `COM_CHANGE_USER` on a
    /// connection opened with `self`.
    pub(crate) fn with_user(
        &self,
        user: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port,
            database: database.into(),
            user: user.into(),
            password: password.into(),
        }
    }
}

impl Display for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{} (user {})",
            self.host, self.port, self.database, self.user
        )
    }
}

// The password never appears in diagnostics.
impl Debug for ConnectionKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionKey")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
