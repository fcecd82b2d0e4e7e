use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::PgWireResult;

/// Login user that gets the back-office role.
pub const ADMIN_USER: &str = "admin";

/// What a connection may do, decided by its login user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Back office: every command.
    Admin,
    /// Booking wizard: read the public catalog, book by email.
    Public,
}

impl Role {
    pub fn for_user(user: Option<&str>) -> Role {
        match user {
            Some(ADMIN_USER) => Role::Admin,
            _ => Role::Public,
        }
    }
}

/// Cleartext password source with one password per role.
#[derive(Debug)]
pub struct SpabookAuthSource {
    admin_password: String,
    booking_password: String,
}

impl SpabookAuthSource {
    pub fn new(admin_password: String, booking_password: String) -> Self {
        Self {
            admin_password,
            booking_password,
        }
    }

    fn password_for(&self, role: Role) -> &str {
        match role {
            Role::Admin => &self.admin_password,
            Role::Public => &self.booking_password,
        }
    }
}

#[async_trait]
impl AuthSource for SpabookAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let role = Role::for_user(login.user());
        Ok(Password::new(None, self.password_for(role).as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_admin_user_is_admin() {
        assert_eq!(Role::for_user(Some("admin")), Role::Admin);
        assert_eq!(Role::for_user(Some("Admin")), Role::Public);
        assert_eq!(Role::for_user(Some("booking")), Role::Public);
        assert_eq!(Role::for_user(None), Role::Public);
    }

    #[test]
    fn password_follows_role() {
        let source = SpabookAuthSource::new("root-pw".into(), "book-pw".into());
        assert_eq!(source.password_for(Role::Admin), "root-pw");
        assert_eq!(source.password_for(Role::Public), "book-pw");
    }
}
