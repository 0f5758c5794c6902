//! User credentials and their format rules.

use std::sync::OnceLock;

use regex::Regex;
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::session::descriptor::Role;

const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9._%-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,6}$";
const USERID_MIN: usize = 5;
const USERID_MAX: usize = 20;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 50;
const SECURITY_CODE_LEN: usize = 4;

fn email_pattern() -> Result<&'static Regex> {
    static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
    EMAIL
        .get_or_init(|| Regex::new(EMAIL_PATTERN).ok())
        .as_ref()
        .ok_or_else(|| Error::Config("userid pattern failed to compile".into()))
}

/// Validated `{userid, password, securityCode}` tuple.
///
/// Construction is the only validation point, so a `Credentials` value is
/// always well-formed. The password is zeroed on drop.
#[derive(Clone)]
pub struct Credentials {
    userid: String,
    password: Zeroizing<String>,
    security_code: Option<Zeroizing<String>>,
}

impl Credentials {
    pub fn new(
        userid: impl Into<String>,
        password: impl Into<String>,
        security_code: Option<&str>,
    ) -> Result<Self> {
        let userid = userid.into();
        let password = Zeroizing::new(password.into());
        validate_userid(&userid)?;
        validate_password(&password)?;
        if let Some(code) = security_code {
            validate_security_code(code)?;
        }
        Ok(Self {
            userid,
            password,
            security_code: security_code.map(|c| Zeroizing::new(c.to_string())),
        })
    }

    pub fn userid(&self) -> &str {
        &self.userid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn security_code(&self) -> Option<&str> {
        self.security_code.as_deref().map(String::as_str)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("userid", &self.userid)
            .finish_non_exhaustive()
    }
}

pub fn validate_userid(userid: &str) -> Result<()> {
    let len = userid.chars().count();
    if !(USERID_MIN..=USERID_MAX).contains(&len) {
        return Err(Error::Validation(format!(
            "userid must be {USERID_MIN} to {USERID_MAX} characters"
        )));
    }
    if !email_pattern()?.is_match(userid) {
        return Err(Error::Validation(
            "invalid userid, it must follow a valid email format".into(),
        ));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    let len = password.chars().count();
    if !(PASSWORD_MIN..=PASSWORD_MAX).contains(&len) {
        return Err(Error::Validation(format!(
            "password must be {PASSWORD_MIN} to {PASSWORD_MAX} characters"
        )));
    }
    let upper = password.chars().any(|c| c.is_ascii_uppercase());
    let lower = password.chars().any(|c| c.is_ascii_lowercase());
    let digit = password.chars().any(|c| c.is_ascii_digit());
    let symbol = password.chars().any(|c| !c.is_alphanumeric());
    if !(upper && lower && digit && symbol) {
        return Err(Error::Validation(
            "password needs an uppercase letter, a lowercase letter, a digit and a symbol".into(),
        ));
    }
    Ok(())
}

pub fn validate_security_code(code: &str) -> Result<()> {
    if code.chars().count() != SECURITY_CODE_LEN {
        return Err(Error::Validation(format!(
            "security code must be exactly {SECURITY_CODE_LEN} characters"
        )));
    }
    Ok(())
}

/// Supplies credentials when no stored token is available. Interactive
/// prompting lives outside this crate; implementations only need to return a
/// validated tuple.
pub trait CredentialSource: Send + Sync {
    fn credentials(&self, role: Role) -> Result<Credentials>;
}

/// Fixed credentials, e.g. read from the environment by an application.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(credentials: Credentials) -> Self {
        Self(credentials)
    }
}

impl CredentialSource for StaticCredentials {
    fn credentials(&self, _role: Role) -> Result<Credentials> {
        Ok(self.0.clone())
    }
}
