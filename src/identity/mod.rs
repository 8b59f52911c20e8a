//! Identity resolution: turns a raw caller credential into one account.
//!
//! Storage primitives live in the submodules and take a `&Connection`;
//! [`IdentityService`] is the async facade used by the REST and streaming
//! surfaces, adding the external collaborators (OAuth verification, code delivery).

pub mod accounts;
pub mod api_keys;
pub mod verification;

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;

pub use accounts::{Account, LoginType, Registration};
pub use verification::{Captcha, CaptchaAnswer, CodePurpose};

use crate::binding::{self, DeviceId};
use crate::config::AuthConfig;
use crate::db::{self, Db};
use crate::error::{AuthError, GatewayError, Result};

pub(crate) fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

/// Everything a caller can present to prove who they are.
#[derive(Debug, Clone)]
pub enum Credential {
    EmailCode { email: String, code: String },
    EmailPassword { email: String, password: String },
    /// Token from an OAuth-style provider; verified by an [`IdentityVerifier`].
    OAuth { provider: LoginType, token: String },
    ApiKey(String),
    Session(String),
    /// An anonymous device, resolved through its binding.
    Device(DeviceId),
}

/// A verified external identity.
#[derive(Debug, Clone)]
pub struct ExternalIdentity {
    pub subject: String,
    pub display_name: Option<String>,
}

/// Verifies provider tokens. The handshake itself happens elsewhere.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, provider: LoginType, token: &str) -> Result<ExternalIdentity>;
}

/// Verifier used when no provider is configured: every token is rejected.
pub struct RejectAllVerifier;

#[async_trait]
impl IdentityVerifier for RejectAllVerifier {
    async fn verify(&self, provider: LoginType, _token: &str) -> Result<ExternalIdentity> {
        tracing::debug!(provider = %provider, "no identity verifier configured");
        Err(AuthError::InvalidCredential.into())
    }
}

/// Delivers verification codes (email, SMS, ...).
#[async_trait]
pub trait CodeSender: Send + Sync {
    async fn send(&self, login_id: &str, purpose: CodePurpose, code: &str) -> Result<()>;
}

/// Development sender: writes the code to the log instead of delivering it.
pub struct LogCodeSender;

#[async_trait]
impl CodeSender for LogCodeSender {
    async fn send(&self, login_id: &str, purpose: CodePurpose, code: &str) -> Result<()> {
        tracing::info!(login_id = %login_id, purpose = %purpose, code = %code, "verification code (log delivery)");
        Ok(())
    }
}

/// Result of a successful interactive login.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub account: Account,
    pub session_token: String,
    /// `true` if the login registered the account.
    pub created: bool,
}

#[derive(Clone)]
pub struct IdentityService {
    db: Db,
    config: AuthConfig,
    verifier: Arc<dyn IdentityVerifier>,
    sender: Arc<dyn CodeSender>,
}

impl IdentityService {
    pub fn new(db: Db, config: AuthConfig) -> Self {
        Self {
            db,
            config,
            verifier: Arc::new(RejectAllVerifier),
            sender: Arc::new(LogCodeSender),
        }
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn IdentityVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_code_sender(mut self, sender: Arc<dyn CodeSender>) -> Self {
        self.sender = sender;
        self
    }

    /// `resolve(credential) -> Account | AuthError`.
    pub async fn resolve(&self, credential: Credential) -> Result<Account> {
        Ok(self.authenticate(credential).await?.account)
    }

    /// Resolve an interactive credential, register on first sight where allowed,
    /// stamp `last_login_at` and start a session.
    pub async fn login(&self, credential: Credential) -> Result<LoginOutcome> {
        let registration = self.authenticate(credential).await?;
        let ttl = self.config.session_ttl_days;
        let account_id = registration.account.id.clone();
        let token = db::run(&self.db, move |conn| {
            let now = Utc::now();
            accounts::touch_last_login(conn, &account_id, now)?;
            api_keys::create_session(conn, &account_id, ttl, now)
        })
        .await?;

        tracing::info!(account = %registration.account.id, created = registration.created, "login");
        Ok(LoginOutcome {
            account: registration.account,
            session_token: token,
            created: registration.created,
        })
    }

    async fn authenticate(&self, credential: Credential) -> Result<Registration> {
        let config = self.config.clone();
        match credential {
            Credential::EmailCode { email, code } => {
                let email = LoginType::Email.normalize(&email)?;
                db::run(&self.db, move |conn| {
                    let now = Utc::now();
                    verification::verify_code(conn, &email, &code, &[CodePurpose::Login], &config, now)?;
                    let reg = accounts::upsert_account(conn, LoginType::Email, &email, None, now)?;
                    accounts::touch_last_login(conn, &reg.account.id, now)?;
                    Ok(reg)
                })
                .await
            }
            Credential::EmailPassword { email, password } => {
                db::run(&self.db, move |conn| {
                    let account = accounts::check_password(conn, &email, &password)?;
                    accounts::touch_last_login(conn, &account.id, Utc::now())?;
                    Ok(Registration {
                        account,
                        created: false,
                    })
                })
                .await
            }
            Credential::OAuth { provider, token } => {
                if !provider.is_oauth() {
                    return Err(GatewayError::Validation(format!(
                        "{provider} is not an external identity provider"
                    )));
                }
                let identity = self.verifier.verify(provider, &token).await?;
                db::run(&self.db, move |conn| {
                    let now = Utc::now();
                    let reg = accounts::upsert_account(
                        conn,
                        provider,
                        &identity.subject,
                        identity.display_name.as_deref(),
                        now,
                    )?;
                    accounts::touch_last_login(conn, &reg.account.id, now)?;
                    Ok(reg)
                })
                .await
            }
            Credential::ApiKey(key) => {
                db::run(&self.db, move |conn| {
                    let account = api_keys::resolve_api_key(conn, &key, Utc::now())?;
                    Ok(Registration {
                        account,
                        created: false,
                    })
                })
                .await
            }
            Credential::Session(token) => {
                db::run(&self.db, move |conn| {
                    let account = api_keys::resolve_session(conn, &token, Utc::now())?;
                    Ok(Registration {
                        account,
                        created: false,
                    })
                })
                .await
            }
            Credential::Device(device) => {
                db::run(&self.db, move |conn| {
                    let app = binding::resolve_owner(conn, &device).map_err(|e| match e {
                        GatewayError::NotBound(_) => GatewayError::Auth(AuthError::UnboundDevice),
                        other => other,
                    })?;
                    let account = accounts::get_account(conn, &app.account_id)?
                        .ok_or(AuthError::AccountNotFound)?;
                    Ok(Registration {
                        account,
                        created: false,
                    })
                })
                .await
            }
        }
    }

    /// Issue and deliver a verification code. Password purposes need a solved CAPTCHA.
    pub async fn send_code(
        &self,
        email: &str,
        purpose: CodePurpose,
        captcha: Option<CaptchaAnswer>,
    ) -> Result<()> {
        let login_id = LoginType::Email.normalize(email)?;
        let config = self.config.clone();
        let target = login_id.clone();
        let code = db::run(&self.db, move |conn| {
            let now = Utc::now();
            if purpose.requires_captcha() {
                let answer = captcha.ok_or(AuthError::CaptchaRequired)?;
                verification::solve_captcha(conn, &answer, now)?;
            }
            verification::issue_code(conn, &target, purpose, &config, now)
        })
        .await?;

        self.sender.send(&login_id, purpose, &code).await
    }

    pub async fn issue_captcha(&self) -> Result<Captcha> {
        let config = self.config.clone();
        db::run(&self.db, move |conn| {
            verification::issue_captcha(conn, &config, Utc::now())
        })
        .await
    }

    /// Set or reset the password of an existing email account.
    pub async fn set_password(&self, email: &str, code: &str, new_password: &str) -> Result<()> {
        let email = LoginType::Email.normalize(email)?;
        if new_password.chars().count() < accounts::MIN_PASSWORD_LEN {
            return Err(GatewayError::Validation(format!(
                "password must be at least {} characters",
                accounts::MIN_PASSWORD_LEN
            )));
        }
        let (code, new_password) = (code.to_string(), new_password.to_string());
        let config = self.config.clone();
        db::run(&self.db, move |conn| {
            let now = Utc::now();
            let account = accounts::find_by_login(conn, LoginType::Email, &email)?
                .ok_or(AuthError::AccountNotFound)?;
            verification::verify_code(
                conn,
                &email,
                &code,
                &[CodePurpose::SetPassword, CodePurpose::ResetPassword],
                &config,
                now,
            )?;
            accounts::set_password_hash(conn, &account.id, &new_password)?;
            tracing::info!(account = %account.id, "password updated");
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_is_hex() {
        let digest = sha256_hex("abc");
        assert_eq!(digest.len(), 64);
        assert!(digest.starts_with("ba7816bf"));
    }
}
