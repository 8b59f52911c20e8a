mod helpers;

use async_trait::async_trait;
use helpers::{solve_prompt, test_db, test_gateway, CapturingSender};
use memgate::config::{AuthConfig, GatewayConfig};
use memgate::db;
use memgate::error::{AuthError, GatewayError, Result};
use memgate::identity::{
    CaptchaAnswer, CodePurpose, Credential, ExternalIdentity, IdentityService, IdentityVerifier,
    LoginType,
};
use std::sync::Arc;

fn auth_code(err: &GatewayError) -> &'static str {
    err.code()
}

#[tokio::test]
async fn code_login_registers_on_first_sight() {
    let tg = test_gateway(GatewayConfig::default());
    let identity = tg.gateway.identity();

    identity
        .send_code("Alice@Example.com", CodePurpose::Login, None)
        .await
        .unwrap();
    let code = tg.sender.last_code("alice@example.com").unwrap();
    assert_eq!(code.len(), 6);

    let first = identity
        .login(Credential::EmailCode {
            email: "alice@example.com".into(),
            code,
        })
        .await
        .unwrap();
    assert!(first.created);
    assert_eq!(first.account.user_id, "alice@example.com");
    assert_eq!(first.account.display_name, "alice");

    // The session token resolves to the same account
    let resolved = identity
        .resolve(Credential::Session(first.session_token.clone()))
        .await
        .unwrap();
    assert_eq!(resolved.id, first.account.id);
}

#[tokio::test]
async fn code_is_single_use() {
    let tg = test_gateway(GatewayConfig::default());
    let identity = tg.gateway.identity();

    identity
        .send_code("bob@example.com", CodePurpose::Login, None)
        .await
        .unwrap();
    let code = tg.sender.last_code("bob@example.com").unwrap();

    let credential = Credential::EmailCode {
        email: "bob@example.com".into(),
        code,
    };
    identity.login(credential.clone()).await.unwrap();

    let err = identity.login(credential).await.unwrap_err();
    assert_eq!(auth_code(&err), "invalid_credential");
}

#[tokio::test]
async fn resend_is_rate_limited() {
    let tg = test_gateway(GatewayConfig::default());
    let identity = tg.gateway.identity();

    identity
        .send_code("carol@example.com", CodePurpose::Login, None)
        .await
        .unwrap();
    let err = identity
        .send_code("carol@example.com", CodePurpose::Login, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        GatewayError::Auth(AuthError::RateLimited { retry_after_secs }) if retry_after_secs > 0
    ));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn password_flow_requires_captcha() {
    let config = GatewayConfig {
        auth: AuthConfig {
            code_resend_secs: 0,
            ..AuthConfig::default()
        },
        ..GatewayConfig::default()
    };
    let tg = test_gateway(config);
    let identity = tg.gateway.identity();

    // Register through a code login first
    identity
        .send_code("dana@example.com", CodePurpose::Login, None)
        .await
        .unwrap();
    let code = tg.sender.last_code("dana@example.com").unwrap();
    identity
        .login(Credential::EmailCode {
            email: "dana@example.com".into(),
            code,
        })
        .await
        .unwrap();

    let err = identity
        .send_code("dana@example.com", CodePurpose::SetPassword, None)
        .await
        .unwrap_err();
    assert_eq!(auth_code(&err), "captcha_required");

    let captcha = identity.issue_captcha().await.unwrap();
    let answer = CaptchaAnswer {
        captcha_id: captcha.captcha_id.clone(),
        answer: solve_prompt(&captcha.prompt),
    };
    identity
        .send_code("dana@example.com", CodePurpose::SetPassword, Some(answer))
        .await
        .unwrap();
    let code = tg.sender.last_code("dana@example.com").unwrap();
    identity
        .set_password("dana@example.com", &code, "correct horse battery")
        .await
        .unwrap();

    let outcome = identity
        .login(Credential::EmailPassword {
            email: "dana@example.com".into(),
            password: "correct horse battery".into(),
        })
        .await
        .unwrap();
    assert!(!outcome.created);

    let err = identity
        .login(Credential::EmailPassword {
            email: "dana@example.com".into(),
            password: "wrong".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(auth_code(&err), "invalid_credential");
}

#[tokio::test]
async fn captcha_is_single_use() {
    let config = GatewayConfig {
        auth: AuthConfig {
            code_resend_secs: 0,
            ..AuthConfig::default()
        },
        ..GatewayConfig::default()
    };
    let tg = test_gateway(config);
    let identity = tg.gateway.identity();

    let captcha = identity.issue_captcha().await.unwrap();
    let answer = CaptchaAnswer {
        captcha_id: captcha.captcha_id.clone(),
        answer: solve_prompt(&captcha.prompt),
    };
    identity
        .send_code("erin@example.com", CodePurpose::ResetPassword, Some(answer.clone()))
        .await
        .unwrap();

    let err = identity
        .send_code("erin@example.com", CodePurpose::ResetPassword, Some(answer))
        .await
        .unwrap_err();
    assert_eq!(auth_code(&err), "captcha_required");
}

#[tokio::test]
async fn api_keys_resolve_until_revoked() {
    let tg = test_gateway(GatewayConfig::default());
    let (account, key) = tg.account_with_key("frank");

    let resolved = tg
        .gateway
        .identity()
        .resolve(Credential::ApiKey(key.clone()))
        .await
        .unwrap();
    assert_eq!(resolved.id, account.id);

    {
        let conn = tg.db.lock().unwrap();
        let keys = memgate::identity::api_keys::list_api_keys(&conn, &account.id).unwrap();
        assert_eq!(keys.len(), 1);
        assert!(key.starts_with(&keys[0].prefix));
        memgate::identity::api_keys::revoke_api_key(&conn, &account.id, &keys[0].id, chrono::Utc::now())
            .unwrap();
    }

    let err = tg
        .gateway
        .identity()
        .resolve(Credential::ApiKey(key))
        .await
        .unwrap_err();
    assert_eq!(auth_code(&err), "invalid_credential");

    let err = tg
        .gateway
        .identity()
        .resolve(Credential::Session("not-a-session".into()))
        .await
        .unwrap_err();
    assert!(err.is_auth());
}

/// Accepts any token and names the subject after it.
struct EchoVerifier;

#[async_trait]
impl IdentityVerifier for EchoVerifier {
    async fn verify(&self, _provider: LoginType, token: &str) -> Result<ExternalIdentity> {
        Ok(ExternalIdentity {
            subject: token.to_string(),
            display_name: Some("Octo".into()),
        })
    }
}

#[tokio::test]
async fn concurrent_first_logins_share_one_account() {
    let db = db::shared(test_db());
    let identity = IdentityService::new(db.clone(), AuthConfig::default())
        .with_verifier(Arc::new(EchoVerifier))
        .with_code_sender(Arc::new(CapturingSender::default()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let identity = identity.clone();
        handles.push(tokio::spawn(async move {
            identity
                .login(Credential::OAuth {
                    provider: LoginType::Github,
                    token: "octocat".into(),
                })
                .await
                .unwrap()
        }));
    }

    let mut ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.created {
            created += 1;
        }
        ids.push(outcome.account.id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(created, 1);

    let conn = db.lock().unwrap();
    let accounts: i64 = conn
        .query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))
        .unwrap();
    assert_eq!(accounts, 1);
}

#[tokio::test]
async fn oauth_without_verifier_is_rejected() {
    let tg = test_gateway(GatewayConfig::default());
    let err = tg
        .gateway
        .identity()
        .login(Credential::OAuth {
            provider: LoginType::Google,
            token: "anything".into(),
        })
        .await
        .unwrap_err();
    assert_eq!(auth_code(&err), "invalid_credential");
}
