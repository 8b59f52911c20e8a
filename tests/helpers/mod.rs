#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use memgate::config::GatewayConfig;
use memgate::db::{self, Db};
use memgate::engine::local::LocalEngine;
use memgate::engine::MemoryEngine;
use memgate::error::Result;
use memgate::gateway::Gateway;
use memgate::identity::accounts::{self, LoginType};
use memgate::identity::{api_keys, Account, CodePurpose, CodeSender, IdentityService};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    db::migrations::run_migrations(&conn).unwrap();
    conn
}

/// Create (or fetch) an `auto` account with the given user id.
pub fn account(conn: &mut Connection, user_id: &str) -> Account {
    accounts::upsert_account(conn, LoginType::Auto, user_id, None, Utc::now())
        .unwrap()
        .account
}

/// Records delivered verification codes instead of sending them.
#[derive(Default)]
pub struct CapturingSender {
    sent: Mutex<Vec<(String, CodePurpose, String)>>,
}

impl CapturingSender {
    pub fn last_code(&self, login_id: &str) -> Option<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _, _)| id == login_id)
            .map(|(_, _, code)| code.clone())
    }
}

#[async_trait]
impl CodeSender for CapturingSender {
    async fn send(&self, login_id: &str, purpose: CodePurpose, code: &str) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((login_id.to_string(), purpose, code.to_string()));
        Ok(())
    }
}

/// Answer an arithmetic captcha prompt of the form "What is a + b?".
pub fn solve_prompt(prompt: &str) -> String {
    let digits: Vec<u32> = prompt
        .split(|c: char| !c.is_ascii_digit())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().unwrap())
        .collect();
    digits.iter().sum::<u32>().to_string()
}

/// A gateway over an in-memory database and the local engine.
pub struct TestGateway {
    pub gateway: Gateway,
    pub db: Db,
    pub engine: Arc<LocalEngine>,
    pub sender: Arc<CapturingSender>,
}

pub fn test_gateway(config: GatewayConfig) -> TestGateway {
    let db = db::shared(test_db());
    let engine = Arc::new(LocalEngine::new());
    let sender = Arc::new(CapturingSender::default());
    let identity = IdentityService::new(db.clone(), config.auth.clone())
        .with_code_sender(sender.clone());
    let gateway = Gateway::new(
        db.clone(),
        engine.clone() as Arc<dyn MemoryEngine>,
        identity,
        Arc::new(config),
    );
    TestGateway {
        gateway,
        db,
        engine,
        sender,
    }
}

impl TestGateway {
    /// Create an account and return it with a fresh API key.
    pub fn account_with_key(&self, user_id: &str) -> (Account, String) {
        let mut conn = self.db.lock().unwrap();
        let account = account(&mut conn, user_id);
        let (_, key) = api_keys::create_api_key(&conn, &account.id, Some("test"), Utc::now()).unwrap();
        (account, key)
    }

    pub fn access_log_count(&self) -> i64 {
        let conn = self.db.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM access_log", [], |row| row.get(0))
            .unwrap()
    }
}
