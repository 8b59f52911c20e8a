//! Identity and device binding gateway for AI agent memory.
//!
//! memgate sits in front of an external memory engine. It resolves every caller
//! (email or OAuth login, API key, session, or an anonymous device known only by
//! a MAC address or endpoint URL) to one owning account and a scoped
//! application, serves a small set of memory tools over WebSocket and MCP stdio,
//! and meters each call against a billing-cycle quota.
//!
//! # Architecture
//!
//! - **Storage**: SQLite; uniqueness constraints decide device ownership and
//!   account registration races, so several gateway processes can share one database
//! - **Transports**: WebSocket at `/gateway/ws`, MCP over stdio, REST for account
//!   and device management
//! - **Engine**: pluggable [`engine::MemoryEngine`] (in-process or HTTP)
//!
//! # Modules
//!
//! - [`config`]: Layered TOML configuration with environment overrides
//! - [`db`]: Connection setup, schema, versioned migrations, health report
//! - [`identity`]: Accounts, login, verification codes, API keys and sessions
//! - [`binding`]: Device/endpoint binding store
//! - [`scope`]: Application scope resolution
//! - [`memory`]: Memory references and lifecycle state
//! - [`engine`]: External memory engine collaborator
//! - [`usage`]: Access log, billing cycles and quota
//! - [`gateway`]: Per-connection state machine, tool dispatch, WebSocket transport
//! - [`tools`]: MCP tool surface
//! - [`api`]: REST surface

pub mod api;
pub mod binding;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod memory;
pub mod scope;
pub mod server;
pub mod tools;
pub mod usage;
