//! Gateway Command Handling
//!
//! Each client connection owns one [`CommandHandler`]. Gateway commands are
//! answered locally; everything else is forwarded to the backend the
//! connection is bound to.
//!
//! ## Gateway Commands
//!
//! - `PING [message]` - answered locally
//! - `QUIT` - close the connection
//! - `CONNECT addr [password] [db]` - bind to a backend target
//! - `AUTH token` - bind to a previously issued token
//! - `TOKEN.ISSUE addr [password] [db] [ttl]` - mint a token
//! - `TOKEN.REFRESH token [ttl]` - extend a token, returns the new expiry
//! - `TOKEN.REVOKE token` - delete a token
//! - `TOKEN.VALIDATE token` - `1` if the token is usable, else `0`
//! - `TOKEN.LIST` - redacted summary of every stored token, as JSON
//! - `GATEWAY.STATS` - pool, token and gateway counters as JSON
//! - `GATEWAY.HEALTH` - probe every pool entry, as JSON
//!
//! A `ttl` of zero or less means the store default. A `ttl` above
//! [`MAX_TOKEN_TTL`] is refused with `-INVALIDTTL`.
//!
//! Binding is checked lazily: every forwarded command resolves the binding
//! again, so a revoked or expired token stops working on the next command.

use crate::gateway::handler::GatewayStats;
use crate::protocol::RespValue;
use crate::session::token::{unix_seconds, MAX_TOKEN_TTL};
use crate::session::{
    ConnectionRequest, SessionError, SessionService, TargetSpec, TokenRequest,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Commands that change per-connection server state. Backend connections
/// are shared between clients, so these cannot be forwarded.
const CONNECTION_STATE_COMMANDS: &[&str] = &[
    "SELECT",
    "MULTI",
    "EXEC",
    "DISCARD",
    "WATCH",
    "UNWATCH",
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "MONITOR",
    "CLIENT",
    "RESET",
    "HELLO",
];

/// What a client connection is currently bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    Direct(TargetSpec),
    Token(TokenRequest),
}

impl Binding {
    pub fn request(&self) -> &dyn ConnectionRequest {
        match self {
            Binding::Direct(target) => target,
            Binding::Token(token) => token,
        }
    }
}

#[derive(Serialize)]
struct StatsReport {
    session: crate::session::SessionStats,
    gateway: crate::gateway::handler::GatewayStatsSnapshot,
}

/// Per-connection command dispatcher.
pub struct CommandHandler {
    session: Arc<SessionService>,
    stats: Arc<GatewayStats>,
    binding: Option<Binding>,
}

impl CommandHandler {
    pub fn new(session: Arc<SessionService>, stats: Arc<GatewayStats>) -> Self {
        Self {
            session,
            stats,
            binding: None,
        }
    }

    pub fn binding(&self) -> Option<&Binding> {
        self.binding.as_ref()
    }

    /// Executes a command and returns the reply for the client.
    pub async fn execute(&mut self, command: RespValue) -> RespValue {
        let args = match command {
            RespValue::Array(args) => args,
            _ => return RespValue::error("ERR invalid command format"),
        };
        if args.is_empty() {
            return RespValue::error("ERR empty command");
        }

        let cmd_name = match args[0].as_str() {
            Some(name) => name.to_uppercase(),
            None => return RespValue::error("ERR invalid command name"),
        };

        match cmd_name.as_str() {
            "PING" => cmd_ping(&args[1..]),
            "QUIT" => RespValue::ok(),
            "CONNECT" => self.cmd_connect(&args[1..]).await,
            "AUTH" => self.cmd_auth(&args[1..]).await,
            "TOKEN.ISSUE" => self.cmd_token_issue(&args[1..]).await,
            "TOKEN.REFRESH" => self.cmd_token_refresh(&args[1..]).await,
            "TOKEN.REVOKE" => self.cmd_token_revoke(&args[1..]).await,
            "TOKEN.VALIDATE" => self.cmd_token_validate(&args[1..]).await,
            "TOKEN.LIST" => to_json(&self.session.list_tokens().await),
            "GATEWAY.STATS" => self.cmd_gateway_stats().await,
            "GATEWAY.HEALTH" => self.cmd_gateway_health().await,
            name if CONNECTION_STATE_COMMANDS.contains(&name) => RespValue::error(format!(
                "ERR '{}' is not supported through the gateway",
                name
            )),
            _ => self.forward(RespValue::Array(args)).await,
        }
    }

    async fn forward(&self, command: RespValue) -> RespValue {
        let Some(binding) = &self.binding else {
            return RespValue::error("NOAUTH use CONNECT or AUTH first");
        };

        let handle = match self.session.get_connection(binding.request()).await {
            Ok(handle) => handle,
            Err(e) => return session_error(&e),
        };

        self.stats.command_forwarded();
        match handle.execute(command).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(backend = %handle.address(), error = %e, "Forwarding failed");
                RespValue::error(format!("UNREACHABLE {}", e))
            }
        }
    }

    /// CONNECT addr [password] [db]
    async fn cmd_connect(&mut self, args: &[RespValue]) -> RespValue {
        let target = match parse_target(args, 3, "CONNECT") {
            Ok((target, _)) => target,
            Err(reply) => return reply,
        };

        match self.session.get_connection(&target).await {
            Ok(_) => {
                self.binding = Some(Binding::Direct(target));
                RespValue::ok()
            }
            Err(e) => session_error(&e),
        }
    }

    /// AUTH token
    async fn cmd_auth(&mut self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_args("AUTH");
        }
        let request = match args[0].as_str() {
            Some(token) => TokenRequest::new(token),
            None => return RespValue::error("ERR invalid token"),
        };

        match self.session.get_connection(&request).await {
            Ok(_) => {
                self.binding = Some(Binding::Token(request));
                RespValue::ok()
            }
            Err(e) => session_error(&e),
        }
    }

    /// TOKEN.ISSUE addr [password] [db] [ttl]
    async fn cmd_token_issue(&self, args: &[RespValue]) -> RespValue {
        let (target, ttl) = match parse_target(args, 4, "TOKEN.ISSUE") {
            Ok(parsed) => parsed,
            Err(reply) => return reply,
        };

        match self.session.issue_token(&target, ttl).await {
            Ok(issued) => RespValue::array(vec![
                RespValue::bulk_string(issued.token.clone()),
                RespValue::integer(issued.expires_at_unix() as i64),
                RespValue::bulk_string(issued.conn_id),
            ]),
            Err(e) => session_error(&e),
        }
    }

    /// TOKEN.REFRESH token [ttl]
    async fn cmd_token_refresh(&self, args: &[RespValue]) -> RespValue {
        if args.is_empty() || args.len() > 2 {
            return wrong_args("TOKEN.REFRESH");
        }
        let Some(token) = args[0].as_str() else {
            return RespValue::error("ERR invalid token");
        };
        let ttl = match args.get(1).map(parse_ttl).transpose() {
            Ok(ttl) => ttl.unwrap_or(Duration::ZERO),
            Err(reply) => return reply,
        };

        match self.session.refresh_token(token, ttl).await {
            Ok(expires_at) => RespValue::integer(unix_seconds(expires_at) as i64),
            Err(e) => session_error(&e),
        }
    }

    /// TOKEN.REVOKE token
    async fn cmd_token_revoke(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_args("TOKEN.REVOKE");
        }
        let Some(token) = args[0].as_str() else {
            return RespValue::error("ERR invalid token");
        };

        match self.session.revoke_token(token).await {
            Ok(()) => RespValue::ok(),
            Err(e) => session_error(&e),
        }
    }

    /// TOKEN.VALIDATE token
    async fn cmd_token_validate(&self, args: &[RespValue]) -> RespValue {
        if args.len() != 1 {
            return wrong_args("TOKEN.VALIDATE");
        }
        let valid = match args[0].as_str() {
            Some(token) => self.session.validate_token(token).await,
            None => false,
        };
        RespValue::integer(valid as i64)
    }

    async fn cmd_gateway_stats(&self) -> RespValue {
        let report = StatsReport {
            session: self.session.stats().await,
            gateway: self.stats.snapshot(),
        };
        to_json(&report)
    }

    async fn cmd_gateway_health(&self) -> RespValue {
        to_json(&self.session.health_check().await)
    }
}

/// PING [message]
fn cmd_ping(args: &[RespValue]) -> RespValue {
    match args.first().and_then(RespValue::as_bytes) {
        Some(msg) => RespValue::bulk_string(bytes::Bytes::copy_from_slice(msg)),
        None => RespValue::pong(),
    }
}

/// Reads `addr [password] [db] [ttl]`, accepting at most `max` arguments.
fn parse_target(
    args: &[RespValue],
    max: usize,
    cmd: &str,
) -> Result<(TargetSpec, Duration), RespValue> {
    if args.is_empty() || args.len() > max {
        return Err(wrong_args(cmd));
    }

    let addr = args[0]
        .as_str()
        .ok_or_else(|| RespValue::error("ERR invalid address"))?;
    let mut target = TargetSpec::new(addr);

    if let Some(password) = args.get(1) {
        let password = password
            .as_str()
            .ok_or_else(|| RespValue::error("ERR invalid password"))?;
        target = target.with_password(password);
    }
    if let Some(db) = args.get(2) {
        let db = db
            .as_integer()
            .ok_or_else(|| RespValue::error("ERR db is not an integer"))?;
        target = target.with_db(db);
    }
    let ttl = match args.get(3) {
        Some(ttl) => parse_ttl(ttl)?,
        None => Duration::ZERO,
    };

    Ok((target, ttl))
}

/// Seconds; zero or negative selects the default.
fn parse_ttl(value: &RespValue) -> Result<Duration, RespValue> {
    let seconds = value
        .as_integer()
        .ok_or_else(|| RespValue::error("ERR ttl is not an integer"))?;
    let ttl = Duration::from_secs(seconds.max(0) as u64);
    if ttl > MAX_TOKEN_TTL {
        return Err(session_error(&SessionError::InvalidTtl {
            ttl,
            max: MAX_TOKEN_TTL,
        }));
    }
    Ok(ttl)
}

fn wrong_args(cmd: &str) -> RespValue {
    RespValue::error(format!(
        "ERR wrong number of arguments for '{}' command",
        cmd
    ))
}

/// `-<CODE> <message>`
fn session_error(e: &SessionError) -> RespValue {
    RespValue::error(format!("{} {}", e.code(), e))
}

fn to_json<T: Serialize>(value: &T) -> RespValue {
    match serde_json::to_string(value) {
        Ok(json) => RespValue::bulk_string(json),
        Err(e) => RespValue::error(format!("ERR {}", e)),
    }
}
