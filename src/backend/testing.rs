//! In-process RESP server for tests.
//!
//! Understands just enough of the protocol to exercise the client side:
//! `PING`, `ECHO`, `AUTH`, `SELECT`, `SET`, `GET`, `DEL` and `QUIT`. Keys are
//! kept per database so `SELECT` is observable.

use crate::protocol::{RespParser, RespValue};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Default)]
struct Shared {
    password: Option<String>,
    silent: bool,
    accepted: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
    data: Mutex<HashMap<(i64, Bytes), Bytes>>,
}

pub(crate) struct FakeBackend {
    addr: SocketAddr,
    shared: Arc<Shared>,
    task: JoinHandle<()>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        Self::spawn(Shared::default()).await
    }

    pub async fn with_password(password: &str) -> Self {
        Self::spawn(Shared {
            password: Some(password.to_string()),
            ..Shared::default()
        })
        .await
    }

    /// Accepts connections and reads from them but never replies.
    pub async fn silent() -> Self {
        Self::spawn(Shared {
            silent: true,
            ..Shared::default()
        })
        .await
    }

    /// An address nothing is listening on.
    pub async fn unused_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn spawn(shared: Shared) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(shared);

        let accept_shared = Arc::clone(&shared);
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, Arc::clone(&accept_shared)));
            }
        });

        Self { addr, shared, task }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of TCP connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Every command received, in arrival order, excluding `PING`.
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.shared.commands.lock().clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, shared: Arc<Shared>) {
    let parser = RespParser::new();
    let mut buffer = BytesMut::with_capacity(1024);
    let mut authed = shared.password.is_none();
    let mut db: i64 = 0;

    loop {
        match socket.read_buf(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        if shared.silent {
            buffer.clear();
            continue;
        }

        while let Ok(Some((value, consumed))) = parser.parse(&buffer) {
            buffer.advance(consumed);
            let args: Vec<Bytes> = value
                .into_array()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|v| v.as_bytes().map(Bytes::copy_from_slice))
                .collect();
            let (reply, quit) = respond(&shared, &args, &mut authed, &mut db);
            if socket.write_all(&reply.serialize()).await.is_err() || quit {
                return;
            }
        }
    }
}

fn respond(shared: &Shared, args: &[Bytes], authed: &mut bool, db: &mut i64) -> (RespValue, bool) {
    let Some(name) = args.first() else {
        return (RespValue::error("ERR empty command"), false);
    };
    let name = String::from_utf8_lossy(name).to_uppercase();
    let text = |i: usize| String::from_utf8_lossy(&args[i]).to_string();

    if name != "PING" {
        shared
            .commands
            .lock()
            .push(std::iter::once(name.clone()).chain((1..args.len()).map(text)).collect());
    }

    if name == "AUTH" {
        let ok = args.len() == 2 && shared.password.as_deref() == Some(text(1).as_str());
        if ok {
            *authed = true;
            return (RespValue::ok(), false);
        }
        return (
            RespValue::error("WRONGPASS invalid username-password pair"),
            false,
        );
    }
    if !*authed {
        return (RespValue::error("NOAUTH Authentication required."), false);
    }

    let reply = match (name.as_str(), args.len()) {
        ("PING", 1) => RespValue::pong(),
        ("PING", 2) | ("ECHO", 2) => RespValue::bulk_string(args[1].clone()),
        ("QUIT", _) => return (RespValue::ok(), true),
        ("SELECT", 2) => match text(1).parse::<i64>() {
            Ok(n) if (0..16).contains(&n) => {
                *db = n;
                RespValue::ok()
            }
            _ => RespValue::error("ERR DB index is out of range"),
        },
        ("SET", 3) => {
            shared
                .data
                .lock()
                .insert((*db, args[1].clone()), args[2].clone());
            RespValue::ok()
        }
        ("GET", 2) => match shared.data.lock().get(&(*db, args[1].clone())) {
            Some(v) => RespValue::bulk_string(v.clone()),
            None => RespValue::null(),
        },
        ("DEL", n) if n > 1 => {
            let mut data = shared.data.lock();
            let removed = args[1..]
                .iter()
                .filter(|k| data.remove(&(*db, (*k).clone())).is_some())
                .count();
            RespValue::integer(removed as i64)
        }
        _ => RespValue::error(format!("ERR unknown command '{}'", name)),
    };
    (reply, false)
}
