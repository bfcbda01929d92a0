//! Throughput Benchmark for kvgate
//!
//! Measures the hot paths every forwarded command goes through: descriptor
//! hashing, pool lookup, token resolution, and RESP parsing.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use kvgate::backend::{
    BackendConnection, BackendError, ConnectionFactory, ConnectionHandle, GroupStats,
};
use kvgate::protocol::{RespParser, RespValue};
use kvgate::session::{
    ConnectionDescriptor, ConnectionPool, MemoryTokenStore, PoolTimeouts, PoolTuning,
    SessionService, TargetSpec, TokenRequest, TokenStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

/// Backend that answers without touching the network.
struct NullConnection(String);

#[async_trait]
impl BackendConnection for NullConnection {
    fn address(&self) -> String {
        self.0.clone()
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn execute(&self, _command: RespValue) -> Result<RespValue, BackendError> {
        Ok(RespValue::ok())
    }

    async fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn stats(&self) -> GroupStats {
        GroupStats::default()
    }
}

struct NullFactory;

#[async_trait]
impl ConnectionFactory for NullFactory {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<ConnectionHandle, BackendError> {
        Ok(Arc::new(NullConnection(descriptor.address())))
    }
}

fn null_pool() -> ConnectionPool {
    ConnectionPool::new(Arc::new(NullFactory), PoolTimeouts::default())
}

/// Benchmark descriptor identity hashing
fn bench_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity");
    group.throughput(Throughput::Elements(1));

    let descriptor = ConnectionDescriptor::new("cache.internal", 6379)
        .with_credential("s3cret")
        .with_namespace(4);

    group.bench_function("sha256_digest", |b| {
        b.iter(|| black_box(descriptor.identity()));
    });

    group.bench_function("digest_hex", |b| {
        let identity = descriptor.identity();
        b.iter(|| black_box(identity.to_hex()));
    });

    group.finish();
}

/// Benchmark pool lookups for existing and new targets
fn bench_pool(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");

    let mut group = c.benchmark_group("pool");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_existing", |b| {
        let pool = null_pool();
        let descriptor = ConnectionDescriptor::new("cache.internal", 6379);
        rt.block_on(pool.get(&descriptor)).expect("warm");

        b.iter(|| black_box(rt.block_on(pool.get(&descriptor)).is_ok()));
    });

    group.bench_function("get_new_target", |b| {
        let pool = null_pool();
        let mut db = 0i64;
        b.iter(|| {
            let descriptor = ConnectionDescriptor::new("cache.internal", 6379).with_namespace(db);
            black_box(rt.block_on(pool.get(&descriptor)).is_ok());
            db += 1;
        });
    });

    group.finish();
}

/// Benchmark request resolution through the session service
fn bench_session(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let session = SessionService::new(
        null_pool(),
        Arc::new(MemoryTokenStore::without_reaper()),
        PoolTuning::default(),
    );

    let target = TargetSpec::new("cache.internal:6379").with_password("pw");
    let issued = rt
        .block_on(session.issue_token(&target, Duration::from_secs(3600)))
        .expect("issue");
    let token = TokenRequest::new(issued.token.clone());

    let mut group = c.benchmark_group("session");
    group.throughput(Throughput::Elements(1));

    group.bench_function("direct_request", |b| {
        b.iter(|| black_box(rt.block_on(session.get_connection(&target)).is_ok()));
    });

    group.bench_function("token_request", |b| {
        b.iter(|| black_box(rt.block_on(session.get_connection(&token)).is_ok()));
    });

    group.bench_function("token_lookup", |b| {
        let tokens = session.tokens();
        b.iter(|| black_box(rt.block_on(tokens.get(&issued.token)).is_ok()));
    });

    group.finish();
}

/// Benchmark RESP parsing of forwarded commands
fn bench_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Elements(1));

    let set = RespValue::command(["SET", "user:1001", "some moderately sized value"]).serialize();

    group.bench_function("set_command", |b| {
        let parser = RespParser::new();
        b.iter(|| black_box(parser.parse(&set).is_ok()));
    });

    group.bench_function("inline_ping", |b| {
        let parser = RespParser::new();
        b.iter(|| black_box(parser.parse(b"PING\r\n").is_ok()));
    });

    group.finish();
}

criterion_group!(benches, bench_identity, bench_pool, bench_session, bench_parse);

criterion_main!(benches);
