//! Distribution, transport, and serialization behavior.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tern_codec::{encode_key, Value};
use tern_error::Result;
use tern_expr::{AggBinding, AggOp, Aggregate, Binding, CompareOp, Expr, IsOp, OrderPart};
use tern_mill::{CollectSink, Context, QuerySink, RowSink};
use tern_plan::env::Runner;
use tern_plan::input::Input;
use tern_plan::ir::Step;
use tern_plan::mem::{MemEnv, MemRunner};
use tern_plan::transport::{duplex, serve, Conn, PipeConn};
use tern_plan::{
    lower, lower_split, run, Client, ExecParams, Geometry, Transport, Tree,
};

fn sample_rows(n: i64) -> Vec<Value> {
    (0..n)
        .map(|i| {
            Value::struct_of([
                ("id", Value::Int(i)),
                ("grp", Value::String(format!("g{}", i % 7))),
                ("fare", Value::Float((i % 13) as f64 + 0.5)),
            ])
        })
        .collect()
}

fn big_env() -> MemEnv {
    let env = MemEnv::new();
    // Many small blocks so hash-splitting scatters work across peers.
    env.add_table_with_blocks("events", sample_rows(500), 8);
    env
}

fn run_tree(tree: &Tree, env: &MemEnv) -> Vec<Value> {
    let ep = ExecParams::new(env.runner()).with_parallel(4);
    let collect = CollectSink::new();
    run(tree, Arc::new(collect.clone()), &ep).unwrap();
    collect.rows()
}

fn sorted_keys(rows: &[Value]) -> Vec<Vec<u8>> {
    let mut keys: Vec<Vec<u8>> = rows
        .iter()
        .map(|r| encode_key(std::slice::from_ref(r)))
        .collect();
    keys.sort();
    keys
}

/// Local and split execution must produce the same row multiset.
fn assert_split_equivalent(trace: &Step, env: &MemEnv, peers: usize) {
    let local = lower(trace, env).unwrap();
    let local_rows = run_tree(&local, env);

    let geometry = Geometry::local(peers, None);
    let split = lower_split(trace, env, &geometry).unwrap();
    let split_rows = run_tree(&split, env);

    assert_eq!(
        sorted_keys(&local_rows),
        sorted_keys(&split_rows),
        "split execution diverged for {} peers",
        peers
    );
}

#[test]
fn split_count_star_matches_local() {
    let env = big_env();
    let trace = Step::iter_table(Expr::path("events")).aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Count, Expr::Star),
            "count",
        )],
        vec![],
    );
    for peers in [1, 2, 3, 7] {
        assert_split_equivalent(&trace, &env, peers);
    }
}

#[test]
fn split_grouped_aggregates_match_local() {
    let env = big_env();
    let trace = Step::iter_table(Expr::path("events")).aggregate(
        vec![
            AggBinding::new(Aggregate::new(AggOp::Avg, Expr::path("fare")), "avg"),
            AggBinding::new(Aggregate::new(AggOp::Sum, Expr::path("id")), "sum"),
            AggBinding::new(Aggregate::new(AggOp::Min, Expr::path("id")), "min"),
            AggBinding::new(Aggregate::new(AggOp::Max, Expr::path("id")), "max"),
            AggBinding::new(Aggregate::new(AggOp::Count, Expr::path("fare")), "n"),
        ],
        vec![Binding::new(Expr::path("grp"), "grp")],
    );
    assert_split_equivalent(&trace, &env, 3);
}

#[test]
fn split_stddev_and_approx_distinct_match_local() {
    let env = big_env();
    let trace = Step::iter_table(Expr::path("events")).aggregate(
        vec![
            AggBinding::new(
                Aggregate::new(AggOp::ApproxCountDistinct, Expr::path("id")),
                "acd",
            ),
            AggBinding::new(
                Aggregate::new(AggOp::StdDevPop, Expr::path("fare")),
                "sd",
            ),
        ],
        vec![],
    );
    let local = lower(&trace, &env).unwrap();
    let local_rows = run_tree(&local, &env);
    let geometry = Geometry::local(4, None);
    let split = lower_split(&trace, &env, &geometry).unwrap();
    let split_rows = run_tree(&split, &env);

    // The sketch merges losslessly, so even the approximate count agrees.
    assert_eq!(local_rows[0].field("acd"), split_rows[0].field("acd"));
    let (a, b) = (
        local_rows[0].field("sd").as_f64().unwrap(),
        split_rows[0].field("sd").as_f64().unwrap(),
    );
    assert!((a - b).abs() < 1e-9, "stddev diverged: {a} vs {b}");
}

#[test]
fn split_distinct_and_order_match_local() {
    let env = big_env();
    let trace = Step::iter_table(Expr::path("events"))
        .distinct(vec![Expr::path("grp")])
        .order(vec![OrderPart {
            expr: Expr::path("grp"),
            desc: false,
            nulls_last: false,
        }]);
    // Ordered output must agree exactly, not just as a multiset.
    let local = run_tree(&lower(&trace, &env).unwrap(), &env);
    let geometry = Geometry::local(3, None);
    let split = run_tree(&lower_split(&trace, &env, &geometry).unwrap(), &env);
    assert_eq!(local, split);
}

#[test]
fn split_tree_roundtrips_through_serialization() {
    let env = big_env();
    let trace = Step::iter_table_filtered(
        Expr::path("events"),
        Expr::compare(CompareOp::Ge, Expr::path("id"), Expr::integer(100)),
    )
    .aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Avg, Expr::path("fare")),
            "avg",
        )],
        vec![Binding::new(Expr::path("grp"), "grp")],
    );
    let geometry = Geometry::local(2, Some(2));
    let tree = lower_split(&trace, &env, &geometry).unwrap();
    let decoded = Tree::decode(&tree.encode()).unwrap();
    similar_asserts::assert_eq!(decoded.to_string(), tree.to_string());
    assert_eq!(decoded, tree);

    // The decoded plan executes identically.
    assert_eq!(
        sorted_keys(&run_tree(&tree, &env)),
        sorted_keys(&run_tree(&decoded, &env))
    );
}

#[test]
fn filter_pushdown_observed_once_in_planning_and_execution() {
    let env = MemEnv::new();
    env.add_table("t", sample_rows(50));
    let pred = Expr::Is(Box::new(Expr::path("X")), IsOp::Missing);
    let trace = Step::iter_table_filtered(Expr::path("t"), pred.clone());
    let tree = lower(&trace, &env).unwrap();
    assert_eq!(env.filter_observations(), vec![pred.to_string()]);

    // Execute a decoded copy: the scan-time hook observes the hint once
    // more.
    let decoded = Tree::decode(&tree.encode()).unwrap();
    let _ = run_tree(&decoded, &env);
    assert_eq!(
        env.filter_observations(),
        vec![pred.to_string(), pred.to_string()]
    );
}

/// Dial helper: hands out the connection once.
fn one_shot(conn: PipeConn) -> impl Fn() -> Result<Arc<dyn Conn>> + Send + Sync {
    let slot = Mutex::new(Some(Arc::new(conn) as Arc<dyn Conn>));
    move || {
        slot.lock()
            .take()
            .ok_or_else(|| tern_error::TernError::new("connection already used"))
    }
}

fn spawn_server(env: Arc<MemEnv>) -> (PipeConn, std::thread::JoinHandle<Result<()>>) {
    let (client_end, server_end) = duplex();
    let handle = std::thread::spawn(move || {
        let ep = ExecParams::new(env.runner()).with_parallel(2);
        serve(Arc::new(server_end), &ep)
    });
    (client_end, handle)
}

#[test]
fn client_streams_rows_and_stats() {
    let env = Arc::new(big_env());
    let trace = Step::iter_table(Expr::path("events")).filter(Expr::compare(
        CompareOp::Lt,
        Expr::path("id"),
        Expr::integer(10),
    ));
    let tree = lower(&trace, env.as_ref()).unwrap();

    let (conn, server) = spawn_server(env.clone());
    let client = Client::new(one_shot(conn));
    let ep = ExecParams::new(env.runner());
    let collect = CollectSink::new();
    client
        .exec(&tree, &ep, Arc::new(collect.clone()))
        .unwrap();
    assert_eq!(collect.len(), 10);
    // FIN folded the server's stats into ours.
    assert_eq!(ep.stats.rows_out(), 10);
    assert!(ep.stats.scanned_bytes() > 0);
    server.join().unwrap().unwrap();
}

#[test]
fn remote_errors_carry_the_server_message() {
    let env = Arc::new(big_env());
    let tree = lower(
        &Step::iter_table(Expr::path("events")),
        env.as_ref(),
    )
    .unwrap();

    // The server executes against an empty store, so every scan fails.
    let empty = Arc::new(MemEnv::new());
    let (conn, server) = spawn_server(empty);
    let client = Client::new(one_shot(conn));
    let ep = ExecParams::new(env.runner());
    let err = client
        .exec(&tree, &ep, Arc::new(CollectSink::new()))
        .unwrap_err();
    let msg = err.to_string();
    assert!(msg.starts_with("remote error: "), "got: {msg}");
    assert!(msg.contains("no object at"), "got: {msg}");
    assert!(server.join().unwrap().is_err());
}

/// Runner that stalls after the first descriptor until cancelled.
struct StallingRunner {
    inner: Arc<MemRunner>,
    stalled: Arc<std::sync::atomic::AtomicBool>,
}

impl Runner for StallingRunner {
    fn run(&self, dst: &dyn QuerySink, input: &Input, ep: &ExecParams) -> Result<()> {
        self.inner.run(dst, input, ep)?;
        self.stalled
            .store(true, std::sync::atomic::Ordering::SeqCst);
        // Wait for cancellation; a cancelled context is the only way out.
        while !ep.ctx.wait_timeout(Duration::from_millis(10)) {}
        ep.ctx.check()
    }
}

#[test]
fn cancellation_tears_down_client_and_server() {
    let env = Arc::new(big_env());
    let trace = Step::iter_table(Expr::path("events"));
    let tree = lower(&trace, env.as_ref()).unwrap();

    let stalled = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let (client_end, server_end) = duplex();
    let server = {
        let env = env.clone();
        let stalled = stalled.clone();
        std::thread::spawn(move || {
            let runner = Arc::new(StallingRunner {
                inner: env.runner(),
                stalled,
            });
            let ep = ExecParams::new(runner).with_parallel(1);
            serve(Arc::new(server_end), &ep)
        })
    };

    let ctx = Context::new();
    let ep = ExecParams::new(env.runner()).with_context(ctx.clone());

    // Cancel as soon as the first rows arrive.
    struct CancelOnFirstWrite {
        ctx: Context,
        inner: CollectSink,
    }
    impl QuerySink for CancelOnFirstWrite {
        fn open(&self) -> Result<Box<dyn RowSink>> {
            Ok(Box::new(CancelWriter {
                ctx: self.ctx.clone(),
                inner: self.inner.open()?,
            }))
        }
        fn close(&self) -> Result<()> {
            self.inner.close()
        }
    }
    struct CancelWriter {
        ctx: Context,
        inner: Box<dyn RowSink>,
    }
    impl RowSink for CancelWriter {
        fn write_rows(&mut self, rows: Vec<Value>) -> Result<()> {
            self.inner.write_rows(rows)?;
            self.ctx.cancel();
            Ok(())
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
    }

    let collect = CollectSink::new();
    let client = Client::new(one_shot(client_end));
    let err = client
        .exec(
            &tree,
            &ep,
            Arc::new(CancelOnFirstWrite {
                ctx: ctx.clone(),
                inner: collect.clone(),
            }),
        )
        .unwrap_err();
    assert!(err.is_cancelled(), "got: {err}");

    // The server observed the pipe closing and unwound in bounded time.
    let server_result = server.join().unwrap();
    assert!(server_result.is_err());
    assert!(stalled.load(std::sync::atomic::Ordering::SeqCst));
}

/// A transport that speaks the wire protocol to an in-process server
/// thread, one connection per query.
#[derive(Debug)]
struct PipePeer {
    env: Arc<MemEnv>,
}

impl Transport for PipePeer {
    fn exec(&self, tree: &Tree, ep: &ExecParams, dst: Arc<dyn QuerySink>) -> Result<()> {
        let (client_end, server_end) = duplex();
        let env = self.env.clone();
        let server = std::thread::spawn(move || {
            let sep = ExecParams::new(env.runner()).with_parallel(2);
            serve(Arc::new(server_end), &sep)
        });
        let client = Client::new(one_shot(client_end));
        let result = client.exec(tree, ep, dst);
        let _ = server.join();
        result
    }

    fn encode(&self) -> Value {
        Value::struct_of([("type", Value::String("pipe-test".to_string()))])
    }
}

#[test]
fn union_map_over_wire_peers_matches_local() {
    let env = Arc::new(big_env());
    let trace = Step::iter_table(Expr::path("events")).aggregate(
        vec![
            AggBinding::new(Aggregate::new(AggOp::Avg, Expr::path("fare")), "avg"),
            AggBinding::new(Aggregate::new(AggOp::Count, Expr::Star), "count"),
        ],
        vec![Binding::new(Expr::path("grp"), "grp")],
    );
    let local_rows = run_tree(&lower(&trace, env.as_ref()).unwrap(), &env);

    let peers: Vec<Arc<dyn Transport>> = (0..3)
        .map(|_| Arc::new(PipePeer { env: env.clone() }) as Arc<dyn Transport>)
        .collect();
    let geometry = Geometry::new(peers);
    let split = lower_split(&trace, env.as_ref(), &geometry).unwrap();
    let split_rows = run_tree(&split, &env);
    assert_eq!(sorted_keys(&local_rows), sorted_keys(&split_rows));
}

#[test]
fn peer_failure_aborts_siblings() {
    let env = Arc::new(big_env());
    let trace = Step::iter_table(Expr::path("events")).aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Count, Expr::Star),
            "count",
        )],
        vec![],
    );
    // One peer serves from an empty store and fails; the query surfaces the
    // failure instead of a partial result.
    let peers: Vec<Arc<dyn Transport>> = vec![
        Arc::new(PipePeer { env: env.clone() }),
        Arc::new(PipePeer {
            env: Arc::new(MemEnv::new()),
        }),
        Arc::new(PipePeer { env: env.clone() }),
    ];
    let geometry = Geometry::new(peers);
    let split = lower_split(&trace, env.as_ref(), &geometry).unwrap();
    let ep = ExecParams::new(env.runner()).with_parallel(4);
    let err = run(&split, Arc::new(CollectSink::new()), &ep).unwrap_err();
    assert!(err.to_string().contains("remote error"), "got: {err}");
}
