//! End-to-end execution over in-memory tables.

use std::sync::Arc;

use tern_codec::Value;
use tern_expr::{AggBinding, AggOp, Aggregate, Binding, Expr, IsOp, OrderPart};
use tern_mill::CollectSink;
use tern_plan::env::Env;
use tern_plan::ir::Step;
use tern_plan::mem::MemEnv;
use tern_plan::op::outpart::verify_index;
use tern_plan::op::{Explain, ExplainFormat};
use tern_plan::{lower, run, ExecParams, Tree};

fn parking_rows() -> Vec<Value> {
    // Ten citations; four have no Make recorded.
    let tickets: [u64; 10] = [
        1104803000, 1104820732, 4272473892, 1104774730, 1104805521, 1103341116, 1103700150,
        1104803000 + 7, 1106226590, 1107179581,
    ];
    let makes = [
        Some("HOND"),
        None,
        Some("FORD"),
        None,
        Some("CHEV"),
        Some("NISS"),
        None,
        Some("TOYT"),
        None,
        Some("BMW"),
    ];
    let colors = ["GY", "WH", "BG", "BK", "WH", "GY", "BG", "RD", "BL", "BK"];
    (0..10)
        .map(|i| {
            let mut fields = vec![
                ("Ticket".to_string(), Value::Uint(tickets[i])),
                ("Color".to_string(), Value::String(colors[i].to_string())),
            ];
            if let Some(make) = makes[i] {
                fields.insert(0, ("Make".to_string(), Value::String(make.to_string())));
            }
            Value::Struct(fields)
        })
        .collect()
}

fn taxi_rows() -> Vec<Value> {
    // Fares arranged so the per-vendor averages order VTS < CMT < DDS.
    let mut rows = Vec::new();
    for (vendor, fares) in [
        ("CMT", vec![8.0, 12.0, 10.0]),
        ("VTS", vec![4.0, 6.0]),
        ("DDS", vec![20.0, 24.0]),
    ] {
        for fare in fares {
            rows.push(Value::struct_of([
                ("VendorID", Value::String(vendor.to_string())),
                ("fare_amount", Value::Float(fare)),
            ]));
        }
    }
    rows
}

fn test_env() -> MemEnv {
    let env = MemEnv::new();
    env.add_table_with_blocks("parking", parking_rows(), 3);
    env.add_table("nyc_taxi", taxi_rows());
    env
}

fn run_plan(tree: &Tree, env: &MemEnv) -> Vec<Value> {
    let mut ep = ExecParams::new(env.runner()).with_parallel(4);
    if let Some(upload) = env.upload() {
        ep = ep.with_upload(upload);
    }
    let collect = CollectSink::new();
    run(tree, Arc::new(collect.clone()), &ep).unwrap();
    collect.rows()
}

fn run_trace(trace: &Step, env: &MemEnv) -> Vec<Value> {
    let tree = lower(trace, env).unwrap();
    run_plan(&tree, env)
}

#[test]
fn count_star_where_make_is_missing() {
    let env = test_env();
    let trace = Step::iter_table_filtered(
        Expr::path("parking"),
        Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing),
    )
    .aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Count, Expr::Star),
            "count",
        )],
        vec![],
    );
    let rows = run_trace(&trace, &env);
    assert_eq!(rows, vec![Value::struct_of([("count", Value::Uint(4))])]);
}

#[test]
fn grouped_avg_ordered_by_avg() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("nyc_taxi"))
        .aggregate(
            vec![AggBinding::new(
                Aggregate::new(AggOp::Avg, Expr::path("fare_amount")),
                "avg",
            )],
            vec![Binding::new(Expr::path("VendorID"), "VendorID")],
        )
        .order(vec![OrderPart {
            expr: Expr::path("avg"),
            desc: false,
            nulls_last: false,
        }]);
    let rows = run_trace(&trace, &env);
    let vendors: Vec<&str> = rows
        .iter()
        .map(|r| r.field("VendorID").as_str().unwrap())
        .collect();
    assert_eq!(vendors, vec!["VTS", "CMT", "DDS"]);
    assert_eq!(rows[0].field("avg"), &Value::Float(5.0));
    assert_eq!(rows[1].field("avg"), &Value::Float(10.0));
    assert_eq!(rows[2].field("avg"), &Value::Float(22.0));
}

#[test]
fn max_ticket() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("parking")).aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Max, Expr::path("Ticket")),
            "max",
        )],
        vec![],
    );
    let rows = run_trace(&trace, &env);
    assert_eq!(
        rows,
        vec![Value::struct_of([("max", Value::Uint(4272473892))])]
    );
}

#[test]
fn distinct_color_ordered() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("parking"))
        .distinct(vec![Expr::path("Color")])
        .order(vec![OrderPart {
            expr: Expr::path("Color"),
            desc: false,
            nulls_last: false,
        }]);
    let rows = run_trace(&trace, &env);
    let colors: Vec<&str> = rows
        .iter()
        .map(|r| r.field("Color").as_str().unwrap())
        .collect();
    assert_eq!(colors, vec!["BG", "BK", "BL", "GY", "RD", "WH"]);
}

#[test]
fn count_star_over_appended_tables() {
    let env = test_env();
    let table = Expr::Concat(
        Box::new(Expr::path("parking")),
        Box::new(Expr::path("nyc_taxi")),
    );
    let trace = Step::iter_table(table).aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Count, Expr::Star),
            "count",
        )],
        vec![],
    );
    let rows = run_trace(&trace, &env);
    assert_eq!(rows, vec![Value::struct_of([("count", Value::Uint(17))])]);
}

#[test]
fn order_by_ticket_limit_offset() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("parking"))
        .bind(vec![Binding::new(Expr::path("Ticket"), "Ticket")])
        .order(vec![OrderPart {
            expr: Expr::path("Ticket"),
            desc: false,
            nulls_last: false,
        }])
        .limit(2, 2);
    let rows = run_trace(&trace, &env);
    assert_eq!(
        rows,
        vec![
            Value::struct_of([("Ticket", Value::Uint(1104774730))]),
            Value::struct_of([("Ticket", Value::Uint(1104803000))]),
        ]
    );
}

#[test]
fn limit_without_order_stops_early() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("parking")).limit(3, 0);
    let rows = run_trace(&trace, &env);
    assert_eq!(rows.len(), 3);
}

#[test]
fn unnest_joins_list_elements() {
    let env = MemEnv::new();
    env.add_table(
        "docs",
        vec![
            Value::struct_of([
                ("id", Value::Int(1)),
                (
                    "tags",
                    Value::List(vec![
                        Value::String("red".to_string()),
                        Value::String("blue".to_string()),
                    ]),
                ),
            ]),
            Value::struct_of([("id", Value::Int(2))]),
        ],
    );
    let trace = Step::iter_table(Expr::path("docs"))
        .iter_value(Expr::path("tags"), "tag")
        .bind(vec![
            Binding::new(Expr::path("id"), "id"),
            Binding::new(Expr::path("tag"), "tag"),
        ]);
    let mut rows = run_trace(&trace, &env);
    rows.sort_by_key(|r| r.field("tag").as_str().unwrap_or("").to_string());
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].field("tag"), &Value::String("blue".to_string()));
    assert_eq!(rows[0].field("id"), &Value::Int(1));
}

#[test]
fn dummy_output_emits_one_empty_row() {
    let env = test_env();
    let rows = run_trace(&Step::DummyOutput, &env);
    assert_eq!(rows, vec![Value::Struct(Vec::new())]);

    let rows = run_trace(&Step::NoOutput, &env);
    assert!(rows.is_empty());
}

#[test]
fn grouped_count_over_partitioned_table() {
    let env = MemEnv::new();
    env.add_partitioned_table(
        "events",
        "region",
        vec![
            (
                Value::String("east".to_string()),
                (0..5)
                    .map(|i| Value::struct_of([("x", Value::Int(i))]))
                    .collect(),
            ),
            (
                Value::String("west".to_string()),
                (0..3)
                    .map(|i| Value::struct_of([("x", Value::Int(i))]))
                    .collect(),
            ),
        ],
    );
    let trace = Step::iter_table(Expr::path("events"))
        .aggregate(
            vec![AggBinding::new(
                Aggregate::new(AggOp::Count, Expr::Star),
                "count",
            )],
            vec![Binding::new(Expr::path("region"), "region")],
        )
        .order(vec![OrderPart {
            expr: Expr::path("region"),
            desc: false,
            nulls_last: false,
        }]);
    let rows = run_trace(&trace, &env);
    assert_eq!(
        rows,
        vec![
            Value::struct_of([
                ("count", Value::Uint(5)),
                ("region", Value::String("east".to_string())),
            ]),
            Value::struct_of([
                ("count", Value::Uint(3)),
                ("region", Value::String("west".to_string())),
            ]),
        ]
    );
}

#[test]
fn scalar_replacement_from_child_subtree() {
    let env = test_env();
    // Parent: tickets above the maximum taxi fare count; child computes a
    // scalar the parent's filter references.
    let parent = Step::iter_table(Expr::path("nyc_taxi")).filter(Expr::compare(
        tern_expr::CompareOp::Ge,
        Expr::path("fare_amount"),
        Expr::ScalarReplacement(0),
    ));
    let mut tree = lower(&parent, &env).unwrap();
    let child_trace = Step::iter_table(Expr::path("nyc_taxi")).aggregate(
        vec![AggBinding::new(
            Aggregate::new(AggOp::Max, Expr::path("fare_amount")),
            "max",
        )],
        vec![],
    );
    let child = lower(&child_trace, &env).unwrap();
    // Graft the child plan as replacement 0; inputs are compatible because
    // both plans scan the same table.
    tree.root.children.push(child.root);
    let rows = run_plan(&tree, &env);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].field("fare_amount"), &Value::Float(24.0));
}

#[test]
fn explain_renders_the_plan() {
    let env = test_env();
    let trace = Step::iter_table_filtered(
        Expr::path("parking"),
        Expr::Is(Box::new(Expr::path("Make")), IsOp::Missing),
    )
    .limit(5, 0);
    let inner = lower(&trace, &env).unwrap();
    let explain = Explain::plan(inner, ExplainFormat::Text, "SELECT ...");
    let rows = run_plan(&explain, &env);
    let lines: Vec<&str> = rows
        .iter()
        .map(|r| r.field("plan").as_str().unwrap())
        .collect();
    assert_eq!(
        lines,
        vec!["ITERATE INPUT(0)", "FILTER Make IS MISSING", "LIMIT 5"]
    );
}

#[test]
fn output_part_and_index_write_signed_objects() {
    let env = MemEnv::new().with_upload();
    env.add_table("src", parking_rows());
    let trace = Step::iter_table(Expr::path("src"))
        .output_part("part", "db/out")
        .output_index("citations", "index", "db/out");
    let tree = lower(&trace, &env).unwrap();

    let upload = env.upload().unwrap();
    let ep = ExecParams::new(env.runner())
        .with_parallel(2)
        .with_upload(upload);
    let collect = CollectSink::new();
    run(&tree, Arc::new(collect.clone()), &ep).unwrap();

    // One row naming the new table.
    let rows = collect.rows();
    assert_eq!(rows.len(), 1);
    let table_path = rows[0].field("table").as_str().unwrap().to_string();
    assert!(table_path.starts_with("db/out/citations-"));

    let fs = env.upload_fs().unwrap();
    let files = fs.list();
    assert!(files.iter().any(|f| f.ends_with(".index")));
    assert!(files.iter().any(|f| f.ends_with(".tern")));

    // The index verifies under the environment's key and names the table.
    let index_bytes = fs.get("db/out/index.index").unwrap();
    let key: [u8; 32] = core::array::from_fn(|i| i as u8);
    let index = verify_index(&key, &index_bytes).unwrap();
    assert_eq!(index.field("table").as_str().unwrap(), table_path);
    let mut tampered = index_bytes.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 1;
    assert!(verify_index(&key, &tampered).is_err());
}

#[test]
fn stats_count_scanned_bytes_and_rows() {
    let env = test_env();
    let trace = Step::iter_table(Expr::path("parking"));
    let tree = lower(&trace, &env).unwrap();
    let ep = ExecParams::new(env.runner()).with_parallel(2);
    let collect = CollectSink::new();
    run(&tree, Arc::new(collect.clone()), &ep).unwrap();
    assert_eq!(ep.stats.rows_out(), 10);
    assert!(ep.stats.scanned_bytes() > 0);
    assert!(ep.stats.cache_hits() > 0);
}
