mod common;

use common::{SCHEMA, create_schema, create_table, history_job, table, test_config};
use shiftdb::catalog::schema::SchemaState;
use shiftdb::catalog::types::{ColumnType, Datum};
use shiftdb::error::ShiftError;
use shiftdb::job::JobState;
use shiftdb::{
    ClusterServices, ColumnSpec, DdlRequest, IndexSpec, NodeOptions, ShiftConfig, ShiftDb, TableSpec,
};

fn add_index(name: &str, columns: &[&str], unique: bool) -> DdlRequest {
    let mut index = IndexSpec::new(name, columns);
    if unique {
        index = index.unique();
    }
    DdlRequest::AddIndex {
        schema: SCHEMA.into(),
        table: "t".into(),
        index,
    }
}

async fn node_with_rows(rows: &[(i64, i64)]) -> ShiftDb {
    let db = ShiftDb::open(test_config()).expect("open");
    create_schema(&db).await;
    create_table(
        &db,
        TableSpec::new(
            "t",
            vec![
                ColumnSpec::new("id", ColumnType::bigint()),
                ColumnSpec::new("v", ColumnType::int()),
            ],
        )
        .primary_key("id")
        .partitions(4),
    )
    .await;
    let session = db.session();
    for (id, v) in rows {
        session
            .insert(SCHEMA, "t", &[("id", Datum::Int(*id)), ("v", Datum::Int(*v))])
            .expect("insert");
    }
    db
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_index_backfills_every_partition() {
    let rows: Vec<(i64, i64)> = (1..=100).map(|i| (i, i * 2)).collect();
    let db = node_with_rows(&rows).await;

    let job = db.execute(&add_index("iv", &["v"], true)).await.expect("add index");
    assert_eq!(job.state, JobState::Synced);
    assert_eq!(job.row_count, 100);
    let index = table(&db, "t").index_by_name("iv").cloned().expect("index");
    assert_eq!(index.state, SchemaState::Public);

    let err = db
        .session()
        .insert(SCHEMA, "t", &[("id", Datum::Int(500)), ("v", Datum::Int(20))])
        .expect_err("unique index enforced");
    assert_eq!(err.to_string(), "Duplicate entry '20' for key 'iv'");
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unique_index_over_duplicates_rolls_back() {
    let db = node_with_rows(&[(1, 5), (2, 5)]).await;
    let err = db
        .execute(&add_index("iv", &["v"], true))
        .await
        .expect_err("duplicate values");
    match err {
        ShiftError::JobFailed { code, message, .. } => {
            assert_eq!(code.as_str(), "duplicate_entry");
            assert_eq!(message, "Duplicate entry '5' for key 'iv'");
        }
        other => panic!("unexpected {other}"),
    }
    assert!(table(&db, "t").index_by_name("iv").is_none());
    db.execute(&add_index("iv", &["v"], false))
        .await
        .expect("non-unique index over the same data");
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn add_and_drop_column_with_origin_default() {
    let db = node_with_rows(&[(1, 10), (2, 20)]).await;
    let session = db.session();

    db.execute(&DdlRequest::AddColumn {
        schema: SCHEMA.into(),
        table: "t".into(),
        column: ColumnSpec::new("c", ColumnType::varchar(10)).default_value(Datum::text("x")),
    })
    .await
    .expect("add column");
    assert_eq!(
        session.select_all(SCHEMA, "t").expect("select"),
        vec![
            vec![Datum::Int(1), Datum::Int(10), Datum::text("x")],
            vec![Datum::Int(2), Datum::Int(20), Datum::text("x")],
        ]
    );

    let err = db
        .submit_job(&DdlRequest::DropColumn {
            schema: SCHEMA.into(),
            table: "t".into(),
            column: "id".into(),
        })
        .await
        .expect_err("primary key column");
    assert!(matches!(err, ShiftError::Validation(_)), "{err}");

    db.execute(&DdlRequest::DropColumn {
        schema: SCHEMA.into(),
        table: "t".into(),
        column: "v".into(),
    })
    .await
    .expect("drop column");
    assert_eq!(session.column_names(SCHEMA, "t").expect("names"), vec!["id", "c"]);
    assert_eq!(
        session.get(SCHEMA, "t", 2).expect("get"),
        Some(vec![Datum::Int(2), Datum::text("x")])
    );
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn jobs_on_one_table_run_in_submission_order() {
    let cluster = ClusterServices::in_memory();
    let first_node = ShiftDb::join(test_config(), &cluster, NodeOptions::new("n1")).expect("join");
    create_schema(&first_node).await;
    create_table(
        &first_node,
        TableSpec::new(
            "t",
            vec![
                ColumnSpec::new("id", ColumnType::bigint()),
                ColumnSpec::new("v", ColumnType::int()),
            ],
        )
        .primary_key("id"),
    )
    .await;
    first_node.shutdown().await.expect("stop owner");

    let first = first_node
        .submit_job(&add_index("i1", &["v"], false))
        .await
        .expect("first");
    let rejected = first_node
        .submit_job(&DdlRequest::DropIndex {
            schema: SCHEMA.into(),
            table: "t".into(),
            index: "i0".into(),
        })
        .await
        .expect_err("unknown index is rejected at submission");
    assert!(matches!(rejected, ShiftError::NotFound { .. }));
    let second = first_node
        .submit_job(&add_index("i2", &["v", "id"], false))
        .await
        .expect("second");
    let queued: Vec<i64> = first_node
        .queued_jobs()
        .expect("queue")
        .iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(queued, vec![first, second]);
    assert_eq!(first_node.job(second).expect("job").dependency_job_id, Some(first));

    let db = ShiftDb::join(test_config(), &cluster, NodeOptions::new("n2")).expect("join");
    db.wait_job(second, None).await.expect("second done");
    let first_job = history_job(&db, first);
    let second_job = history_job(&db, second);
    assert_eq!(first_job.state, JobState::Synced);
    assert!(first_job.schema_version < second_job.schema_version);
    assert_eq!(table(&db, "t").indexes.len(), 2);
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn explicit_transaction_fails_after_concurrent_schema_change() {
    let config = ShiftConfig {
        schema_lease_ms: 100,
        ..test_config()
    };
    let db = ShiftDb::open(config).expect("open");
    create_schema(&db).await;
    create_table(&db, TableSpec::new("t", vec![ColumnSpec::new("v", ColumnType::int())])).await;
    let session = db.session();
    session.begin().expect("begin");
    session
        .insert(SCHEMA, "t", &[("v", Datum::Int(2))])
        .expect("insert in txn");

    let job = db
        .execute(&DdlRequest::AddColumn {
            schema: SCHEMA.into(),
            table: "t".into(),
            column: ColumnSpec::new("c", ColumnType::int()),
        })
        .await
        .expect("add column waits out the open transaction");
    // the open transaction never confirmed the final version
    assert_eq!(job.state, JobState::Done);

    let err = session.commit().expect_err("schema changed");
    assert!(matches!(err, ShiftError::SchemaChanged { .. }), "{err}");
    assert!(session.select_all(SCHEMA, "t").expect("select").is_empty());
    db.shutdown().await.expect("shutdown");
}
