mod common;

use common::{
    GateObserver, GatePoint, SCHEMA, create_schema, create_table, failure, history_job, modify,
    node_with_table, table, test_config,
};
use shiftdb::catalog::schema::SchemaState;
use shiftdb::catalog::types::{ColumnType, Datum};
use shiftdb::ddl::observer::DdlObserver;
use shiftdb::error::ShiftError;
use shiftdb::job::JobState;
use shiftdb::{ClusterServices, ColumnSpec, DdlRequest, IndexSpec, NodeOptions, ShiftDb, SqlMode, TableSpec};
use std::sync::Arc;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn not_null_with_existing_null_fails_and_leaves_table_unchanged() {
    let db = node_with_table(test_config(), ColumnSpec::new("a", ColumnType::int())).await;
    let session = db.session();
    session.insert(SCHEMA, "t", &[("a", Datum::Null)]).expect("insert");
    let before = table(&db, "t");

    let err = db
        .execute(&modify("t", ColumnSpec::new("a", ColumnType::int()).not_null()))
        .await
        .expect_err("must fail");
    let (code, message) = failure(err);
    assert_eq!(code, "data_truncated");
    assert_eq!(message, "Data truncated for column 'a' at row 1");

    let after = table(&db, "t");
    assert_eq!(after.columns, before.columns);
    assert_eq!(after.indexes, before.indexes);
    assert_eq!(session.select_all(SCHEMA, "t").expect("select"), vec![vec![Datum::Null]]);
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn integer_widening_chain_keeps_values() {
    let db = node_with_table(test_config(), ColumnSpec::new("a", ColumnType::tinyint())).await;
    let session = db.session();
    session.insert(SCHEMA, "t", &[("a", Datum::Int(127))]).expect("insert");

    for target in [
        ColumnType::SmallInt { unsigned: false },
        ColumnType::MediumInt { unsigned: false },
        ColumnType::int(),
        ColumnType::bigint(),
    ] {
        let job = db
            .execute(&modify("t", ColumnSpec::new("a", target)))
            .await
            .expect("widen");
        assert_eq!(job.state, JobState::Synced);
        assert_eq!(table(&db, "t").public_column("a").expect("a").col_type, target);
        assert_eq!(
            session.select_all(SCHEMA, "t").expect("select"),
            vec![vec![Datum::Int(127)]]
        );
    }
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn json_object_to_tinyint_reports_the_value() {
    let db = node_with_table(test_config(), ColumnSpec::new("a", ColumnType::Json)).await;
    let session = db.session();
    session
        .insert(SCHEMA, "t", &[("a", Datum::json(r#"{"obj": 100}"#))])
        .expect("insert");

    let err = db
        .execute(&modify("t", ColumnSpec::new("a", ColumnType::tinyint())))
        .await
        .expect_err("must fail");
    let (code, message) = failure(err);
    assert_eq!(code, "truncated_wrong_value");
    assert_eq!(
        message,
        r#"Incorrect integer value: '{"obj": 100}' for column 'a' at row 1"#
    );
    assert_eq!(
        table(&db, "t").public_column("a").expect("a").col_type,
        ColumnType::Json
    );
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn narrowing_overflow_depends_on_sql_mode() {
    let db = ShiftDb::open(test_config()).expect("open");
    create_schema(&db).await;
    create_table(
        &db,
        TableSpec::new("strict", vec![ColumnSpec::new("a", ColumnType::int())]).sql_mode(SqlMode::Strict),
    )
    .await;
    create_table(
        &db,
        TableSpec::new("relaxed", vec![ColumnSpec::new("a", ColumnType::int())]).sql_mode(SqlMode::Relaxed),
    )
    .await;
    let session = db.session();
    for name in ["strict", "relaxed"] {
        session.insert(SCHEMA, name, &[("a", Datum::Int(300))]).expect("insert");
    }

    let err = db
        .execute(&modify("strict", ColumnSpec::new("a", ColumnType::tinyint())))
        .await
        .expect_err("strict overflow");
    assert_eq!(failure(err).1, "Out of range value for column 'a' at row 1");

    let job = db
        .execute(&modify("relaxed", ColumnSpec::new("a", ColumnType::tinyint())))
        .await
        .expect("relaxed clamps");
    assert_eq!(job.warning_count, 1);
    assert_eq!(job.row_count, 1);
    assert_eq!(
        session.select_all(SCHEMA, "relaxed").expect("select"),
        vec![vec![Datum::Int(127)]]
    );
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rewrite_rebuilds_covering_indexes_and_renames() {
    let db = ShiftDb::open(test_config()).expect("open");
    create_schema(&db).await;
    create_table(
        &db,
        TableSpec::new(
            "t",
            vec![
                ColumnSpec::new("id", ColumnType::bigint()),
                ColumnSpec::new("a", ColumnType::bigint()),
            ],
        )
        .primary_key("id")
        .index(IndexSpec::new("ia", &["a"]).unique()),
    )
    .await;
    let session = db.session();
    for i in 1..=40 {
        session
            .insert(SCHEMA, "t", &[("id", Datum::Int(i)), ("a", Datum::Int(i * 10))])
            .expect("insert");
    }

    let request = DdlRequest::ModifyColumn {
        schema: SCHEMA.into(),
        table: "t".into(),
        column: "a".into(),
        new: ColumnSpec::new("b", ColumnType::int()).not_null(),
    };
    assert_eq!(
        request.to_string(),
        "ALTER TABLE test.t CHANGE COLUMN a b int NOT NULL"
    );
    let job = db.execute(&request).await.expect("modify");
    assert_eq!(job.row_count, 40);

    let t = table(&db, "t");
    assert!(t.public_column("a").is_none());
    let b = t.public_column("b").expect("renamed column");
    assert_eq!(b.col_type, ColumnType::int());
    assert!(!b.nullable);
    assert!(t.columns.iter().all(|c| c.state == SchemaState::Public));
    let index = t.index_by_name("ia").expect("index swapped in");
    assert_eq!(index.columns, vec![b.id]);
    assert_eq!(t.indexes.len(), 1);

    let dup = session
        .insert(SCHEMA, "t", &[("id", Datum::Int(99)), ("b", Datum::Int(100))])
        .expect_err("rebuilt unique index");
    assert!(matches!(dup, ShiftError::DuplicateEntry { .. }));
    assert_eq!(session.column_names(SCHEMA, "t").expect("names"), vec!["id", "b"]);
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn primary_key_cannot_become_nullable() {
    let db = ShiftDb::open(test_config()).expect("open");
    create_schema(&db).await;
    create_table(
        &db,
        TableSpec::new("t", vec![ColumnSpec::new("id", ColumnType::int())]).primary_key("id"),
    )
    .await;
    let err = db
        .submit_job(&modify("t", ColumnSpec::new("id", ColumnType::bigint())))
        .await
        .expect_err("rejected at submission");
    assert!(matches!(err, ShiftError::PrimaryCantHaveNull { .. }));
    assert!(db.queued_jobs().expect("queue").is_empty());
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn foreground_writes_are_dual_written_during_reorg() {
    let cluster = ClusterServices::in_memory();
    let (observer, mut gate) = GateObserver::new(GatePoint::AtState(SchemaState::WriteOnly));
    let db = ShiftDb::join(test_config(), &cluster, NodeOptions::new("n1").observer(observer))
        .expect("join");
    create_schema(&db).await;
    create_table(&db, TableSpec::new("t", vec![ColumnSpec::new("a", ColumnType::bigint())])).await;
    let session = db.session();
    for v in [1, 2, 3] {
        session.insert(SCHEMA, "t", &[("a", Datum::Int(v))]).expect("insert");
    }
    session.insert(SCHEMA, "t", &[("a", Datum::Null)]).expect("insert null");

    let job_id = db
        .submit_job(&modify("t", ColumnSpec::new("a", ColumnType::int()).not_null()))
        .await
        .expect("submit");
    let held = gate.reached().await;
    assert_eq!(held.id, job_id);

    let err = session
        .insert(SCHEMA, "t", &[("a", Datum::Null)])
        .expect_err("null rejected once narrowing started");
    assert_eq!(err.to_string(), "Column 'a' cannot be null");
    let err = session
        .insert(SCHEMA, "t", &[("a", Datum::Int(1 << 40))])
        .expect_err("shadow column rejects overflow");
    assert_eq!(err.to_string(), "Out of range value for column 'a' at row 1");
    session.insert(SCHEMA, "t", &[("a", Datum::Int(4))]).expect("dual write");
    gate.release();

    let err = db.wait_job(job_id, None).await.expect_err("existing null");
    assert_eq!(failure(err).0, "data_truncated");
    let t = table(&db, "t");
    let a = t.public_column("a").expect("a");
    assert_eq!(a.col_type, ColumnType::bigint());
    assert!(!a.prevent_null_insert);
    assert_eq!(t.columns.len(), 1);
    session.insert(SCHEMA, "t", &[("a", Datum::Null)]).expect("nulls allowed again");
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dual_written_rows_survive_promotion() {
    let cluster = ClusterServices::in_memory();
    let (observer, mut gate) = GateObserver::new(GatePoint::AtState(SchemaState::WriteReorganization));
    let db = ShiftDb::join(test_config(), &cluster, NodeOptions::new("n1").observer(observer))
        .expect("join");
    create_schema(&db).await;
    create_table(&db, TableSpec::new("t", vec![ColumnSpec::new("a", ColumnType::bigint())])).await;
    let session = db.session();
    let first = session.insert(SCHEMA, "t", &[("a", Datum::Int(7))]).expect("insert");

    let job_id = db
        .submit_job(&modify("t", ColumnSpec::new("a", ColumnType::varchar(8))))
        .await
        .expect("submit");
    gate.reached().await;
    session.insert(SCHEMA, "t", &[("a", Datum::Int(8))]).expect("insert during reorg");
    session.update(SCHEMA, "t", first, &[("a", Datum::Int(70))]).expect("update during reorg");
    gate.release();

    let job = db.wait_job(job_id, None).await.expect("modify");
    assert_eq!(job.state, JobState::Synced);
    assert_eq!(
        session.select_all(SCHEMA, "t").expect("select"),
        vec![vec![Datum::text("70")], vec![Datum::text("8")]]
    );
    db.shutdown().await.expect("shutdown");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn backfill_counts_only_rows_it_rewrote() {
    let cluster = ClusterServices::in_memory();
    let (gate_observer, mut gate) = GateObserver::new(GatePoint::AfterRound);
    let observer: Arc<dyn DdlObserver> = gate_observer.clone();
    let db = ShiftDb::join(test_config(), &cluster, NodeOptions::new("n1").observer(observer))
        .expect("join");
    create_schema(&db).await;
    create_table(&db, TableSpec::new("t", vec![ColumnSpec::new("a", ColumnType::bigint())])).await;
    let session = db.session();
    let handles: Vec<i64> = (0..500)
        .map(|i| session.insert(SCHEMA, "t", &[("a", Datum::Int(i))]).expect("insert"))
        .collect();

    let job_id = db
        .submit_job(&modify("t", ColumnSpec::new("a", ColumnType::int()).not_null()))
        .await
        .expect("submit");
    gate.reached().await;
    // rows still visible in the backfill snapshot but gone before their round
    for handle in &handles[400..] {
        assert!(session.delete(SCHEMA, "t", *handle).expect("delete"));
    }
    gate.release();

    let job = db.wait_job(job_id, None).await.expect("modify");
    assert_eq!(job.row_count, 400);

    // 4 workers x 16 rows per round: 8 rounds, the last one partial
    let config = db.config();
    let round_rows = (config.reorg_worker_count * config.reorg_chunk_rows) as u64;
    let rounds = 500u64.div_ceil(round_rows);
    let expected: Vec<u64> = (1..=rounds).map(|r| (r * round_rows).min(500)).collect();
    assert_eq!(gate_observer.checkpoints(), expected);
    assert_eq!(
        gate_observer.chunks() as u64,
        (rounds - 1) * config.reorg_worker_count as u64 + (500 % round_rows).div_ceil(config.reorg_chunk_rows as u64)
    );
    assert_eq!(session.select_all(SCHEMA, "t").expect("select").len(), 400);
    db.shutdown().await.expect("shutdown");
}
