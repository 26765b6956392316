use shiftdb::job::Job;
use shiftdb::meta::Meta;
use shiftdb::storage::kv::{KvStore, MemKvStore};
use shiftdb::storage::txn::Transaction;
use std::path::PathBuf;
use std::sync::Arc;

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        return Err("missing command".into());
    }
    let rest = &args[2..];
    match args[1].as_str() {
        "jobs" => cmd_jobs(rest),
        "history" => cmd_history(rest),
        "job" => cmd_job(rest),
        "reorg" => cmd_reorg(rest),
        "tables" => cmd_tables(rest),
        other => {
            print_usage();
            Err(format!("unknown top-level command: {other}"))
        }
    }
}

fn open_store(args: &[String]) -> Result<Arc<dyn KvStore>, String> {
    let dir = parse_flag_value(args, "--data-dir").ok_or("--data-dir is required")?;
    let dir = PathBuf::from(dir);
    if !dir.is_dir() {
        return Err(format!("{} is not a directory", dir.display()));
    }
    let store = MemKvStore::open_dir(&dir, false).map_err(|e| format!("open {}: {e}", dir.display()))?;
    Ok(Arc::new(store))
}

fn print_job_line(job: &Job) {
    println!(
        "{}\t{}\t{}\t{}\t{}\t{}",
        job.id,
        job.kind.type_name(),
        job.state,
        job.schema_state,
        job.row_count,
        job.query
    );
}

fn cmd_jobs(args: &[String]) -> Result<(), String> {
    let store = open_store(args)?;
    let mut txn = Transaction::begin(&store);
    let jobs = Meta::new(&mut txn).list_queue().map_err(|e| e.to_string())?;
    for job in &jobs {
        print_job_line(job);
    }
    Ok(())
}

fn cmd_history(args: &[String]) -> Result<(), String> {
    let limit = match parse_flag_value(args, "--limit") {
        Some(v) => v.parse::<usize>().map_err(|e| format!("--limit: {e}"))?,
        None => 100,
    };
    let store = open_store(args)?;
    let mut txn = Transaction::begin(&store);
    let jobs = Meta::new(&mut txn)
        .list_history(limit)
        .map_err(|e| e.to_string())?;
    for job in &jobs {
        print_job_line(job);
    }
    Ok(())
}

fn parse_job_id(args: &[String]) -> Result<i64, String> {
    parse_flag_value(args, "--job")
        .ok_or("--job is required")?
        .parse::<i64>()
        .map_err(|e| format!("--job: {e}"))
}

fn cmd_job(args: &[String]) -> Result<(), String> {
    let job_id = parse_job_id(args)?;
    let store = open_store(args)?;
    let mut txn = Transaction::begin(&store);
    let meta = Meta::new(&mut txn);
    let job = match meta.queued_job(job_id).map_err(|e| e.to_string())? {
        Some(job) => job,
        None => meta
            .history_job(job_id)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("job {job_id} not found"))?,
    };
    let out = serde_json::to_string_pretty(&job).map_err(|e| e.to_string())?;
    println!("{out}");
    Ok(())
}

fn cmd_reorg(args: &[String]) -> Result<(), String> {
    let job_id = parse_job_id(args)?;
    let store = open_store(args)?;
    let mut txn = Transaction::begin(&store);
    let Some(info) = Meta::new(&mut txn)
        .reorg(job_id)
        .map_err(|e| e.to_string())?
    else {
        println!("job {job_id} has no reorg checkpoint");
        return Ok(());
    };
    println!("job_id\t{}", info.job_id);
    println!("physical_table_id\t{}", info.physical_table_id);
    println!("remaining_partitions\t{:?}", info.remaining_partitions);
    println!("snapshot_ts\t{}", info.snapshot_ts);
    println!("scanned_rows\t{}", info.scanned_rows);
    println!("added_rows\t{}", info.added_rows);
    println!("warnings\t{}", info.warnings);
    Ok(())
}

fn cmd_tables(args: &[String]) -> Result<(), String> {
    let store = open_store(args)?;
    let mut txn = Transaction::begin(&store);
    let meta = Meta::new(&mut txn);
    let version = meta.schema_version().map_err(|e| e.to_string())?;
    println!("schema_version\t{version}");
    for schema in meta.list_schemas().map_err(|e| e.to_string())? {
        for table in meta.list_tables(schema.id).map_err(|e| e.to_string())? {
            let columns: Vec<String> = table
                .columns
                .iter()
                .map(|c| format!("{} {} [{}]", c.name, c.col_type, c.state))
                .collect();
            println!(
                "{}.{}\t{}\t{}",
                schema.name,
                table.name,
                table.update_version,
                columns.join(", ")
            );
        }
    }
    Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|idx| args.get(idx + 1).cloned())
}

fn print_usage() {
    eprintln!("usage:");
    eprintln!("  shiftdb jobs --data-dir <dir>");
    eprintln!("  shiftdb history --data-dir <dir> [--limit <n>]");
    eprintln!("  shiftdb job --data-dir <dir> --job <id>");
    eprintln!("  shiftdb reorg --data-dir <dir> --job <id>");
    eprintln!("  shiftdb tables --data-dir <dir>");
}
