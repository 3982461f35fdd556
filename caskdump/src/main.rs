//! Caskdump - read-only inspector for Cask container files
//!
//! Opens a container without taking write access and prints the header
//! summary, the root value, and statistics for every reachable index.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

use cask_engine::{Index, OpenFlags, Storage, StorageError, Value};

/// Caskdump - inspect a Cask container file
#[derive(Parser, Debug)]
#[command(name = "caskdump")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Container file to inspect
    file: PathBuf,

    /// Print the full root value
    #[arg(long)]
    root: bool,

    /// Print the leading entries of every reachable index
    #[arg(long)]
    indexes: bool,

    /// Entries shown per index with --indexes
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run(&args) {
        eprintln!("caskdump: {:#}", err);
        let code = err
            .downcast_ref::<StorageError>()
            .map(|e| e.code().as_raw() as i32)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn run(args: &Args) -> Result<()> {
    let storage = Storage::open_with(&args.file, OpenFlags::READ_ONLY)?;
    debug!(file = %args.file.display(), "container opened read-only");

    let root = storage.root()?;
    let indexes = collect_indexes(&root);

    println!("container: {}", args.file.display());
    println!("root kind: {}", root.kind_name());
    println!("reachable indexes: {}", indexes.len());

    if args.indexes {
        for (label, index) in &indexes {
            let kind = index.key_kind()?;
            let len = index.len()?;
            println!();
            println!("index {} ({} keys, {} entries)", label, kind, len);
            for value in index.iter()?.take(args.limit) {
                println!("  {}", value?);
            }
            if len > args.limit {
                println!("  … {} more", len - args.limit);
            }
        }
    }

    if args.root {
        println!();
        println!("root: {}", root);
    }

    storage.close()?;
    Ok(())
}

/// Collect every distinct index reachable from the root, labeled with the
/// path it was first found under. Indexes reachable only through another
/// index's entries are picked up by scanning entries breadth-first.
fn collect_indexes(root: &Value) -> Vec<(String, Index)> {
    let mut found: Vec<(String, Index)> = Vec::new();
    walk(root, "root", &mut found);

    let mut next = 0;
    while next < found.len() {
        let (label, index) = found[next].clone();
        next += 1;
        let entries = match index.iter() {
            Ok(iter) => iter,
            Err(_) => continue,
        };
        for (i, value) in entries.enumerate() {
            if let Ok(value) = value {
                walk(&value, &format!("{}[{}]", label, i), &mut found);
            }
        }
    }
    found
}

fn walk(value: &Value, label: &str, found: &mut Vec<(String, Index)>) {
    match value {
        Value::Array(arr) => {
            for (i, item) in arr.items().iter().enumerate() {
                walk(item, &format!("{}[{}]", label, i), found);
            }
        }
        Value::Record(rec) => {
            for (key, field) in rec.entries() {
                walk(&field, &format!("{}.{}", label, key), found);
            }
        }
        Value::Class(inst) => {
            for (key, field) in inst.fields.entries() {
                walk(&field, &format!("{}.{}", label, key), found);
            }
        }
        Value::Index(index) => {
            if !found.iter().any(|(_, seen)| seen == index) {
                found.push((label.to_string(), index.clone()));
            }
        }
        _ => {}
    }
}
