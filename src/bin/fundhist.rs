use std::path::PathBuf;

use fundhist::config::{ConfigOverrides, ReconcileOverrides, StoreBackend, StoreOverrides};
use fundhist::temporal::{format_date, parse_date};
use fundhist::utils::{
    describe_run, export_to_text_summary, load_history_file, load_snapshot_file,
    write_history_file,
};
use fundhist::{Fundhist, FundhistConfig, ReconcileError, ValidFromPolicy};
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn has_flag(flag: &str) -> bool {
    std::env::args().any(|arg| arg == flag)
}

fn print_help() {
    eprintln!(
        r#"fundhist - funding catalog history reconciliation

USAGE:
    fundhist <COMMAND> [OPTIONS]

COMMANDS:
    reconcile               Merge a snapshot into the stored history
    show                    Print a summary of the stored history
    verify                  Check the stored history for broken invariants
    import                  Replace the stored history with a JSON-lines table

OPTIONS:
    -c, --config <FILE>     Path to config file (TOML)
    -d, --data-dir <DIR>    Override history store directory
        --memory            Use an in-memory store (nothing is kept)
        --repair            Repair the RocksDB store before opening
    -s, --snapshot <FILE>   Snapshot to reconcile (JSON lines, one entity per line)
        --date <DATE>       Run date, YYYY-MM-DD [default: today, UTC]
        --expect <N>        Entry count the catalog declared for this run
        --valid-from <P>    preserve-original | snapshot-date
        --history <FILE>    History table to import (JSON lines)
        --export <FILE>     Write the resulting history as JSON lines
        --dry-run           Reconcile without writing the store
    -h, --help              Print help

ENVIRONMENT:
    FUNDHIST_CONFIG         Path to config file
    FUNDHIST_STORE__DATA_DIR
                            History store directory
    RUST_LOG                Log filter [default: info]
"#
    );
}

fn build_overrides() -> anyhow::Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();
    let mut store = StoreOverrides::default();

    if let Some(dir) = parse_arg("--data-dir").or_else(|| parse_arg("-d")) {
        store.data_dir = Some(PathBuf::from(dir));
    }
    if has_flag("--memory") {
        store.backend = Some(StoreBackend::Memory);
    }
    if has_flag("--repair") {
        store.repair = Some(true);
    }
    if store.data_dir.is_some() || store.backend.is_some() || store.repair.is_some() {
        overrides.store = Some(store);
    }

    if let Some(policy) = parse_arg("--valid-from") {
        let policy = match policy.as_str() {
            "preserve-original" => ValidFromPolicy::PreserveOriginal,
            "snapshot-date" => ValidFromPolicy::SnapshotDate,
            other => anyhow::bail!("unknown --valid-from policy '{other}'"),
        };
        overrides.reconcile = Some(ReconcileOverrides {
            valid_from_policy: Some(policy),
        });
    }
    Ok(overrides)
}

fn run_date() -> anyhow::Result<fundhist::RunDate> {
    match parse_arg("--date") {
        Some(raw) => parse_date(&raw),
        None => Ok(time::OffsetDateTime::now_utc().date()),
    }
}

fn reconcile(app: &mut Fundhist) -> anyhow::Result<()> {
    let snapshot_path = parse_arg("--snapshot")
        .or_else(|| parse_arg("-s"))
        .ok_or_else(|| anyhow::anyhow!("reconcile needs --snapshot <FILE>"))?;
    let expected = parse_arg("--expect")
        .map(|raw| raw.parse::<usize>())
        .transpose()?;
    let date = run_date()?;
    let snapshot = load_snapshot_file(&PathBuf::from(snapshot_path), date, expected)?;

    let rows = if has_flag("--dry-run") {
        let preview = app.preview(&snapshot)?;
        println!("{} (dry run)", describe_run(date, &preview.report));
        preview.rows
    } else {
        let report = app.run(&snapshot)?;
        println!("{}", describe_run(date, &report));
        for tie in &report.ties {
            println!("warning: {tie}");
        }
        app.history()?.into_rows()
    };

    if let Some(export) = parse_arg("--export") {
        write_history_file(&PathBuf::from(export), &rows)?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    if has_flag("-h") || has_flag("--help") {
        print_help();
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let Some(command) = std::env::args().nth(1) else {
        print_help();
        anyhow::bail!("missing command");
    };

    // Load config: CLI > Env > File > Defaults
    let config_path = parse_arg("--config")
        .or_else(|| parse_arg("-c"))
        .or_else(|| std::env::var("FUNDHIST_CONFIG").ok());
    let config = FundhistConfig::load(config_path.as_deref(), build_overrides()?)?;
    let mut app = Fundhist::from_config(&config)?;

    match command.as_str() {
        "reconcile" => {
            if let Err(err) = reconcile(&mut app) {
                if let Some(rejected) = err.downcast_ref::<ReconcileError>() {
                    eprintln!("run rejected, history left untouched: {rejected}");
                }
                return Err(err);
            }
        }
        "show" => {
            let table = app.history()?;
            if let Some(last) = app.store().last_run()? {
                println!("Last run: {}\n", format_date(last));
            }
            print!("{}", export_to_text_summary(&table));
            if let Some(export) = parse_arg("--export") {
                write_history_file(&PathBuf::from(export), table.rows())?;
            }
        }
        "verify" => {
            app.verify()?;
            println!("history ok");
        }
        "import" => {
            let path = parse_arg("--history")
                .ok_or_else(|| anyhow::anyhow!("import needs --history <FILE>"))?;
            let rows = load_history_file(&PathBuf::from(path))?;
            let read = rows.len();
            let date = run_date()?;
            let report = app.import(rows, date)?;
            println!(
                "imported {read} rows as {} identities as of {}",
                report.total(),
                format_date(date)
            );
            for tie in &report.ties {
                println!("warning: {tie}");
            }
        }
        other => {
            print_help();
            anyhow::bail!("unknown command '{other}'");
        }
    }

    Ok(())
}
