use rowbound::{load_config, ConnectionConfig, ConnectionManager, DataError, QueryBuilder};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: rowbound [--config <path>] <table> [limit]";

struct Args {
    config: Option<PathBuf>,
    table: String,
    limit: Option<u64>,
}

fn parse_args(raw: &[String]) -> Result<Args, String> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut iter = raw.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter.next().ok_or("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Err(USAGE.to_string()),
            _ => positional.push(arg.clone()),
        }
    }

    let mut positional = positional.into_iter();
    let table = positional.next().ok_or_else(|| USAGE.to_string())?;
    let limit = match positional.next() {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| format!("limit must be a non-negative integer, got '{}'", raw))?,
        ),
        None => None,
    };
    if positional.next().is_some() {
        return Err(USAGE.to_string());
    }
    Ok(Args { config, table, limit })
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("rowbound").join("config.toml"))
}

fn read_config(explicit: Option<PathBuf>) -> rowbound::Result<ConnectionConfig> {
    match explicit {
        Some(path) => load_config(path),
        None => match default_config_path() {
            Some(path) if path.exists() => load_config(path),
            // environment overrides alone may be enough
            _ => Ok(ConnectionConfig::default()),
        },
    }
}

fn run(args: Args) -> Result<(), (DataError, bool)> {
    let config = read_config(args.config).map_err(|e| (e, false))?;
    let debug_errors = config.debug;
    let fail = |e: DataError| (e, debug_errors);

    let mut manager = ConnectionManager::from_config(&config).map_err(fail)?;
    info!(driver = %manager.settings().driver, table = %args.table, "listing rows");

    let conn = manager.connect().map_err(fail)?;
    let mut qb = QueryBuilder::new(conn);
    qb.select(&args.table, &[]).map_err(fail)?;
    if let Some(limit) = args.limit {
        qb.limit(limit);
    }
    let rows = qb.get().map_err(fail)?;
    debug!(rows = rows.len(), "fetched");

    for row in &rows {
        let line = serde_json::to_string(row)
            .map_err(|e| fail(DataError::Query(format!("failed to encode row: {}", e))))?;
        println!("{}", line);
    }

    manager.close().map_err(fail)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{}", message);
            return ExitCode::from(2);
        }
    };

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err((e, debug_errors)) => {
            eprintln!("error: {}", e.public_message(debug_errors));
            ExitCode::FAILURE
        }
    }
}
