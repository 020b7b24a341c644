use clap::Parser;
use evalpool::{configure, shutdown, PoolOptions, Session};
use std::io::{self, Read};

/// Evaluate a script in a pooled worker process and emit a JSON result.
#[derive(Parser, Debug)]
#[command(
    name = "evalpool-cli",
    about = "Evaluate a script in a pooled worker process and emit a JSON result"
)]
struct Args {
    /// Pool to reserve the handle from
    #[arg(long, default_value = "default")]
    pool: String,

    /// Read the script from a file instead of stdin
    #[arg(long)]
    file: Option<std::path::PathBuf>,

    /// Evaluation timeout in milliseconds (default: the pool's eval timeout)
    #[arg(long)]
    timeout: Option<u64>,

    /// Worker executable (default: evalpool-worker next to this binary)
    #[arg(long)]
    exec: Option<std::path::PathBuf>,

    /// Script evaluated once on each fresh worker
    #[arg(long)]
    init: Option<String>,

    /// Script evaluated on every release
    #[arg(long)]
    reinit: Option<String>,

    /// Maximum pool size
    #[arg(long)]
    max: Option<usize>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    // Read the script.
    let script = if let Some(path) = &args.file {
        std::fs::read_to_string(path).unwrap_or_else(|e| {
            eprintln!("Error reading file: {e}");
            std::process::exit(1);
        })
    } else {
        let mut buf = String::new();
        io::stdin().read_to_string(&mut buf).unwrap_or_else(|e| {
            eprintln!("Error reading stdin: {e}");
            std::process::exit(1);
        });
        buf
    };

    configure(
        &args.pool,
        &PoolOptions {
            exec: args.exec.clone(),
            init: args.init.clone(),
            reinit: args.reinit.clone(),
            max: args.max,
            ..Default::default()
        },
    );

    let mut session = Session::new();
    let json = match session.get(&args.pool, 1, None) {
        Ok(ids) => match session.evaluate(&ids[0], &script, args.timeout) {
            Ok(result) => serde_json::json!({ "result": result }),
            Err(e) => serde_json::json!({
                "error": { "code": e.code_str(), "message": e.to_string() }
            }),
        },
        Err(e) => serde_json::json!({
            "error": { "code": e.code_str(), "message": e.to_string() }
        }),
    };
    session.cleanup();
    shutdown();

    // Always exits 0; errors are encoded in the JSON, not the exit code.
    println!("{json}");
}
