use clap::Parser as ClapParser;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, PositionArgs};
use query_daemon::launcher::{self, LaunchError, LaunchOptions};
use query_daemon::workspace::find_workspace_upwards;
use query_daemon::DaemonClient;

// Exit-code taxonomy shared with editor integrations; the daemon is
// replaceable behind it.
const EXIT_SUCCESS: i32 = 0;
const EXIT_NO_RESULT: i32 = 1;
const EXIT_LOAD_FAILURE: i32 = 2;
const EXIT_USAGE: i32 = 3;
const EXIT_CONNECT_FAILURE: i32 = 4;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            use clap::error::ErrorKind;
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_SUCCESS,
                _ => EXIT_USAGE,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let workspace = match resolve_workspace(cli.workspace.clone()) {
        Ok(workspace) => workspace,
        Err(message) => {
            eprintln!("error: {message}");
            return EXIT_USAGE;
        }
    };

    match &cli.command {
        Command::Status => status(&workspace, cli.json).await,
        Command::Stop => stop(&workspace).await,
        command => {
            let (method, params) = request_for(command);
            query(&workspace, &cli, method, params).await
        }
    }
}

fn resolve_workspace(explicit: Option<PathBuf>) -> Result<PathBuf, String> {
    if let Some(workspace) = explicit {
        return Ok(workspace);
    }
    let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
    find_workspace_upwards(&cwd)
        .ok_or_else(|| "no .sln or .csproj found here; pass --workspace".to_string())
}

fn position_params(position: &PositionArgs) -> Value {
    json!({
        "file": position.file,
        "line": position.line,
        "column": position.column,
    })
}

fn request_for(command: &Command) -> (&'static str, Value) {
    match command {
        Command::Definition(position) => ("definition", position_params(position)),
        Command::BaseDefinition(position) => ("base-definition", position_params(position)),
        Command::Implementations(position) => ("implementations", position_params(position)),
        Command::References {
            position,
            include_definition,
        } => {
            let mut params = position_params(position);
            params["include_definition"] = json!(include_definition);
            ("references", params)
        }
        Command::Callers(position) => ("callers", position_params(position)),
        Command::Callees(position) => ("callees", position_params(position)),
        Command::Symbol(position) => ("symbol", position_params(position)),
        Command::Diagnostics {
            file,
            no_warnings,
            info,
        } => (
            "diagnostics",
            json!({
                "file": file,
                "include_warnings": !no_warnings,
                "include_info": info,
            }),
        ),
        Command::Ping => ("ping", json!({})),
        Command::Status | Command::Stop => unreachable!("handled before dispatch"),
    }
}

async fn connect(workspace: &PathBuf, idle_timeout: Option<u64>) -> Result<DaemonClient, i32> {
    let options = LaunchOptions {
        idle_timeout_minutes: idle_timeout,
        ..Default::default()
    };
    launcher::connect_or_spawn(workspace, &options)
        .await
        .map_err(|e| match e {
            LaunchError::Workspace(e) => {
                eprintln!("error: {e}");
                EXIT_LOAD_FAILURE
            }
            LaunchError::Daemon {
                message,
                exit_code: Some(2),
            } => {
                eprintln!("error: workspace load failure: {message}");
                EXIT_LOAD_FAILURE
            }
            other => {
                eprintln!("error: {other}");
                EXIT_CONNECT_FAILURE
            }
        })
}

async fn query(workspace: &PathBuf, cli: &Cli, method: &str, params: Value) -> i32 {
    let client = match connect(workspace, cli.idle_timeout).await {
        Ok(client) => client,
        Err(code) => return code,
    };

    let response = match client.request(method, Some(params)).await {
        Ok(response) => response,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_CONNECT_FAILURE;
        }
    };

    if let Some(error) = response.error {
        eprintln!("daemon error {}: {}", error.code, error.message);
        return EXIT_NO_RESULT;
    }
    let result = response.result.unwrap_or(Value::Null);

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string())
        );
        return if result["success"] == json!(false) {
            EXIT_NO_RESULT
        } else {
            EXIT_SUCCESS
        };
    }

    if result["success"] == json!(false) {
        let message = result["error_message"].as_str().unwrap_or("no result");
        eprintln!("{message}");
        return EXIT_NO_RESULT;
    }

    render(method, &result);
    EXIT_SUCCESS
}

fn render(method: &str, result: &Value) {
    match method {
        "definition" | "base-definition" => {
            if let Some(location) = result.get("location") {
                println!(
                    "{}  {} ({})",
                    render_location(location),
                    result["symbol_name"].as_str().unwrap_or(""),
                    result["symbol_kind"].as_str().unwrap_or("")
                );
            }
        }
        "implementations" | "references" | "callers" | "callees" => {
            let empty = Vec::new();
            let locations = result["locations"].as_array().unwrap_or(&empty);
            for location in locations {
                println!("{}", render_location(location));
            }
            eprintln!(
                "{} location(s) for {}",
                locations.len(),
                result["symbol_name"].as_str().unwrap_or("?")
            );
        }
        "symbol" => {
            println!(
                "{} {}",
                result["kind"].as_str().unwrap_or("?"),
                result["full_name"].as_str().unwrap_or("?")
            );
            for field in [
                "signature",
                "return_type",
                "accessibility",
                "containing_type",
                "containing_namespace",
                "documentation",
            ] {
                if let Some(value) = result[field].as_str() {
                    println!("  {field}: {value}");
                }
            }
            if let Some(location) = result.get("location") {
                println!("  location: {}", render_location(location));
            }
        }
        "diagnostics" => {
            let empty = Vec::new();
            for diagnostic in result["diagnostics"].as_array().unwrap_or(&empty) {
                let location = diagnostic
                    .get("location")
                    .map(render_location)
                    .unwrap_or_default();
                println!(
                    "{location} {} {}: {}",
                    diagnostic["severity"].as_str().unwrap_or("?"),
                    diagnostic["id"].as_str().unwrap_or("?"),
                    diagnostic["message"].as_str().unwrap_or("")
                );
            }
            eprintln!(
                "{} error(s), {} warning(s), {} info",
                result["error_count"], result["warning_count"], result["info_count"]
            );
        }
        "ping" => {
            println!(
                "ok (daemon v{}, idle {}s, timeout {}m)",
                result["version"].as_str().unwrap_or("?"),
                result["idle_seconds"],
                result["idle_timeout_minutes"]
            );
        }
        _ => {
            println!("{result}");
        }
    }
}

fn render_location(location: &Value) -> String {
    format!(
        "{}:{}:{}",
        location["file"].as_str().unwrap_or("?"),
        location["line"],
        location["column"]
    )
}

async fn status(workspace: &PathBuf, json_output: bool) -> i32 {
    let presence = match launcher::probe(workspace) {
        Ok(presence) => presence,
        Err(LaunchError::Workspace(e)) => {
            eprintln!("error: {e}");
            return EXIT_LOAD_FAILURE;
        }
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_CONNECT_FAILURE;
        }
    };

    // A live daemon answers `status` itself; otherwise compose an offline
    // answer from the PID file.
    let composed = match launcher::try_connect(workspace, Duration::from_secs(2)).await {
        Ok(Some(client)) => match client.request("status", None).await {
            Ok(response) => response.result.unwrap_or(Value::Null),
            Err(_) => offline_status(workspace, &presence, presence.running),
        },
        _ => offline_status(workspace, &presence, false),
    };

    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(&composed).unwrap_or_else(|_| composed.to_string())
        );
    } else {
        let running = composed["running"].as_bool().unwrap_or(false);
        let responsive = composed["responsive"].as_bool().unwrap_or(false);
        if responsive {
            println!(
                "running (pid {}, snapshot v{}, idle {}s)",
                composed["pid"], composed["snapshot_version"], composed["idle_seconds"]
            );
        } else if running {
            println!("running (pid {}) but not responsive", composed["pid"]);
        } else {
            println!("not running");
        }
    }
    EXIT_SUCCESS
}

fn offline_status(
    workspace: &PathBuf,
    presence: &launcher::DaemonPresence,
    running: bool,
) -> Value {
    json!({
        "workspace": workspace.to_string_lossy(),
        "socket_path": presence.socket_path,
        "pid_file_path": presence.pid_file_path.to_string_lossy(),
        "running": running,
        "responsive": false,
        "pid": presence.pid,
    })
}

async fn stop(workspace: &PathBuf) -> i32 {
    match launcher::try_connect(workspace, Duration::from_secs(2)).await {
        Ok(Some(client)) => match client.request("shutdown", None).await {
            Ok(_) => {
                println!("shutdown requested");
                EXIT_SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                EXIT_CONNECT_FAILURE
            }
        },
        Ok(None) => {
            eprintln!("daemon not running");
            EXIT_NO_RESULT
        }
        Err(LaunchError::Workspace(e)) => {
            eprintln!("error: {e}");
            EXIT_LOAD_FAILURE
        }
        Err(e) => {
            eprintln!("error: {e}");
            EXIT_CONNECT_FAILURE
        }
    }
}
