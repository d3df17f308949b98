//! `featurestore-ctl` — management CLI for the featurestore worker queues.
//!
//! Opens the same queue the worker consumes (from the worker's config file)
//! and runs a single command against it.
//!
//! # Usage
//!
//! ```text
//! featurestore-ctl [-f <config>] <command> [args]
//!
//! Commands:
//!   push <json>                       push a raw task message
//!   add-doc <store> <path>...         queue an add_doc task
//!   chat <store> <text>               queue a chat task, print its query id
//!   size <queue>                      number of queued items
//!   pop <queue> [timeout_ms]          pop one item (blocking with timeout)
//!   drain <queue>                     pop and print every item
//! ```
//!
//! `<queue>` accepts `task`, `response`, `chat` or a literal queue name.

use std::process;
use std::time::Duration;

use serde_json::json;

use featurestore_worker::config::{self, Config};
use featurestore_worker::dispatch::task::{StatusCode, TaskStatus};
use featurestore_worker::queue::{self, DurableQueue};

// ── CLI arg parsing ────────────────────────────────────────────────────────

struct Args {
    config_path: Option<String>,
    entities: Vec<String>,
    command: Option<String>,
    rest: Vec<String>,
}

fn parse_args() -> Args {
    let mut config_path = None;
    let mut entities = Vec::new();
    let mut command = None;
    let mut rest = Vec::new();
    let mut iter = std::env::args().skip(1);

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-f" => {
                config_path = iter.next();
            }
            "--entities" | "-e" => {
                if let Some(list) = iter.next() {
                    entities.extend(
                        list.split(',').map(str::trim).filter(|s| !s.is_empty()).map(String::from),
                    );
                }
            }
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--" => {
                rest.extend(iter);
                break;
            }
            _ if command.is_none() => command = Some(arg),
            _ => rest.push(arg),
        }
    }

    Args { config_path, entities, command, rest }
}

fn print_help() {
    eprintln!("usage: featurestore-ctl [-f <config>] <command> [args]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  push <json>                 push a raw task message");
    eprintln!("  add-doc <store> <path>...   queue an add_doc task");
    eprintln!("  chat <store> <text>         queue a chat task, print its query id");
    eprintln!("  size <queue>                number of queued items");
    eprintln!("  pop <queue> [timeout_ms]    pop one item");
    eprintln!("  drain <queue>               pop and print every item");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --config,   -f <path>   worker config (default: config/default.toml)");
    eprintln!("  --entities, -e <a,b>    entity vocabulary for add-doc");
    eprintln!("  --help,     -h          print this help");
    eprintln!();
    eprintln!("<queue> is one of task, response, chat, or a literal queue name");
}

enum Command {
    Push(String),
    Size(String),
    Pop { queue: String, timeout: Duration },
    Drain(String),
}

fn queue_name(config: &Config, alias: &str) -> String {
    match alias {
        "task" => config.queue.task_queue.clone(),
        "response" => config.queue.response_queue.clone(),
        "chat" => config.queue.chat_queue.clone(),
        other => other.to_string(),
    }
}

fn build_command(config: &Config, cmd: &str, rest: &[String], entities: &[String]) -> Result<Command, String> {
    match cmd {
        "push" => {
            let raw = rest.first().ok_or("usage: featurestore-ctl push <json>")?;
            serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| format!("message is not valid JSON: {e}"))?;
            Ok(Command::Push(raw.clone()))
        }
        "add-doc" => {
            let (store, paths) = rest
                .split_first()
                .filter(|(_, paths)| !paths.is_empty())
                .ok_or("usage: featurestore-ctl add-doc <store> <path>...")?;
            let task = json!({
                "type": "add_doc",
                "payload": {
                    "name": store,
                    "feature_store_id": store,
                    "path_list": paths,
                    "entities": entities,
                }
            });
            Ok(Command::Push(task.to_string()))
        }
        "chat" => {
            let [store, text @ ..] = rest else {
                return Err("usage: featurestore-ctl chat <store> <text>".into());
            };
            if text.is_empty() {
                return Err("usage: featurestore-ctl chat <store> <text>".into());
            }
            let query_id = uuid::Uuid::now_v7().to_string();
            println!("query_id {query_id}");
            let task = json!({
                "type": "chat",
                "payload": {
                    "query_id": query_id,
                    "feature_store_id": store,
                    "content": text.join(" "),
                    "images": [],
                    "history": [],
                }
            });
            Ok(Command::Push(task.to_string()))
        }
        "size" => {
            let q = rest.first().ok_or("usage: featurestore-ctl size <queue>")?;
            Ok(Command::Size(queue_name(config, q)))
        }
        "pop" => {
            let q = rest.first().ok_or("usage: featurestore-ctl pop <queue> [timeout_ms]")?;
            let ms = match rest.get(1) {
                Some(ms) => ms.parse::<u64>().map_err(|e| format!("bad timeout '{ms}': {e}"))?,
                None => 1000,
            };
            Ok(Command::Pop { queue: queue_name(config, q), timeout: Duration::from_millis(ms) })
        }
        "drain" => {
            let q = rest.first().ok_or("usage: featurestore-ctl drain <queue>")?;
            Ok(Command::Drain(queue_name(config, q)))
        }
        other => Err(format!("unknown command: {other}\n  run 'featurestore-ctl --help' for usage")),
    }
}

/// Pretty-print status records; anything else is printed raw.
fn print_item(item: &str) {
    match serde_json::from_str::<TaskStatus>(item) {
        Ok(s) => {
            let marker = match s.code {
                StatusCode::Success => "ok ",
                code if !code.is_terminal() => "...",
                _ => "   ",
            };
            println!("{marker} {} {} {:?}: {}", s.feature_store_id, s.task_type, s.code, s.status);
            for f in &s.files_state {
                println!("      [{}] {} {}", if f.status { "x" } else { " " }, f.file, f.desc);
            }
        }
        Err(_) => println!("{item}"),
    }
}

// ── Entry point ────────────────────────────────────────────────────────────

fn main() {
    let _ = dotenvy::dotenv();
    let args = parse_args();

    let Some(cmd_str) = args.command.clone() else {
        eprintln!("error: no command given");
        eprintln!("  run 'featurestore-ctl --help' for usage");
        process::exit(1);
    };

    let config = match config::load(args.config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let cmd = match build_command(&config, &cmd_str, &args.rest, &args.entities) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: {e}");
            process::exit(1);
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: tokio runtime: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(&config, cmd)) {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn run(config: &Config, cmd: Command) -> Result<(), String> {
    let queue = queue::open(&config.queue).map_err(|e| e.to_string())?;
    let q: &dyn DurableQueue = queue.as_ref();

    match cmd {
        Command::Push(item) => {
            q.push(&config.queue.task_queue, &item).await.map_err(|e| e.to_string())?;
            println!("ok  queued on {}", config.queue.task_queue);
        }
        Command::Size(name) => {
            let n = q.size(&name).await.map_err(|e| e.to_string())?;
            println!("{name} {n}");
        }
        Command::Pop { queue, timeout } => {
            match q.pop(&queue, true, Some(timeout)).await.map_err(|e| e.to_string())? {
                Some(item) => print_item(&item),
                None => println!("{queue} empty"),
            }
        }
        Command::Drain(name) => {
            let items = q.drain_all(&name).await.map_err(|e| e.to_string())?;
            for item in &items {
                print_item(item);
            }
            println!("{name} drained {}", items.len());
        }
    }
    Ok(())
}
