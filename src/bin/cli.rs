use plotplot::{Body, Config, CsvLoader, Dispatch, MemoryStore, Seed, Services, Source};
use serde_json::Value;
use std::env;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn print_body(body: Body) {
    match body {
        Body::Json(v) => match serde_json::to_string_pretty(&v) {
            Ok(s) => println!("{}", s),
            Err(_) => println!("{}", v),
        },
        Body::Text(s) => print!("{}", s),
    }
}

fn is_error(body: &Body) -> bool {
    body.as_json().is_some_and(|v| v.get("error").is_some())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 || args.len() > 3 {
        eprintln!("Usage: {} <data.csv> [config.json]", args[0]);
        return Ok(());
    }

    let config = match args.get(2) {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env(),
    };
    let services = Services {
        config: Arc::new(config),
        loader: Arc::new(CsvLoader),
        fetcher: None,
    };
    let dispatch = Dispatch::new(services, Arc::new(MemoryStore::new()));
    let session = dispatch.launch(
        None,
        Source::Local(PathBuf::from(&args[1])),
        Seed::default(),
    )?;
    println!("Session {}", session);

    let mut start_time = Instant::now();
    let mut status = String::from("ok");
    loop {
        print!("[{:.1}] ({}) > ", start_time.elapsed().as_secs_f64(), status);
        io::stdout().flush()?;

        let mut command = String::new();
        if io::stdin().read_line(&mut command)? == 0 {
            break;
        }
        let command = command.trim();
        start_time = Instant::now();

        match command {
            "" => continue,
            "q" => break,
            "help" => {
                println!("Commands:");
                println!("  q: Quit");
                println!("  wait: Block until the dataset has loaded");
                println!("  <function_name> [json args]: Call a worker function, e.g.");
                println!("    plot_json {{\"x\": \"a\", \"y\": \"b\", \"subsets\": [0]}}");
                continue;
            }
            "wait" => {
                loop {
                    let body = dispatch.call(&session, "processing_progress", Value::Null);
                    let v = body.into_json();
                    if v["done"] == Value::Bool(true) || v.get("error").is_some() {
                        println!("{}", v);
                        break;
                    }
                    thread::sleep(Duration::from_millis(200));
                }
                status = String::from("ok");
                continue;
            }
            _ => {}
        }

        let (name, rest) = command.split_once(' ').unwrap_or((command, ""));
        let call_args: Value = if rest.trim().is_empty() {
            Value::Null
        } else {
            match serde_json::from_str(rest) {
                Ok(v) => v,
                Err(e) => {
                    eprintln!("Invalid JSON arguments: {}", e);
                    status = String::from("invalid command");
                    continue;
                }
            }
        };

        let body = dispatch.call(&session, name, call_args);
        status = if is_error(&body) { "error" } else { "ok" }.to_string();
        print_body(body);

        if !dispatch.is_live(&session) {
            eprintln!("Session has shut down.");
            break;
        }
    }
    Ok(())
}
