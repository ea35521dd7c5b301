//! `rusty-engine-cli`: a minimal interactive client for the coordinator's
//! HTTP client protocol, built on `reqwest` + `serde_json`.

use std::io::Write as _;

use serde_json::json;

const DEFAULT_URL: &str = "http://127.0.0.1:8080";

#[tokio::main]
async fn main() {
    println!("rusty-engine CLI ({})", rusty_engine::VERSION);

    let base_url = std::env::var("RUSTY_ENGINE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string());
    println!("coordinator: {base_url}");
    println!("type SQL or 'exit' to quit.\n");

    let client = reqwest::Client::new();
    let stdin = std::io::stdin();
    let mut input = String::new();

    loop {
        print!("rusty-engine> ");
        let _ = std::io::stdout().flush();

        input.clear();
        if stdin.read_line(&mut input).unwrap_or(0) == 0 {
            break;
        }
        let sql = input.trim();
        if sql.is_empty() {
            continue;
        }
        if sql.eq_ignore_ascii_case("exit") || sql.eq_ignore_ascii_case("quit") {
            break;
        }

        match submit(&client, &base_url, sql).await {
            Ok(response) => print_response(&response),
            Err(err) => eprintln!("error: {err}"),
        }
    }
}

async fn submit(client: &reqwest::Client, base_url: &str, sql: &str) -> reqwest::Result<serde_json::Value> {
    client.post(format!("{base_url}/v1/query")).json(&json!({ "sql": sql })).send().await?.json().await
}

fn print_response(response: &serde_json::Value) {
    let query_id = response.get("queryId").and_then(|v| v.as_str()).unwrap_or("?");
    let state = response.get("state").and_then(|v| v.as_str()).unwrap_or("?");
    println!("{query_id}: {state}");
    if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
        println!("  error: {error}");
    }
}
