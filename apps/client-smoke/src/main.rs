//! Offline smoke run: drives the client core against a scripted
//! transport and prints what a UI would observe.

mod logging;

use client_core::{Client, ClientConfig, PageMode, ViewName};
use client_transport::{RawFailure, ScriptedTransport};
use serde_json::json;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let transport = ScriptedTransport::new();
    script_session(&transport);
    let client = Client::new(transport.clone(), config, "user-1");
    tracing::info!("client context ready, starting scripted session");

    if let Err(err) = client.load_view(&ViewName::Feed, PageMode::Replace).await {
        eprintln!("Feed load failed: {err}");
        std::process::exit(1);
    }
    let feed = client
        .store()
        .view_snapshot(&ViewName::Feed)
        .map(|snapshot| snapshot.ordered_ids)
        .unwrap_or_default();
    println!("Feed loaded: {} listings", feed.len());

    // Optimistic like against a flaky endpoint: first attempt returns a
    // 500, the retry confirms.
    match client.toggle_like("post-1", &ViewName::Feed).await {
        Ok(()) => {
            let post = client.store().post("post-1");
            println!(
                "Liked post-1 (like_count now {})",
                post.map(|p| p.like_count).unwrap_or_default()
            );
        }
        Err(err) => println!("Like failed and was rolled back: {err}"),
    }

    match client.send_message("conv-1", "is it still available?").await {
        Ok(message_id) => println!("Message sent as {message_id}"),
        Err(err) => println!("Message send failed: {err}"),
    }

    let report = client.error_report();
    println!(
        "Diagnostics: {} errors total, {} retryable, breaker {:?}",
        report.total_errors,
        report.retryable_errors,
        client.breaker_state()
    );

    client.shutdown().await;
}

fn script_session(transport: &ScriptedTransport) {
    transport.push_ok(json!({
        "items": [
            {"id": "post-1", "title": "City bike", "seller_id": "user-7", "like_count": 12},
            {"id": "post-2", "title": "Desk lamp", "seller_id": "user-8", "like_count": 3},
        ],
        "has_more": false,
    }));
    transport.push_failure(RawFailure::http(500, "like service hiccup"));
    transport.push_ok(json!({}));
    transport.push_ok(json!({
        "id": "msg-100",
        "conversation_id": "conv-1",
        "sender_id": "user-1",
        "body": "is it still available?",
        "sent_at_ms": 0,
    }));
}
