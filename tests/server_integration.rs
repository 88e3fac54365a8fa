//! Integration tests against a real poliqarpd.
//!
//! # Requirements
//!
//! A running poliqarpd and an indexed corpus:
//! ```bash
//! poliqarpd &
//! export POLIQARP_TEST_CORPUS=/usr/share/poliqarp/frequency-list
//! ```
//!
//! # Running
//!
//! ```bash
//! cargo test --test server_integration -- --nocapture
//! ```
//!
//! Tests are skipped when `POLIQARP_TEST_CORPUS` is unset.

use std::time::Duration;

use poliqarp::{Client, ClientSettings, FindOptions};

fn test_corpus() -> Option<String> {
    std::env::var("POLIQARP_TEST_CORPUS").ok()
}

async fn connect() -> Client {
    let settings = ClientSettings {
        session_name: format!("RUST-TEST-{}", std::process::id()),
        wait_timeout: Some(Duration::from_secs(60)),
        ..ClientSettings::from_env()
    };
    Client::connect(settings)
        .await
        .expect("poliqarpd not reachable")
}

/// Test: ping and version roundtrip.
#[tokio::test]
async fn test_live_server_info() {
    if test_corpus().is_none() {
        eprintln!("Skipping: POLIQARP_TEST_CORPUS not set");
        return;
    }

    let mut client = connect().await;
    assert!(client.ping().await.unwrap());
    let version = client.version().await.unwrap();
    println!("Server version: {}", version);
    client.close().await.unwrap();
}

/// Test: paged results add up to the exact count.
#[tokio::test]
async fn test_live_pages_cover_count() {
    let Some(corpus) = test_corpus() else {
        eprintln!("Skipping: POLIQARP_TEST_CORPUS not set");
        return;
    };

    let mut client = connect().await;
    client.open_corpus(corpus.as_str()).await.unwrap();

    let total = client.count("[pos=subst]").await.unwrap();
    let options = FindOptions::page(50, 1);
    let mut page = client.find("[pos=subst]", &options).await.unwrap();
    let mut seen = page.len() as u64;
    while let Some(next) = page.next_page(&mut client).await.unwrap() {
        seen += next.len() as u64;
        page = next;
    }
    assert_eq!(seen, total);

    client.close().await.unwrap();
}
