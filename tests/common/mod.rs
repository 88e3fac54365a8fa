//! In-process fake poliqarpd for integration tests.
//!
//! The fake speaks the line protocol over a `tokio::io::duplex` pair and
//! records every command it receives, so tests can assert on exactly what
//! went over the wire.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use poliqarp::{Client, ClientSettings};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

/// One token with its readings as `(base form, tag)`.
#[derive(Clone)]
pub struct FakeSegment {
    pub literal: String,
    pub readings: Vec<(String, String)>,
}

pub fn seg(literal: &str, readings: &[(&str, &str)]) -> FakeSegment {
    FakeSegment {
        literal: literal.to_string(),
        readings: readings
            .iter()
            .map(|(base, tag)| (base.to_string(), tag.to_string()))
            .collect(),
    }
}

#[derive(Clone)]
pub struct FakeExcerpt {
    pub left: Vec<FakeSegment>,
    pub matched: Vec<FakeSegment>,
    pub right: Vec<FakeSegment>,
}

/// Knobs for misbehaving servers.
#[derive(Clone, Default)]
pub struct Behaviour {
    /// Answer the first `MAKE-QUERY` with "job in progress".
    pub busy_once: bool,
    /// Never send the `RUN-QUERY` milestone.
    pub withhold_milestone: bool,
    /// `BUFFER-STATE` reveals this many more results per poll instead of
    /// all of them at once.
    pub reveal_per_poll: Option<usize>,
    /// Answer `CANCEL` with an error.
    pub cancel_fails: bool,
    /// Delay the reply to `VERSION`.
    pub version_delay: Option<Duration>,
    /// Send a non-numeric segment count in the `GET-RESULTS` body.
    pub corrupt_results: bool,
}

/// Shared log of commands received by the fake server.
#[derive(Clone, Default)]
pub struct CommandLog(Arc<Mutex<Vec<String>>>);

impl CommandLog {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    /// Commands received after the first `from` entries.
    pub fn since(&self, from: usize) -> Vec<String> {
        self.0.lock().unwrap()[from..].to_vec()
    }

    /// Number of commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    fn push(&self, command: String) {
        self.0.lock().unwrap().push(command);
    }
}

/// The six results of `kot` in the fake corpus.
pub fn kot_results() -> Vec<FakeExcerpt> {
    (0..6)
        .map(|i| FakeExcerpt {
            left: vec![
                seg("Ala", &[("Ala", "subst:sg:nom:f")]),
                seg(
                    "ma",
                    &[("mieć", "fin:sg:ter:imperf"), ("mój", "adj:sg:nom:f:pos")],
                ),
            ],
            matched: vec![seg(&format!("kota{}", i), &[("kot", "subst:sg:acc:m2")])],
            right: vec![seg(".", &[(".", "interp")])],
        })
        .collect()
}

pub fn corpus() -> HashMap<String, Vec<FakeExcerpt>> {
    let mut corpus = HashMap::new();
    corpus.insert("kot".to_string(), kot_results());
    corpus.insert("pies".to_string(), kot_results()[..2].to_vec());
    corpus
}

pub fn test_settings() -> ClientSettings {
    ClientSettings {
        session_name: "TEST".to_string(),
        poll_interval: Duration::from_millis(5),
        wait_timeout: Some(Duration::from_secs(2)),
        ..ClientSettings::default()
    }
}

/// Start a fake server and a client attached to it.
pub async fn start(behaviour: Behaviour) -> (Client, CommandLog) {
    start_with(behaviour, test_settings()).await
}

pub async fn start_with(behaviour: Behaviour, settings: ClientSettings) -> (Client, CommandLog) {
    let (client_end, server_end) = tokio::io::duplex(64 * 1024);
    let log = CommandLog::default();
    tokio::spawn(serve(server_end, corpus(), behaviour, log.clone()));

    let client = Client::attach(client_end, settings)
        .await
        .expect("session setup failed");
    (client, log)
}

struct ServerState {
    corpus: HashMap<String, Vec<FakeExcerpt>>,
    behaviour: Behaviour,
    busy_used: bool,
    query: Option<String>,
    polls: usize,
    tags: [bool; 4],
    lemmata: [bool; 4],
}

impl ServerState {
    fn results(&self) -> &[FakeExcerpt] {
        self.query
            .as_ref()
            .and_then(|q| self.corpus.get(q))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

fn flags(value: &str) -> [bool; 4] {
    let mut flags = [false; 4];
    for (i, c) in value.chars().take(4).enumerate() {
        flags[i] = c == '1';
    }
    flags
}

async fn serve(
    stream: DuplexStream,
    corpus: HashMap<String, Vec<FakeExcerpt>>,
    behaviour: Behaviour,
    log: CommandLog,
) {
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut state = ServerState {
        corpus,
        behaviour,
        busy_used: false,
        query: None,
        polls: 0,
        tags: [false; 4],
        lemmata: [false; 4],
    };

    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {}
        }
        let command = line.trim_end().to_string();
        log.push(command.clone());

        let out = respond(&mut state, &command);
        if let (Some(delay), "VERSION") = (state.behaviour.version_delay, command.as_str()) {
            tokio::time::sleep(delay).await;
        }
        if writer.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn respond(state: &mut ServerState, command: &str) -> String {
    let (verb, args) = command.split_once(' ').unwrap_or((command, ""));
    let mut out = String::new();
    let mut reply = |text: &str| {
        out.push_str("R ");
        out.push_str(text);
        out.push('\n');
    };

    match verb {
        "MAKE-SESSION" => reply("OK 1"),
        "BUFFER-RESIZE" | "CLOSE" | "CLOSE-SESSION" => reply("OK"),
        "CANCEL" => {
            if state.behaviour.cancel_fails {
                reply("ERR 14");
            } else {
                reply("OK");
            }
        }
        "SET" => {
            let (option, value) = args.split_once(' ').unwrap_or((args, ""));
            match option {
                "retrieve-tags" => state.tags = flags(value),
                "retrieve-lemmata" => state.lemmata = flags(value),
                _ => {}
            }
            reply("OK");
        }
        "OPEN" => {
            reply("OK");
            if args.contains("missing") {
                out.push_str("M ERR 12\n");
            } else if args.contains("slow") {
                // Still loading: no milestone yet.
            } else {
                out.push_str("M OPENED\n");
            }
        }
        "MAKE-QUERY" => {
            if state.behaviour.busy_once && !state.busy_used {
                state.busy_used = true;
                reply("ERR 15");
            } else if args == "[" {
                reply("ERR 16");
            } else {
                state.query = Some(args.to_string());
                state.polls = 0;
                reply("OK");
            }
        }
        "RUN-QUERY" => {
            let capacity: usize = args.parse().unwrap_or(0);
            let count = state.results().len().min(capacity);
            reply("OK");
            if !state.behaviour.withhold_milestone {
                out.push_str(&format!("M QUERY-DONE {}\n", count));
            }
        }
        "BUFFER-STATE" => {
            state.polls += 1;
            let total = state.results().len();
            let count = match state.behaviour.reveal_per_poll {
                Some(step) => total.min(step * state.polls),
                None => total,
            };
            reply(&format!("OK 500000 {}", count));
        }
        "GET-RESULTS" => {
            let mut bounds = args.split_whitespace().map(|n| n.parse::<usize>().unwrap());
            let (from, to) = (bounds.next().unwrap(), bounds.next().unwrap());
            if to >= state.results().len() || from > to {
                reply("ERR 17");
            } else {
                reply("OK");
                if state.behaviour.corrupt_results {
                    reply("x");
                }
                let (tags, lemmata) = (state.tags, state.lemmata);
                for excerpt in &state.results()[from..=to] {
                    for (segments, group) in [(&excerpt.left, 0), (&excerpt.matched, 1), (&excerpt.right, 3)] {
                        reply(&segments.len().to_string());
                        for segment in segments {
                            reply(&segment.literal);
                            if tags[group] || lemmata[group] {
                                reply(&segment.readings.len().to_string());
                                for (base, tag) in &segment.readings {
                                    if lemmata[group] {
                                        reply(base);
                                    }
                                    if tags[group] {
                                        reply(tag);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
        "GET-CONTEXT" => {
            reply("OK");
            reply("Ala ma");
            reply("kota");
            reply("");
            reply("i psa.");
        }
        "METADATA" => {
            reply("OK 3");
            reply("autor");
            reply("T Mickiewicz");
            reply("tytuł");
            reply("T Pan Tadeusz");
            reply("autor:");
            reply("T Anonim");
        }
        "PING" => reply("PONG"),
        "VERSION" => reply("poliqarpd 1.3.11"),
        "CORPUS-STATS" => reply("OK 1000 400 300 120"),
        "GET-TAGSET" => {
            reply("OK 2 1");
            reply("number sg pl");
            reply("gender m1 m2 m3 f n");
            reply("subst number case gender");
        }
        _ => reply("ERR 1"),
    }
    out
}
