//! Input files, configurations and report helpers

use batch_dispatch::config::{CredentialConfig, DispatchConfig, EndpointConfig, RetryConfig};
use batch_dispatch::{Config, Event, MemorySink, RecordSchema};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::broadcast;

/// Person records: ID, first name, last name
pub const PERSON_FIELDS: [&str; 3] = ["ID", "FIRST_NAME", "LAST_NAME"];

/// Write `contents` to a fresh temporary input file
pub fn input_file(contents: &str) -> NamedTempFile {
    let file = NamedTempFile::new().expect("create input file");
    std::fs::write(file.path(), contents).expect("write input file");
    file
}

/// Input file with `count` person lines whose IDs are 1..=count
pub fn person_input(count: usize) -> NamedTempFile {
    let contents: String = (1..=count)
        .map(|id| format!("{}\tFirst{}\tLast{}\n", id, id, id))
        .collect();
    input_file(&contents)
}

/// Valid configuration pointing at the given token and dispatch URLs
pub fn test_config(token_url: &str, endpoint_url: &str, workers: usize) -> Config {
    Config {
        dispatch: DispatchConfig {
            workers,
            chunk_size: 16,
            ..Default::default()
        },
        retry: RetryConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            jitter: false,
            ..Default::default()
        },
        credentials: CredentialConfig {
            token_url: token_url.to_string(),
            client_id: "Admin".to_string(),
            client_secret: "123456".to_string(),
            timeout: Duration::from_secs(5),
        },
        endpoint: EndpointConfig {
            url: endpoint_url.to_string(),
            timeout: Duration::from_secs(5),
        },
        schema: RecordSchema::new('\t', PERSON_FIELDS),
        ..Default::default()
    }
}

/// Configuration for runs with mock collaborators (URLs are never contacted)
pub fn offline_config(workers: usize) -> Config {
    test_config("http://localhost/token", "http://localhost/api", workers)
}

/// Per-record report lines (`<line>\t<OUTCOME>\t<attempts>\t<detail>`)
pub fn record_lines(sink: &MemorySink) -> Vec<String> {
    sink.lines()
        .into_iter()
        .filter(|line| line.split('\t').count() == 4)
        .collect()
}

/// Line numbers of the per-record report lines, in report order
pub fn reported_line_numbers(sink: &MemorySink) -> Vec<u64> {
    record_lines(sink)
        .iter()
        .filter_map(|line| line.split('\t').next()?.parse().ok())
        .collect()
}

/// Drain every event already sent on `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
