//! In-process stand-ins for the remote service and the token endpoint

use async_trait::async_trait;
use batch_dispatch::{Dispatcher, Error, Response, Result, TokenSource, TransportError};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

/// Issues `"Bearer t<n>"` on the n-th exchange
#[derive(Default)]
pub struct SequentialTokens {
    calls: AtomicU32,
    succeed_times: Option<u32>,
}

impl SequentialTokens {
    /// Token source whose exchanges fail after the first `times`
    pub fn failing_after(times: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            succeed_times: Some(times),
        }
    }

    /// Exchanges performed so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for SequentialTokens {
    async fn exchange(&self) -> Result<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match self.succeed_times {
            Some(times) if n > times => Err(Error::CredentialExchange(
                "503 token service unavailable".to_string(),
            )),
            _ => Ok(format!("Bearer t{}", n)),
        }
    }
}

/// One call seen by a [`RecordingDispatcher`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentRequest {
    /// Value of the payload's `ID` field
    pub id: String,
    /// `Authorization` header value
    pub authorization: String,
}

type Responder = Box<dyn Fn(&str, u32) -> u16 + Send + Sync>;
type Failure = Box<dyn Fn(&str, u32) -> Option<TransportError> + Send + Sync>;

/// Answers every call with a status chosen by a closure of (record ID, call number for that ID)
pub struct RecordingDispatcher {
    respond: Responder,
    fail: Failure,
    delay: Box<dyn Fn(&str) -> Duration + Send + Sync>,
    sent: Mutex<Vec<SentRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl RecordingDispatcher {
    /// Dispatcher answering with `respond(id, nth_call_for_id)`
    pub fn new(respond: impl Fn(&str, u32) -> u16 + Send + Sync + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            fail: Box::new(|_, _| None),
            delay: Box::new(|_| Duration::ZERO),
            sent: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Dispatcher accepting every record
    pub fn accepting() -> Self {
        Self::new(|_, _| 200)
    }

    /// Wait `delay(id)` before answering
    pub fn with_delay(mut self, delay: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        self.delay = Box::new(delay);
        self
    }

    /// Fail the call with `fail(id, nth)` instead of answering, when it returns an error
    pub fn with_failure(
        mut self,
        fail: impl Fn(&str, u32) -> Option<TransportError> + Send + Sync + 'static,
    ) -> Self {
        self.fail = Box::new(fail);
        self
    }

    /// Every call, in send order
    pub fn sent(&self) -> Vec<SentRequest> {
        self.sent.lock().expect("sent lock").clone()
    }

    /// Highest number of concurrent calls observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn send(
        &self,
        payload: &serde_json::Value,
        authorization: &str,
    ) -> std::result::Result<Response, TransportError> {
        let id = payload["ID"].as_str().unwrap_or_default().to_string();
        let nth = {
            let mut sent = self.sent.lock().expect("sent lock");
            let nth = sent.iter().filter(|r| r.id == id).count() as u32 + 1;
            sent.push(SentRequest {
                id: id.clone(),
                authorization: authorization.to_string(),
            });
            nth
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep((self.delay)(&id)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(error) = (self.fail)(&id, nth) {
            return Err(error);
        }
        Ok(Response::new((self.respond)(&id, nth), ""))
    }
}
