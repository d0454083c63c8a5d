//! Scripted in-process remote service used by tests and local demos.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{
    EventStream, HistoryEntry, PromptAccepted, PromptRequest, QueueSnapshot, RemoteError,
    RemoteEvent, RemoteService,
};

#[derive(Default)]
struct MockState {
    /// Base URLs (`http://host:port`) that answer probes.
    healthy: HashSet<String>,
    probed: Vec<String>,
    submit_script: VecDeque<Result<PromptAccepted, RemoteError>>,
    submitted: Vec<(String, PromptRequest)>,
    history_script: VecDeque<Result<Option<HistoryEntry>, RemoteError>>,
    history_calls: u32,
    queue: QueueSnapshot,
    queue_calls: u32,
    events: Vec<RemoteEvent>,
    subscriptions: Vec<String>,
    next_prompt: u64,
}

pub struct MockRemote {
    state: Mutex<MockState>,
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

fn base_of(url: &str) -> String {
    // http://host:port/path -> http://host:port
    let after_scheme = url.find("://").map(|i| i + 3).unwrap_or(0);
    match url[after_scheme..].find('/') {
        Some(i) => url[..after_scheme + i].to_string(),
        None => url.to_string(),
    }
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn set_healthy(&self, base_url: &str) {
        self.with_state(|s| {
            s.healthy.insert(base_url.trim_end_matches('/').to_string());
        });
    }

    pub fn set_unhealthy(&self, base_url: &str) {
        self.with_state(|s| {
            s.healthy.remove(base_url.trim_end_matches('/'));
        });
    }

    /// Every probed URL, path included, in call order.
    pub fn probed_urls(&self) -> Vec<String> {
        self.with_state(|s| s.probed.clone())
    }

    /// Distinct probed base URLs in first-probe order.
    pub fn probed_bases(&self) -> Vec<String> {
        self.with_state(|s| {
            let mut out: Vec<String> = Vec::new();
            for u in &s.probed {
                let b = base_of(u);
                if !out.contains(&b) {
                    out.push(b);
                }
            }
            out
        })
    }

    pub fn push_submit_result(&self, result: Result<PromptAccepted, RemoteError>) {
        self.with_state(|s| s.submit_script.push_back(result));
    }

    pub fn submitted(&self) -> Vec<(String, PromptRequest)> {
        self.with_state(|s| s.submitted.clone())
    }

    /// Queue one history answer. Once the script runs out every call returns `Ok(None)`.
    pub fn push_history(&self, result: Result<Option<HistoryEntry>, RemoteError>) {
        self.with_state(|s| s.history_script.push_back(result));
    }

    pub fn history_calls(&self) -> u32 {
        self.with_state(|s| s.history_calls)
    }

    pub fn set_queue(&self, queue: QueueSnapshot) {
        self.with_state(|s| s.queue = queue);
    }

    pub fn queue_calls(&self) -> u32 {
        self.with_state(|s| s.queue_calls)
    }

    /// Events replayed to every subscriber.
    pub fn set_events(&self, events: Vec<RemoteEvent>) {
        self.with_state(|s| s.events = events);
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.with_state(|s| s.subscriptions.clone())
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn probe(&self, url: &str) -> Result<bool, RemoteError> {
        self.with_state(|s| {
            s.probed.push(url.to_string());
            if s.healthy.contains(&base_of(url)) {
                Ok(true)
            } else {
                Err(RemoteError::Transport(format!("connection refused: {}", url)))
            }
        })
    }

    async fn submit_prompt(
        &self,
        base_url: &str,
        request: &PromptRequest,
    ) -> Result<PromptAccepted, RemoteError> {
        self.with_state(|s| {
            s.submitted.push((base_url.to_string(), request.clone()));
            match s.submit_script.pop_front() {
                Some(result) => result,
                None => {
                    s.next_prompt += 1;
                    Ok(PromptAccepted {
                        prompt_id: format!("mock-prompt-{}", s.next_prompt),
                        number: Some(s.next_prompt),
                    })
                }
            }
        })
    }

    async fn fetch_queue(&self, _base_url: &str) -> Result<QueueSnapshot, RemoteError> {
        self.with_state(|s| {
            s.queue_calls += 1;
            Ok(s.queue.clone())
        })
    }

    async fn fetch_history(
        &self,
        _base_url: &str,
        _prompt_id: &str,
    ) -> Result<Option<HistoryEntry>, RemoteError> {
        self.with_state(|s| {
            s.history_calls += 1;
            s.history_script.pop_front().unwrap_or(Ok(None))
        })
    }

    async fn subscribe_events(
        &self,
        _base_url: &str,
        client_id: &str,
    ) -> Result<EventStream, RemoteError> {
        let events = self.with_state(|s| {
            s.subscriptions.push(client_id.to_string());
            s.events.clone()
        });
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}
