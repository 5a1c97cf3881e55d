//! Scripted transport for tests.
//!
//! Replies and interrupts are queued ahead of time or produced by rules
//! that fire when a matching command is sent. Every sent line is recorded.
//! The state lives behind a shared handle so a test can keep inspecting it
//! after the transport has been boxed into the driver.

use handler_common::transport::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

struct Rule {
    prefix: String,
    reply: String,
    once: bool,
}

#[derive(Default)]
struct ScriptState {
    sent: Vec<String>,
    replies: VecDeque<Result<String, TransportError>>,
    interrupts: VecDeque<u8>,
    rules: Vec<Rule>,
    raises: Vec<(String, u8)>,
    send_failure: Option<TransportError>,
}

/// Transport driven by a script.
pub struct ScriptedTransport {
    state: Arc<Mutex<ScriptState>>,
}

/// Shared view of a [`ScriptedTransport`].
#[derive(Clone)]
pub struct ScriptHandle {
    state: Arc<Mutex<ScriptState>>,
}

fn lock(state: &Mutex<ScriptState>) -> MutexGuard<'_, ScriptState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedTransport {
    /// Empty script: every receive times out, no interrupts.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Handle for scripting and inspection.
    pub fn handle(&self) -> ScriptHandle {
        ScriptHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ScriptedTransport {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn send(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if let Some(err) = state.send_failure.take() {
            return Err(err);
        }
        state.sent.push(command.to_string());
        let line = command.trim_end();
        if let Some(idx) = state
            .rules
            .iter()
            .position(|rule| line.starts_with(rule.prefix.as_str()))
        {
            let reply = state.rules[idx].reply.clone();
            if state.rules[idx].once {
                state.rules.remove(idx);
            }
            state.replies.push_back(Ok(reply));
        }
        if let Some(idx) = state
            .raises
            .iter()
            .position(|(prefix, _)| line.starts_with(prefix.as_str()))
        {
            let (_, code) = state.raises.remove(idx);
            state.interrupts.push_back(code);
        }
        Ok(())
    }

    fn receive(&mut self, _timeout: Duration) -> Result<String, TransportError> {
        lock(&self.state)
            .replies
            .pop_front()
            .unwrap_or(Err(TransportError::Timeout))
    }

    fn poll_interrupt(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(lock(&self.state).interrupts.pop_front())
    }
}

impl ScriptHandle {
    /// Queue a reply line.
    pub fn push_reply(&self, reply: &str) {
        lock(&self.state).replies.push_back(Ok(reply.to_string()));
    }

    /// Queue a receive error.
    pub fn push_error(&self, err: TransportError) {
        lock(&self.state).replies.push_back(Err(err));
    }

    /// Queue an interrupt byte.
    pub fn push_interrupt(&self, code: u8) {
        lock(&self.state).interrupts.push_back(code);
    }

    /// Reply with `reply` every time a command starting with `prefix` is sent.
    pub fn respond(&self, prefix: &str, reply: &str) {
        lock(&self.state).rules.push(Rule {
            prefix: prefix.to_string(),
            reply: reply.to_string(),
            once: false,
        });
    }

    /// Reply with `reply` the next time a command starting with `prefix` is
    /// sent. One-shot rules added before a persistent rule take precedence.
    pub fn respond_once(&self, prefix: &str, reply: &str) {
        let mut state = lock(&self.state);
        let at = state.rules.iter().position(|r| !r.once).unwrap_or(state.rules.len());
        state.rules.insert(
            at,
            Rule {
                prefix: prefix.to_string(),
                reply: reply.to_string(),
                once: true,
            },
        );
    }

    /// Raise interrupt `code` once, after a command starting with `prefix`
    /// is sent.
    pub fn raise_on(&self, prefix: &str, code: u8) {
        lock(&self.state).raises.push((prefix.to_string(), code));
    }

    /// Make the next send fail.
    pub fn fail_next_send(&self, err: TransportError) {
        lock(&self.state).send_failure = Some(err);
    }

    /// Every line sent so far, terminators included.
    pub fn sent(&self) -> Vec<String> {
        lock(&self.state).sent.clone()
    }

    /// Every line sent so far, terminators stripped.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.state)
            .sent
            .iter()
            .map(|line| line.trim_end().to_string())
            .collect()
    }

    /// Number of sent lines starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        lock(&self.state)
            .sent
            .iter()
            .filter(|line| line.starts_with(prefix))
            .count()
    }

    /// Forget recorded sends.
    pub fn clear_sent(&self) {
        lock(&self.state).sent.clear();
    }

    /// Interrupts not yet taken.
    pub fn pending_interrupts(&self) -> usize {
        lock(&self.state).interrupts.len()
    }
}
