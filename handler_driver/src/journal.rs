//! Transaction journal.
//!
//! Every top-level driver operation talks to the handler through the
//! journal. Each send, receive and interrupt is recorded as a [`Step`].
//! When an operation returns `Waiting` the journal is kept, and the next
//! invocation of the same operation replays it: a send that matches the
//! recorded step is not transmitted again, a recorded reply or interrupt is
//! returned again without touching the wire. The first step that differs
//! from the recording truncates the rest and executes for real.
//!
//! Marks allow a sub-sequence to be rolled back so it executes again for
//! real (bin echo retries), and single steps can be removed so a malformed
//! query/reply pair is re-sent on the next call.

use handler_common::transport::{Transport, TransportError};
use std::time::Duration;
use tracing::{debug, trace};

/// One recorded exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Command line, terminator included.
    Send(String),
    /// Reply line.
    Receive(String),
    /// Interrupt byte.
    Interrupt(u8),
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct JournalStats {
    /// Commands written to the transport.
    pub sent: u64,
    /// Replies read from the transport.
    pub received: u64,
    /// Interrupts taken from the transport.
    pub interrupts: u64,
    /// Steps served from the recording.
    pub replayed: u64,
    /// Interrupts discarded by flushing.
    pub flushed: u64,
}

/// Transaction journal wrapping the transport.
pub struct Journal {
    transport: Box<dyn Transport>,
    steps: Vec<Step>,
    marks: Vec<usize>,
    cursor: usize,
    stats: JournalStats,
}

impl Journal {
    /// Wrap a transport.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            steps: Vec::new(),
            marks: Vec::new(),
            cursor: 0,
            stats: JournalStats::default(),
        }
    }

    /// Name of the underlying transport.
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Begin (or resume) an operation: rewind to the first recorded step.
    pub fn start(&mut self) {
        if !self.steps.is_empty() {
            debug!(steps = self.steps.len(), "Resuming operation from journal");
        }
        self.cursor = 0;
        self.marks.clear();
    }

    /// Operation finished: forget the recording.
    pub fn stop(&mut self) {
        self.steps.clear();
        self.marks.clear();
        self.cursor = 0;
    }

    /// Operation abandoned (abort): forget the recording.
    pub fn discard(&mut self) {
        if !self.steps.is_empty() {
            debug!(steps = self.steps.len(), "Discarding journal");
        }
        self.stop();
    }

    /// True while recorded steps remain to be replayed.
    #[inline]
    pub fn replaying(&self) -> bool {
        self.cursor < self.steps.len()
    }

    /// Number of recorded steps.
    #[inline]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if nothing is recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Recorded steps, oldest first.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Diagnostics counters.
    pub fn stats(&self) -> JournalStats {
        self.stats
    }

    /// Remember the current position for [`Journal::remove_to_mark`].
    pub fn mark(&mut self) {
        self.marks.push(self.cursor);
    }

    /// Drop every step after the most recent mark and remove the mark.
    /// Without a mark the whole recording is dropped.
    pub fn remove_to_mark(&mut self) {
        let pos = self.marks.pop().unwrap_or(0).min(self.steps.len());
        trace!(removed = self.steps.len() - pos, "Rolling back journal to mark");
        self.steps.truncate(pos);
        self.cursor = pos;
    }

    /// Remove the most recent step before the cursor.
    pub fn remove_step(&mut self) {
        if self.cursor == 0 {
            return;
        }
        self.cursor -= 1;
        let step = self.steps.remove(self.cursor);
        for mark in self.marks.iter_mut().filter(|m| **m > self.cursor) {
            *mark -= 1;
        }
        trace!(?step, "Removed journal step");
    }

    fn diverge(&mut self) {
        if self.cursor < self.steps.len() {
            debug!(
                at = self.cursor,
                dropped = self.steps.len() - self.cursor,
                "Operation diverged from journal"
            );
            self.steps.truncate(self.cursor);
        }
    }

    fn record(&mut self, step: Step) {
        self.steps.push(step);
        self.cursor = self.steps.len();
    }

    /// Send a command line unless the identical command is recorded next.
    pub fn send(&mut self, line: &str) -> Result<(), TransportError> {
        if let Some(Step::Send(recorded)) = self.steps.get(self.cursor) {
            if recorded == line {
                trace!(command = line.trim_end(), "Replayed send");
                self.cursor += 1;
                self.stats.replayed += 1;
                return Ok(());
            }
        }
        self.diverge();
        debug!(command = line.trim_end(), "-> handler");
        self.transport.send(line)?;
        self.stats.sent += 1;
        self.record(Step::Send(line.to_string()));
        Ok(())
    }

    /// Receive a reply line, or return the recorded one.
    pub fn receive(&mut self, timeout: Duration) -> Result<String, TransportError> {
        if let Some(Step::Receive(recorded)) = self.steps.get(self.cursor) {
            let reply = recorded.clone();
            trace!(reply = %reply, "Replayed receive");
            self.cursor += 1;
            self.stats.replayed += 1;
            return Ok(reply);
        }
        self.diverge();
        let reply = self.transport.receive(timeout)?;
        debug!(reply = %reply, "<- handler");
        self.stats.received += 1;
        self.record(Step::Receive(reply.clone()));
        Ok(reply)
    }

    /// Wait for an interrupt, or return the recorded one.
    pub fn poll_interrupt(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        if let Some(Step::Interrupt(code)) = self.steps.get(self.cursor) {
            let code = *code;
            trace!(code = format_args!("0x{code:02X}"), "Replayed interrupt");
            self.cursor += 1;
            self.stats.replayed += 1;
            return Ok(Some(code));
        }
        self.diverge();
        let code = self.transport.poll_interrupt(timeout)?;
        if let Some(code) = code {
            debug!(code = format_args!("0x{code:02X}"), "<- interrupt");
            self.stats.interrupts += 1;
            self.record(Step::Interrupt(code));
        }
        Ok(code)
    }

    /// Discard pending interrupts without recording them.
    ///
    /// Does nothing while replaying, so a resumed operation never flushes
    /// signals that arrived after its first run. At most `max` interrupts
    /// are taken.
    pub fn flush_interrupts(&mut self, max: usize) -> Result<usize, TransportError> {
        if self.replaying() {
            return Ok(0);
        }
        let mut flushed = 0;
        while flushed < max {
            match self.transport.poll_interrupt(Duration::ZERO)? {
                Some(code) => {
                    trace!(code = format_args!("0x{code:02X}"), "Flushed interrupt");
                    flushed += 1;
                }
                None => break,
            }
        }
        self.stats.flushed += flushed as u64;
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::scripted::ScriptedTransport;

    fn journal() -> (Journal, crate::transport::scripted::ScriptHandle) {
        let transport = ScriptedTransport::new();
        let handle = transport.handle();
        (Journal::new(Box::new(transport)), handle)
    }

    const T: Duration = Duration::from_millis(10);

    #[test]
    fn records_and_clears() {
        let (mut j, h) = journal();
        h.push_reply("Fullsites 00000003");
        j.start();
        j.send("FULLSITES?\r\n").unwrap();
        assert_eq!(j.receive(T).unwrap(), "Fullsites 00000003");
        assert_eq!(j.len(), 2);
        j.stop();
        assert!(j.is_empty());
        assert_eq!(h.sent(), vec!["FULLSITES?\r\n".to_string()]);
    }

    #[test]
    fn replay_skips_identical_sends() {
        let (mut j, h) = journal();
        h.push_reply("ECHO:01");
        j.start();
        j.send("BINON:01;\r\n").unwrap();
        j.send("ECHO?\r\n").unwrap();
        assert!(j.receive(T).is_ok());
        // reply to the second query never arrived
        assert_eq!(j.receive(T), Err(TransportError::Timeout));

        j.start();
        assert!(j.replaying());
        j.send("BINON:01;\r\n").unwrap();
        j.send("ECHO?\r\n").unwrap();
        assert_eq!(j.receive(T).unwrap(), "ECHO:01");
        assert!(!j.replaying());
        assert_eq!(h.sent().len(), 2);
        assert_eq!(j.stats().replayed, 3);
    }

    #[test]
    fn divergence_truncates_and_executes() {
        let (mut j, h) = journal();
        j.start();
        j.send("A\n").unwrap();
        j.send("B\n").unwrap();

        j.start();
        j.send("A\n").unwrap();
        j.send("C\n").unwrap();
        assert_eq!(j.steps(), &[Step::Send("A\n".into()), Step::Send("C\n".into())]);
        assert_eq!(h.sent(), vec!["A\n", "B\n", "C\n"]);
    }

    #[test]
    fn interrupts_replay() {
        let (mut j, h) = journal();
        h.push_interrupt(0x41);
        j.start();
        assert_eq!(j.poll_interrupt(T).unwrap(), Some(0x41));
        j.start();
        assert_eq!(j.poll_interrupt(T).unwrap(), Some(0x41));
        assert_eq!(j.poll_interrupt(T).unwrap(), None);
        assert_eq!(j.len(), 1);
    }

    #[test]
    fn remove_to_mark_rolls_back() {
        let (mut j, _h) = journal();
        j.start();
        j.send("SETUP\n").unwrap();
        j.mark();
        j.send("BIN 1 5\n").unwrap();
        j.send("BIN 2 6\n").unwrap();
        j.remove_to_mark();
        assert_eq!(j.steps(), &[Step::Send("SETUP\n".into())]);
        assert!(!j.replaying());

        // rollback is idempotent
        j.mark();
        j.remove_to_mark();
        assert_eq!(j.len(), 1);
    }

    #[test]
    fn remove_step_drops_query_and_reply() {
        let (mut j, h) = journal();
        h.push_reply("garbage");
        j.start();
        j.send("FULLSITES?\n").unwrap();
        j.receive(T).unwrap();
        j.remove_step();
        j.remove_step();
        assert!(j.is_empty());
        j.remove_step();
        assert!(j.is_empty());
    }

    #[test]
    fn flush_skipped_while_replaying() {
        let (mut j, h) = journal();
        j.start();
        j.send("X\n").unwrap();
        h.push_interrupt(1);
        h.push_interrupt(2);

        j.start();
        assert_eq!(j.flush_interrupts(8).unwrap(), 0);
        j.send("X\n").unwrap();
        assert_eq!(j.flush_interrupts(8).unwrap(), 2);
        assert!(j.len() == 1);
    }

    #[test]
    fn flush_is_bounded() {
        let (mut j, h) = journal();
        for code in 0..10 {
            h.push_interrupt(code);
        }
        assert_eq!(j.flush_interrupts(4).unwrap(), 4);
        assert_eq!(j.flush_interrupts(100).unwrap(), 6);
    }

    #[test]
    fn transport_error_is_not_recorded() {
        let (mut j, h) = journal();
        h.fail_next_send(TransportError::Closed);
        j.start();
        assert_eq!(j.send("X\n"), Err(TransportError::Closed));
        assert!(j.is_empty());
    }
}
