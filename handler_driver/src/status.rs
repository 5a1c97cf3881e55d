//! Handler status word and diagnostics queries.

use crate::driver::HandlerDriver;
use crate::vendor::{decode_status, render};
use handler_common::error::{DriverError, DriverResult, Progress};
use handler_common::status::{HandlerCondition, StatusBit};
use handler_common::transport::TransportError;
use tracing::{debug, warn};

impl HandlerDriver {
    /// Query and decode the status word.
    ///
    /// Non-zero status is logged at warn level when `warn` is set, at debug
    /// level otherwise. A malformed reply yields `Waiting` and the query is
    /// sent again on the next call.
    ///
    /// # Errors
    /// `Unsupported` if the model has no status query; transport failures
    /// and `Aborted`.
    pub fn query_status(&mut self, warn: bool) -> DriverResult {
        self.begin("query_status")?;
        let result = self.query_status_step(warn);
        self.finish_progress(result)
    }

    fn query_status_step(&mut self, warn: bool) -> DriverResult {
        let profile = self.session.profile;
        let Some(status) = profile.status else {
            return Err(DriverError::Unsupported(format!(
                "{} has no status query",
                profile.name
            )));
        };
        let Some(reply) = self.query(status.query.command)? else {
            return Ok(Progress::Waiting);
        };
        let Some(word) = status.query.reply.parse(&reply) else {
            warn!(reply = %reply, "Unexpected status reply, resending");
            self.journal.remove_step();
            self.journal.remove_step();
            return Ok(Progress::Waiting);
        };

        let conditions = decode_status(word, status.bits);
        self.session.apply_status(word, conditions);
        if word != 0 {
            let names: Vec<&str> = self.status_bits().filter(|b| b.value).map(|b| b.name).collect();
            if warn {
                warn!(word = format_args!("{word:#x}"), conditions = ?names, "Handler status");
            } else {
                debug!(word = format_args!("{word:#x}"), conditions = ?names, "Handler status");
            }
        }
        Ok(Progress::Done)
    }

    /// Raw status word from the last successful status query.
    pub fn status_word(&self) -> u64 {
        self.session.status_word
    }

    /// Decoded conditions from the last successful status query.
    pub fn conditions(&self) -> HandlerCondition {
        self.session.conditions
    }

    /// True if `key` was set in the last status word.
    pub fn status_bit(&self, key: HandlerCondition) -> bool {
        self.session.conditions.intersects(key)
    }

    /// Every status bit the model defines with its current value.
    pub fn status_bits(&self) -> impl Iterator<Item = StatusBit> + '_ {
        let word = self.session.status_word;
        self.session
            .profile
            .status
            .iter()
            .flat_map(|status| status.bits.iter())
            .map(move |def| StatusBit {
                key: def.key,
                value: def.bit < 64 && word & (1u64 << def.bit) != 0,
                bit: def.bit,
                name: def.name,
            })
    }

    /// No not-ready condition was reported.
    pub fn handler_ready(&self) -> bool {
        self.session.conditions.handler_ready()
    }

    /// Cached stop flag from the model's stop bit.
    pub fn stopped(&self) -> bool {
        self.session.stopped
    }

    /// Run a diagnostics query and return the raw reply.
    ///
    /// `key` is an abstract name (`firmware`, `temperature`, ...) mapped to a
    /// model-specific command; `param` fills a `{param}` placeholder.
    ///
    /// # Errors
    /// - `NotAvailable` if the model does not know `key`
    /// - `Transport(Timeout)` if the handler does not reply
    pub fn get_status(&mut self, key: &str, param: &str) -> DriverResult<String> {
        self.begin("get_status")?;
        let result = self.get_status_step(key, param);
        self.finish(result, |_| false)
    }

    fn get_status_step(&mut self, key: &str, param: &str) -> DriverResult<String> {
        let profile = self.session.profile;
        let Some((_, template)) = profile.diagnostics.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) else {
            return Err(DriverError::NotAvailable(format!("'{key}' on {}", profile.name)));
        };
        if template.contains("{param}") && param.is_empty() {
            return Err(DriverError::NotAvailable(format!("'{key}' needs a parameter")));
        }
        let command = render(template, &[("{param}", param)]);
        self.query(&command)?
            .ok_or(DriverError::Transport(TransportError::Timeout))
    }

    /// Stop the handler's cycle.
    ///
    /// # Errors
    /// `Unsupported` if the model has no stop command.
    pub fn pause(&mut self) -> DriverResult<()> {
        let command = self.session.profile.pause;
        self.simple_command("pause", command)
    }

    /// Restart the handler's cycle.
    ///
    /// # Errors
    /// `Unsupported` if the model has no start command.
    pub fn resume(&mut self) -> DriverResult<()> {
        let command = self.session.profile.resume;
        self.simple_command("resume", command)
    }

    fn simple_command(&mut self, operation: &'static str, command: Option<&'static str>) -> DriverResult<()> {
        self.begin(operation)?;
        let result = match command {
            Some(command) => self.send_command(command),
            None => Err(DriverError::Unsupported(format!(
                "{} has no {operation} command",
                self.session.profile.name
            ))),
        };
        self.finish(result, |_| false)
    }
}
