//! Reconfiguration and first-time handler setup.

use crate::driver::HandlerDriver;
use crate::session::{HandlerIdentity, Settings};
use crate::vendor::{SiteReport, Workarounds};
use handler_common::config::ConfigSource;
use handler_common::error::DriverResult;
use tracing::{debug, info, warn};

impl HandlerDriver {
    /// Apply reconfigurable settings and, on the first call, identify and
    /// set up the handler.
    ///
    /// Settings are validated as a whole; on error the previous settings
    /// stay in force. The first successful call also runs the identification
    /// query, the model's setup commands and the site-count cross-check,
    /// then discards stale interrupts. Identification and site mismatches
    /// are logged and do not fail the call.
    ///
    /// # Errors
    /// - `Config` for invalid settings
    /// - transport failures during first-time setup (retried on the next call)
    /// - `Aborted`
    pub fn reconfigure(&mut self, config: &dyn ConfigSource) -> DriverResult<()> {
        self.begin("reconfigure")?;
        let result = self.reconfigure_step(config);
        self.finish(result, |_| false)
    }

    fn reconfigure_step(&mut self, config: &dyn ConfigSource) -> DriverResult<()> {
        let settings = Settings::from_config(config, self.session.profile)?;
        if settings != self.session.settings {
            info!(
                mode = %settings.polling_mode,
                verify = settings.verify_bins,
                reprobe = settings.reprobe_enabled,
                workarounds = ?settings.workarounds,
                "Settings updated"
            );
        }
        self.session.settings = settings;

        if self.session.setup_done {
            return Ok(());
        }
        self.identify()?;
        for command in self.session.profile.setup {
            self.send_command(command)?;
        }
        self.check_sites()?;
        self.flush_interrupts()?;
        self.session.setup_done = true;
        info!(model = self.session.profile.name, "Handler set up");
        Ok(())
    }

    fn identify(&mut self) -> DriverResult<()> {
        let profile = self.session.profile;
        let Some(identify) = profile.identify else {
            debug!(model = profile.name, "Model has no identification query");
            return Ok(());
        };
        let Some(reply) = self.query(identify.command)? else {
            warn!(model = profile.name, "No identification reply, continuing");
            return Ok(());
        };
        let identity = HandlerIdentity::parse(&reply, identify.expected);
        if identity.matched {
            info!(id = %identity.raw, version = ?identity.version, "Handler identified");
        } else {
            warn!(
                id = %identity.raw,
                expected = identify.expected,
                "Handler does not identify as the configured model, continuing"
            );
        }
        self.session.identity = Some(identity);
        Ok(())
    }

    fn check_sites(&mut self) -> DriverResult<()> {
        let Some(sites) = self.session.profile.sites else {
            return Ok(());
        };
        if self.session.workarounds().contains(Workarounds::SKIP_SITE_CHECK) {
            debug!("Site check skipped");
            return Ok(());
        }
        let Some(reply) = self.query(sites.query.command)? else {
            warn!("No reply to the site query, using the configured sites");
            return Ok(());
        };
        let Some(value) = sites.query.reply.parse(&reply) else {
            warn!(reply = %reply, "Unexpected site query reply, using the configured sites");
            return Ok(());
        };

        let count = self.session.site_count();
        let configured = if count >= 64 { u64::MAX } else { (1u64 << count) - 1 };
        let consistent = match sites.report {
            SiteReport::Count => value == count as u64,
            SiteReport::Mask => value == configured,
        };
        if consistent {
            debug!(sites = count, "Site configuration confirmed");
        } else {
            warn!(
                configured = count,
                reported = value,
                report = ?sites.report,
                "Handler site configuration differs, using the configured sites"
            );
        }
        Ok(())
    }
}
