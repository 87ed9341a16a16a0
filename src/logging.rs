//! Optional logging bootstrap.
//!
//! The subsystem itself logs exclusively through the `log` facade (§4.6), so
//! it never depends on this module. `init_logging` exists for host
//! applications and this crate's own tests/examples that want a ready-made
//! backend: `slog` formatted for either interactive (`term`) or aggregated
//! (mozlog JSON) consumption, bridged into `log` via `slog-stdlog`.

use std::io;

use gethostname::gethostname;
use slog::{self, Drain};
use slog_mozlog_json::MozLogJson;

use crate::errors::Result;

pub fn init_logging(json: bool) -> Result<()> {
    let logger = if json {
        let hostname = gethostname().to_string_lossy().into_owned();
        let drain = MozLogJson::new(io::stdout())
            .logger_name(format!(
                "{}-{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ))
            .msg_type(format!("{}:log", env!("CARGO_PKG_NAME")))
            .hostname(hostname)
            .build()
            .fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    } else {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    };
    // cancel_reset: reset_logging() below takes care of tearing this down;
    // letting slog_scope panic on drop during tests is not worth avoiding by
    // other means. See https://github.com/slog-rs/slog/issues/169.
    slog_scope::set_global_logger(logger).cancel_reset();
    slog_stdlog::init().ok();
    Ok(())
}

pub fn reset_logging() {
    let logger = slog::Logger::root(slog::Discard, slog::o!());
    slog_scope::set_global_logger(logger).cancel_reset();
}
