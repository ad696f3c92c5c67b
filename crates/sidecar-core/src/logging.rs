use std::fmt;
use std::io::IsTerminal;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "SIDECAR_LOG";

const DEFAULT_FILTER: &str = "info";

/// `[mm:ss:mmm]` since process start.
struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write_elapsed(w, self.0.elapsed().as_millis())
    }
}

fn write_elapsed(w: &mut impl fmt::Write, total_millis: u128) -> fmt::Result {
    let total_secs = total_millis / 1000;
    let mins = total_secs / 60;
    let secs = total_secs % 60;
    let millis = total_millis % 1000;
    write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
}

/// Install the global stderr subscriber. A second call is a no-op.
pub fn init() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .try_init();
}
