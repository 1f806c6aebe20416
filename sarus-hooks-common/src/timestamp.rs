//! Event-timestamp logging shared by the hooks (spec section 4, hook
//! environment variables `TIMESTAMP_HOOK_LOGFILE`/`TIMESTAMP_HOOK_MESSAGE`).
//! A bring-up/teardown timing probe for benchmarking hook latency, nothing
//! more: a no-op unless both variables are set.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use sarus_core::error::Result;

/// Appends one `<unix-epoch-millis> <message>` line to `logfile`, creating
/// it if absent.
pub fn record(logfile: &Path, message: &str) -> Result<()> {
    let millis = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map_or(0, |d| d.as_millis());
    let mut file = OpenOptions::new().create(true).append(true).open(logfile)?;
    writeln!(file, "{millis} {message}")?;
    Ok(())
}

/// Reads `TIMESTAMP_HOOK_LOGFILE`/`TIMESTAMP_HOOK_MESSAGE` from the
/// environment and records the event if both are set.
pub fn record_from_env() -> Result<()> {
    let (Ok(logfile), Ok(message)) = (std::env::var("TIMESTAMP_HOOK_LOGFILE"), std::env::var("TIMESTAMP_HOOK_MESSAGE")) else {
        return Ok(());
    };
    record(Path::new(&logfile), &message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_a_line() {
        let tmp = tempfile::tempdir().unwrap();
        let logfile = tmp.path().join("events.log");
        record(&logfile, "createContainer start").unwrap();
        record(&logfile, "createContainer end").unwrap();
        let contents = std::fs::read_to_string(&logfile).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.lines().next().unwrap().ends_with("createContainer start"));
    }
}
