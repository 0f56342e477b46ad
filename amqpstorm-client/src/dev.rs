use env_logger::Builder;
use std::io::Write;

/// Convenience function for setting up `env_logger` to see log messages.
///
/// The level is controlled by `RUST_LOG` as usual. Calling it more than once is harmless.
pub fn setup_logger() {
    let mut builder = Builder::from_default_env();

    let _ = builder
        .format_timestamp_millis()
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - [{:5}] {}:{} - {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or_default(),
                record.line().unwrap_or_default(),
                record.args()
            )
        })
        .try_init();
}
