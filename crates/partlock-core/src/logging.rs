//! Logger bootstrap shared by binaries and tests.

use std::io::Write;

/// Initialise env_logger at `level` unless `RUST_LOG` overrides it.
/// Safe to call more than once; later calls are no-ops.
pub fn init(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
