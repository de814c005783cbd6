use std::path::Path;
use std::time::SystemTime;

use log::LevelFilter;

use crate::Result;

/// Installs the global logger: stderr, plus `file` when given.
///
/// The WebRTC stack is very chatty at debug level, its crates are capped at
/// `warn` unless tracing was asked for.
pub fn init(level: LevelFilter, file: Option<&Path>) -> Result<()> {
    let library_level = if level >= LevelFilter::Trace {
        level
    } else {
        LevelFilter::Warn
    };

    let mut dispatch = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
        .level_for("webrtc", library_level)
        .level_for("webrtc_ice", library_level)
        .level_for("webrtc_dtls", library_level)
        .level_for("webrtc_sctp", library_level)
        .level_for("webrtc_srtp", library_level)
        .level_for("webrtc_mdns", library_level)
        .level_for("tungstenite", library_level)
        .chain(std::io::stderr());

    if let Some(path) = file {
        dispatch = dispatch.chain(fern::log_file(path)?);
    }

    dispatch.apply()?;
    Ok(())
}
