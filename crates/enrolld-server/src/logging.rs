use tracing_subscriber::EnvFilter;

/// Installs the process-wide `tracing` subscriber (SPEC_FULL.md
/// AMBIENT-LOGGING). `debug_level` is the CLI's repeated `-d` flag count;
/// each step relaxes the default filter by one notch, matching the
/// original's "use multiple times to increase the debug level" (spec.md
/// §6 CLI surface).
pub fn init(debug_level: u8) {
    let default_directive = match debug_level {
        0 => "enrolld=info,enrolld_core=info,enrolld_transport=info",
        1 => "enrolld=debug,enrolld_core=debug,enrolld_transport=info",
        _ => "enrolld=trace,enrolld_core=trace,enrolld_transport=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
