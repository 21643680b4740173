//! Logging initialization

/// Initialize the logging system
///
/// Uses env_logger with default filter level of `info`.
/// Override with RUST_LOG environment variable.
///
/// # Example
/// ```
/// voxmesh::core::logging::init();
/// log::info!("Renderer started");
/// ```
pub fn init() {
    init_with_filter("info");
}

/// Initialize with a custom default filter (e.g. from config)
///
/// `RUST_LOG` still takes precedence. Safe to call more than once; later
/// calls are ignored.
pub fn init_with_filter(default_filter: &str) {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter)
    ).try_init();
}
