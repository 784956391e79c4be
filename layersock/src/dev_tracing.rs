/// Install a `tracing` subscriber filtered by `RUST_LOG`.
///
/// Meant for binaries and tests. Does nothing when `RUST_LOG` is unset or a
/// global subscriber is already installed, so it is safe to call from every
/// test.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
