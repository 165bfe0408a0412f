use std::path::Path;

/// Detaches the server from the terminal. Must run before the tokio runtime
/// exists. The working directory is kept so relative `--logs`/`--data`
/// paths still resolve.
#[cfg(unix)]
pub fn daemonize(pid_file: &Path) -> anyhow::Result<()> {
    use anyhow::Context;
    use daemonize::Daemonize;

    let cwd = std::env::current_dir().context("Cannot read working directory")?;
    eprintln!("[INFO] Detaching, pid file {}", pid_file.display());

    Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(cwd)
        .umask(0o027)
        .start()
        .map_err(|e| anyhow::anyhow!("Failed to start daemon mode: {}", e))
}

#[cfg(not(unix))]
pub fn daemonize(_pid_file: &Path) -> anyhow::Result<()> {
    eprintln!("[INFO] Daemon mode not supported on this platform, staying in foreground");
    Ok(())
}
