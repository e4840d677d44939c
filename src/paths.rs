use std::path::PathBuf;

/// State directory: `~/.local/share/sandpit/`
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("sandpit")
}

/// Log file for `sandpit serve`: `~/.local/share/sandpit/logs/sandpit.log`
pub fn log_file() -> PathBuf {
    data_dir().join("logs").join("sandpit.log")
}
