use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// A log file is moved aside to `<name>.1` on open once it grows past this.
pub const ROTATE_BYTES: u64 = 8 * 1024 * 1024;

/// Log sink that discards records until [`LogFile::open`] is called.
///
/// The subscriber is installed before the config is read, so the file
/// location is only known later. Clones share the same target.
#[derive(Clone, Default)]
pub struct LogFile {
    target: Arc<Mutex<Option<File>>>,
}

impl LogFile {
    /// Start appending to `path`, creating parent directories and rotating
    /// an oversized previous log.
    pub fn open(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        rotate(path, ROTATE_BYTES)?;
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.target.lock().unwrap() = Some(file);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.target.lock().unwrap().is_some()
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.target.lock().unwrap().as_mut() {
            Some(f) => f.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.target.lock().unwrap().as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for LogFile {
    type Writer = LogFile;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Keep one previous generation: `path` becomes `path.1` when it exceeds
/// `limit` bytes. A missing file is fine.
fn rotate(path: &Path, limit: u64) -> io::Result<()> {
    let len = match fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if len <= limit {
        return Ok(());
    }
    let mut old = path.as_os_str().to_owned();
    old.push(".1");
    fs::rename(path, old)
}

/// Install the global subscriber and return the (still closed) log file.
///
/// Stderr gets `sandpit=info`, or `sandpit=debug` with `verbose`; `RUST_LOG`
/// overrides the non-verbose default. The file always records `debug`.
pub fn init(verbose: bool) -> LogFile {
    let stderr_filter = if verbose {
        EnvFilter::new("sandpit=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandpit=info"))
    };
    let log_file = LogFile::default();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_filter(stderr_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(log_file.clone())
                .with_filter(EnvFilter::new("sandpit=debug")),
        )
        .init();
    log_file
}
