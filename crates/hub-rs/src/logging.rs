use crate::config::HubConfig;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

type SharedFile = Arc<Mutex<std::fs::File>>;

/// Keeps the log file open for the lifetime of the process.
pub struct LogGuard {
    file: Option<SharedFile>,
}

impl LogGuard {
    pub fn has_file(&self) -> bool {
        self.file.is_some()
    }
}

pub fn init_logging(config: &HubConfig) -> Option<LogGuard> {
    let level = resolve_level(config.debug, std::env::var("HUB_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let guard = match config.log_dir.as_deref() {
        Some(dir) => match open_log_file(dir, &config.name) {
            Ok(guard) => guard,
            Err(err) => {
                eprintln!("log_file_error: {err}");
                LogGuard { file: None }
            }
        },
        None => LogGuard { file: None },
    };
    let file = guard.file.clone();
    let make_writer = BoxMakeWriter::new(move || MultiWriter::new(file.clone()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(make_writer)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        return None;
    }
    Some(guard)
}

fn resolve_level(debug: bool, configured: Option<String>) -> String {
    if debug {
        return "debug".to_string();
    }
    configured
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}

pub fn log_file_path(dir: &Path, name: &str) -> PathBuf {
    let name = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect::<String>();
    dir.join(format!("hub-{name}.log"))
}

fn open_log_file(dir: &Path, name: &str) -> io::Result<LogGuard> {
    std::fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(dir, name))?;
    Ok(LogGuard {
        file: Some(Arc::new(Mutex::new(file))),
    })
}

struct MultiWriter {
    stdout: io::Stdout,
    file: Option<SharedFile>,
}

impl MultiWriter {
    fn new(file: Option<SharedFile>) -> Self {
        Self {
            stdout: io::stdout(),
            file,
        }
    }
}

impl Write for MultiWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let _ = self.stdout.write_all(buf);
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let _ = self.stdout.flush();
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
            let _ = file.flush();
        }
        Ok(())
    }
}
