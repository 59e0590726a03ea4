//! 日志模块：文件日志（按大小轮转）与调试模式下的控制台输出

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "drivesync.log";

/// 日志配置，位于 config.json 的 `log` 键
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 单个日志文件的最大大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// "error" | "warn" | "info" | "debug" | "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    pub fn load(config_dir: &Path) -> Self {
        fs::read_to_string(config_dir.join("config.json"))
            .ok()
            .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
            .and_then(|config| config.get("log").cloned())
            .and_then(|log| serde_json::from_value(log).ok())
            .unwrap_or_default()
    }

    /// 保存日志配置，保留 config.json 中的其他配置项
    pub fn save(&self, config_dir: &Path) -> io::Result<()> {
        let config_file = config_dir.join("config.json");
        let mut config: serde_json::Value = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
            Err(e) if e.kind() == io::ErrorKind::NotFound => serde_json::json!({}),
            Err(e) => return Err(e),
        };
        config["log"] = serde_json::to_value(self)?;
        fs::write(&config_file, serde_json::to_string_pretty(&config)?)
    }

    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 超过大小上限时把当前日志改名为 `.old` 并重新打开
///
/// 写入器由 tracing-appender 的后台线程独占，因此不需要加锁。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: Option<BufWriter<File>>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE);
        let max_size = u64::from(max_size_mb.max(1)) * 1024 * 1024;

        let mut writer = Self {
            file_path,
            max_size,
            written: 0,
            writer: None,
        };
        writer.open()?;
        Ok(writer)
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn open(&mut self) -> io::Result<()> {
        let existing = fs::metadata(&self.file_path).map(|m| m.len()).unwrap_or(0);
        if existing > self.max_size {
            self.rotate_file()?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        self.written = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn rotate_file(&self) -> io::Result<()> {
        let backup = self.file_path.with_extension("log.old");
        match fs::remove_file(&backup) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        fs::rename(&self.file_path, backup)
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        self.rotate_file()?;
        self.open()
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > self.max_size {
            self.rotate()?;
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "log writer not available"))?;
        let n = writer.write(buf)?;
        writer.flush()?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

/// 日志目录
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

fn env_filter(config: &LogConfig) -> EnvFilter {
    let filter = EnvFilter::from_default_env().add_directive(config.tracing_level().into());
    match "walkdir=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}

/// 初始化全局日志；返回的 guard 需要保持到进程结束，否则缓冲中的日志会丢失
pub fn init_logging(config_dir: &Path) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);
    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let console_layer = cfg!(debug_assertions).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    match SizeRotatingWriter::new(&log_dir(config_dir), config.max_size_mb) {
        Ok(file_writer) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false);
            let _ = tracing_subscriber::registry()
                .with(env_filter(&config))
                .with(file_layer)
                .with(console_layer)
                .try_init();
            Some(guard)
        }
        Err(e) => {
            // 文件日志创建失败，只输出到控制台
            let _ = tracing_subscriber::fmt()
                .with_writer(io::stderr)
                .with_env_filter(env_filter(&config))
                .try_init();
            tracing::warn!("无法创建日志文件: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip_keeps_other_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), r#"{"drive":{"maxFileActions":7}}"#).unwrap();
        assert_eq!(LogConfig::load(dir.path()), LogConfig::default());

        let config = LogConfig {
            level: "debug".into(),
            ..LogConfig::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(LogConfig::load(dir.path()), config);
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("config.json")).unwrap()).unwrap();
        assert_eq!(raw["drive"]["maxFileActions"], 7);
    }

    #[test]
    fn test_writer_rotates_past_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        let line = vec![b'x'; 64 * 1024];
        for _ in 0..20 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        let backup = dir.path().join("drivesync.log.old");
        assert!(backup.exists());
        assert!(fs::metadata(&backup).unwrap().len() > 1024 * 1024);
        assert!(fs::metadata(writer.path()).unwrap().len() < 1024 * 1024);
    }
}
