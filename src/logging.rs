//! 日誌初始化。

use std::{
    fs::{self, OpenOptions},
    io,
    sync::Mutex,
};

use thiserror::Error;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::zone::LogDestination;

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Cannot open log file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid log directive: {0}")]
    Directive(#[from] tracing_subscriber::filter::ParseError),
    #[error("Logger already installed: {0}")]
    AlreadyInstalled(String),
}

type Result<T> = std::result::Result<T, LoggingError>;

/// 一律壓到 error 等級的第三方模組。
const QUIET_TARGETS: [&str; 4] = [
    "reqwest=error",
    "hyper=error",
    "hyper_util=error",
    "hickory_proto=error",
];

/// 依照日誌等級字串（例如 `"info"` 或 `"acme_dns01=debug"`）建立過濾器。
///
/// 無法解析的部分會被忽略，預設等級為 `info`。
pub fn build_filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .parse_lossy(level);

    for directive in QUIET_TARGETS {
        filter = filter.add_directive(directive.parse()?);
    }

    Ok(filter)
}

/// 安裝全域的 tracing 訂閱者。
///
/// # 參數
///
/// - `destination`: 標準輸出，或以附加模式寫入的日誌檔（不輸出 ANSI 色碼）。
/// - `level`: 過濾等級字串，規則同 [`build_filter`]。
///
/// # 回傳
///
/// 日誌檔無法開啟、或全域訂閱者已被安裝時回傳錯誤。
pub fn init(destination: &LogDestination, level: &str) -> Result<()> {
    let filter = build_filter(level)?;

    let installed = match destination {
        LogDestination::Stdout => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_level(true)
            .try_init(),
        LogDestination::File(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_level(true)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
    };

    installed.map_err(|e| LoggingError::AlreadyInstalled(e.to_string()))
}
