//! DNS 轉接器介面與建立方式。

use std::{io, path::PathBuf, process::ExitStatus};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    directive::{DirectiveRecord, TxtRecord},
    gehirn::{GehirnAdapter, GehirnCredentials},
    zone::ZoneConfig,
    zonefile::ZoneFileAdapter,
};

/// 轉接器執行指令時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("No DNS provider configured")]
    NotConfigured,
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Zone file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Zone file has no serial line")]
    MissingSerial,
    #[error("Command `{command}` exited with {status}")]
    Command { command: String, status: ExitStatus },
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("DNS API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Zone not found for '{fqdn}'")]
    ZoneNotFound { fqdn: String },
    #[error("Record '{fqdn}' is an alias record")]
    AliasRecord { fqdn: String },
    #[error("Directive rejected: {0}")]
    Rejected(String),
    #[error("Failed to remove {} record(s): {}", .0.len(), .0.join("; "))]
    IncompleteClear(Vec<String>),
}

type Result<T> = std::result::Result<T, ProviderError>;

/// 執行 DNS 記錄指令的轉接器。
///
/// 實作必須在方法返回前完成變更（同步且持久），協調流程隨後立即開始傳播檢查。
pub trait DnsAdapter {
    /// 新增或更新一筆 TXT 記錄。
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<()>;

    /// 移除自上次清除以來新增的所有記錄。
    fn apply_clear(&mut self) -> Result<()>;

    /// 依指令類型分派。
    fn apply(&mut self, directive: &DirectiveRecord) -> Result<()> {
        match directive {
            DirectiveRecord::Upsert(record) => self.apply_upsert(record),
            DirectiveRecord::Clear => self.apply_clear(),
        }
    }
}

impl<A: DnsAdapter + ?Sized> DnsAdapter for Box<A> {
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<()> {
        (**self).apply_upsert(record)
    }

    fn apply_clear(&mut self) -> Result<()> {
        (**self).apply_clear()
    }
}

/// 將指令的文字形式交給任意閉包處理的轉接器。
///
/// ```
/// use acme_dns01::provider::{DirectiveSink, DnsAdapter};
/// use acme_dns01::directive::TxtRecord;
///
/// let mut lines = Vec::new();
/// let mut sink = DirectiveSink::new(|line: &str| {
///     lines.push(line.to_owned());
///     Ok(())
/// });
/// sink.apply_upsert(&TxtRecord::new("_acme-challenge.example.com.", "abc")).unwrap();
/// sink.apply_clear().unwrap();
/// drop(sink);
/// assert_eq!(lines, ["_acme-challenge.example.com. IN TXT \"abc\"", ""]);
/// ```
pub struct DirectiveSink<F> {
    consumer: F,
}

impl<F> DirectiveSink<F>
where
    F: FnMut(&str) -> Result<()>,
{
    pub fn new(consumer: F) -> Self {
        Self { consumer }
    }
}

impl<F> DnsAdapter for DirectiveSink<F>
where
    F: FnMut(&str) -> Result<()>,
{
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<()> {
        let line = DirectiveRecord::Upsert(record.clone()).to_string();
        (self.consumer)(&line)
    }

    fn apply_clear(&mut self) -> Result<()> {
        (self.consumer)(&DirectiveRecord::Clear.to_string())
    }
}

/// 設定檔中 `[provider]` 區段。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    /// 直接改寫權威伺服器的區域檔
    #[serde(alias = "bind9")]
    Zonefile { zonefile: PathBuf },
    /// Gehirn DNS REST API
    Gehirn {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default)]
        base_uri: Option<String>,
    },
}

/// 依區域設定建立對應的轉接器。
///
/// 區域檔轉接器會在每次改寫後執行設定中的 `commands`。
///
/// # 回傳
///
/// 未設定 `[provider]` 時回傳 `ProviderError::NotConfigured`。
pub fn create_adapter(zone: &ZoneConfig) -> Result<Box<dyn DnsAdapter>> {
    match &zone.provider {
        None => Err(ProviderError::NotConfigured),
        Some(ProviderConfig::Zonefile { zonefile }) => Ok(Box::new(ZoneFileAdapter::new(
            zonefile.clone(),
            zone.commands.clone(),
        ))),
        Some(ProviderConfig::Gehirn {
            token,
            secret,
            base_uri,
        }) => {
            let credentials = GehirnCredentials::resolve(token.as_deref(), secret.as_deref())?;
            Ok(Box::new(GehirnAdapter::new(credentials, base_uri.as_deref())?))
        }
    }
}
