//! 區域設定的載入與正規化。
//!
//! 設定來源是鬆散型別的（單一字串或字串陣列皆可），經 [`ZoneConfig::normalize`]
//! 補齊預設值並驗證後，成為執行期間不再改變的 [`ZoneConfig`]。

use std::{
    env, io,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;

use crate::provider::ProviderConfig;

/// 設定正規化或載入時可能發生的錯誤。
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No domains configured")]
    NoDomains,
    #[error("Blank domain entry at position {0}")]
    BlankDomain(usize),
    #[error("No nameservers configured")]
    NoNameservers,
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Unusable path for {field}: {path:?} ({reason})")]
    UnusablePath {
        field: &'static str,
        path: PathBuf,
        reason: &'static str,
    },
    #[error("Invalid {0} policy: max_attempts must be greater than 0")]
    InvalidPollPolicy(&'static str),
    #[error("Cannot determine working directory: {0}")]
    WorkingDirectory(#[from] io::Error),
    #[error("Failed to load configuration: {0}")]
    Source(#[from] config::ConfigError),
    #[error("Malformed configuration value: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, ConfigError>;

/// 預設的 CA 目錄 URL（測試環境）。
pub const DEFAULT_ENDPOINT: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
/// 預設的聯絡信箱。
pub const DEFAULT_MAIL: &str = "root@example.com";
pub const DEFAULT_MARGIN_DAYS: u32 = 30;
pub const DEFAULT_WARNING_DAYS: u32 = 7;

const ENV_PREFIX: &str = "ACME_DNS01";

/// 可接受單一值或陣列的設定欄位。
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    /// 一律轉為序列。
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// 尚未正規化的原始設定，每個欄位皆可省略。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawZoneConfig {
    pub name: Option<String>,
    #[serde(alias = "domain")]
    pub domains: Option<OneOrMany<String>>,
    #[serde(alias = "nameserver")]
    pub nameservers: Option<OneOrMany<String>>,
    pub authkey: Option<PathBuf>,
    pub certdir: Option<PathBuf>,
    pub certname: Option<RawCertNames>,
    pub logfile: Option<PathBuf>,
    pub margin_days: Option<u32>,
    pub warning_days: Option<u32>,
    pub endpoint: Option<String>,
    pub mail: Option<String>,
    #[serde(alias = "command")]
    pub commands: Option<OneOrMany<String>>,
    pub propagation: Option<RawPollPolicy>,
    pub validation: Option<RawPollPolicy>,
    pub provider: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawCertNames {
    pub privkey: Option<String>,
    pub cert: Option<String>,
    pub chain: Option<String>,
    pub fullchain: Option<String>,
}

/// 輪詢策略的原始設定；`interval_ms` 優先於 `interval_secs`。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawPollPolicy {
    pub interval_secs: Option<u64>,
    pub interval_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

/// 憑證四個檔案的檔名對應。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertNames {
    pub privkey: String,
    pub cert: String,
    pub chain: String,
    pub fullchain: String,
}

impl Default for CertNames {
    fn default() -> Self {
        Self {
            privkey: "privkey.pem".to_owned(),
            cert: "cert.pem".to_owned(),
            chain: "chain.pem".to_owned(),
            fullchain: "fullchain.pem".to_owned(),
        }
    }
}

/// 日誌輸出位置。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDestination {
    Stdout,
    File(PathBuf),
}

/// 有上限的輪詢策略：每次等待 `interval`，最多嘗試 `max_attempts` 次。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    /// DNS 傳播檢查的預設值：每 3 秒一次，最多約 5 分鐘。
    pub const PROPAGATION: Self = Self::new(Duration::from_secs(3), 100);
    /// CA 驗證狀態輪詢的預設值：每 5 秒一次，最多約 5 分鐘。
    pub const VALIDATION: Self = Self::new(Duration::from_secs(5), 60);

    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// 最長等待時間。
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    fn from_raw(raw: Option<RawPollPolicy>, default: Self, field: &'static str) -> Result<Self> {
        let Some(raw) = raw else {
            return Ok(default);
        };

        let interval = match (raw.interval_ms, raw.interval_secs) {
            (Some(ms), _) => Duration::from_millis(ms),
            (None, Some(secs)) => Duration::from_secs(secs),
            (None, None) => default.interval,
        };
        let max_attempts = raw.max_attempts.unwrap_or(default.max_attempts);
        if max_attempts == 0 {
            return Err(ConfigError::InvalidPollPolicy(field));
        }

        Ok(Self::new(interval, max_attempts))
    }
}

/// 正規化後的區域設定。
#[derive(Debug, Clone)]
pub struct ZoneConfig {
    /// 區域名稱，未設定時取第一個網域。
    pub name: String,
    /// 需要驗證的網域，保持設定中的順序。
    pub domains: Vec<String>,
    /// 傳播檢查時查詢的名稱伺服器。
    pub nameservers: Vec<String>,
    /// CA 帳戶金鑰檔路徑。
    pub authkey: PathBuf,
    /// 憑證目錄，底下放各次簽發的子目錄與 `current` 連結。
    pub certdir: PathBuf,
    pub certname: CertNames,
    pub log: LogDestination,
    pub margin_days: u32,
    pub warning_days: u32,
    pub endpoint: String,
    pub mail: String,
    /// 每次更新區域檔後執行的指令。
    pub commands: Vec<String>,
    pub propagation: PollPolicy,
    pub validation: PollPolicy,
    pub provider: Option<ProviderConfig>,
}

impl ZoneConfig {
    /// 從 TOML 檔載入設定，並套用 `ACME_DNS01__*` 環境變數覆寫。
    ///
    /// # Errors
    ///
    /// 讀檔、反序列化或正規化失敗時回傳 [`ConfigError`]。
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw: RawZoneConfig = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;

        Self::normalize(raw)
    }

    /// 從記憶體中的 JSON 值建立設定。
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawZoneConfig = serde_json::from_value(value)?;
        Self::normalize(raw)
    }

    /// 補齊預設值並驗證原始設定。
    ///
    /// 網域與指令無論原本是單一值或陣列，都會轉為序列；網域清單為空、
    /// 含空白項目，或路徑無法使用時回傳錯誤。此函式不碰觸檔案內容，
    /// 只檢查既有路徑的型別。
    ///
    /// # Errors
    ///
    /// 回傳 [`ConfigError`] 描述第一個不合法的欄位。
    pub fn normalize(raw: RawZoneConfig) -> Result<Self> {
        let domains: Vec<String> = raw
            .domains
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|d| d.trim().to_owned())
            .collect();
        if domains.is_empty() {
            return Err(ConfigError::NoDomains);
        }
        if let Some(position) = domains.iter().position(String::is_empty) {
            return Err(ConfigError::BlankDomain(position));
        }

        let nameservers: Vec<String> = raw
            .nameservers
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .map(|ns| ns.trim().to_owned())
            .filter(|ns| !ns.is_empty())
            .collect();
        if nameservers.is_empty() {
            return Err(ConfigError::NoNameservers);
        }

        let authkey = raw
            .authkey
            .filter(|p| !p.as_os_str().is_empty())
            .ok_or(ConfigError::MissingField("authkey"))?;
        if authkey.is_dir() {
            return Err(ConfigError::UnusablePath {
                field: "authkey",
                path: authkey,
                reason: "is a directory",
            });
        }

        let certdir = match raw.certdir.filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => dir,
            None => env::current_dir()?,
        };
        if certdir.exists() && !certdir.is_dir() {
            return Err(ConfigError::UnusablePath {
                field: "certdir",
                path: certdir,
                reason: "is not a directory",
            });
        }

        let certname = {
            let raw_names = raw.certname.unwrap_or_default();
            let defaults = CertNames::default();
            CertNames {
                privkey: raw_names.privkey.unwrap_or(defaults.privkey),
                cert: raw_names.cert.unwrap_or(defaults.cert),
                chain: raw_names.chain.unwrap_or(defaults.chain),
                fullchain: raw_names.fullchain.unwrap_or(defaults.fullchain),
            }
        };

        let log = match raw.logfile {
            None => LogDestination::Stdout,
            Some(path) if path.as_os_str().is_empty() => LogDestination::Stdout,
            Some(path) if path == Path::new("-") || path == Path::new("STDOUT") => {
                LogDestination::Stdout
            }
            Some(path) => {
                if path.is_dir() {
                    return Err(ConfigError::UnusablePath {
                        field: "logfile",
                        path,
                        reason: "is a directory",
                    });
                }
                LogDestination::File(path)
            }
        };

        if let Some(ProviderConfig::Zonefile { zonefile }) = &raw.provider {
            if zonefile.is_dir() {
                return Err(ConfigError::UnusablePath {
                    field: "provider.zonefile",
                    path: zonefile.clone(),
                    reason: "is a directory",
                });
            }
        }

        let commands = raw
            .commands
            .map(OneOrMany::into_vec)
            .unwrap_or_default();

        Ok(Self {
            name: raw
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| domains[0].clone()),
            domains,
            nameservers,
            authkey,
            certdir,
            certname,
            log,
            margin_days: raw.margin_days.unwrap_or(DEFAULT_MARGIN_DAYS),
            warning_days: raw.warning_days.unwrap_or(DEFAULT_WARNING_DAYS),
            endpoint: raw
                .endpoint
                .filter(|e| !e.is_empty())
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned()),
            mail: raw
                .mail
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| DEFAULT_MAIL.to_owned()),
            commands,
            propagation: PollPolicy::from_raw(
                raw.propagation,
                PollPolicy::PROPAGATION,
                "propagation",
            )?,
            validation: PollPolicy::from_raw(raw.validation, PollPolicy::VALIDATION, "validation")?,
            provider: raw.provider,
        })
    }
}
