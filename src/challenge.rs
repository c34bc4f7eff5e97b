use std::{fmt, str::FromStr};

use openssl::{
    base64::encode_block,
    hash::{hash, MessageDigest},
};
use thiserror::Error;

/// DNS-01 挑戰記錄名稱的固定前綴。
pub const RECORD_NAME: &str = "_acme-challenge";
/// DNS-01 挑戰使用的記錄類型。
pub const RECORD_TYPE: &str = "TXT";

#[derive(Debug, Error)]
pub enum ChallengeError {
    #[error("Invalid challenge status: {0}")]
    InvalidStatus(String),
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] openssl::error::ErrorStack),
}

type Result<T> = std::result::Result<T, ChallengeError>;

/// 表示 ACME 挑戰的狀態，用來追蹤挑戰進展。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
}

impl ChallengeStatus {
    /// 判斷該狀態是否為終結狀態，即不會再變動。
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Processing)
    }

    /// 返回狀態對應的字串表示。
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Valid => "valid",
            Self::Invalid => "invalid",
            Self::Deactivated => "deactivated",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for ChallengeStatus {
    type Err = ChallengeError;

    /// 大小寫不敏感。
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "valid" => Ok(Self::Valid),
            "invalid" => Ok(Self::Invalid),
            "deactivated" => Ok(Self::Deactivated),
            "expired" => Ok(Self::Expired),
            _ => Err(ChallengeError::InvalidStatus(s.to_owned())),
        }
    }
}

impl fmt::Display for ChallengeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 單一網域在單次執行中的 DNS-01 挑戰。
///
/// `handle` 是 CA 用戶端自行解讀的識別資料（例如挑戰 URL），協調流程不會檢視其內容。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// 挑戰對應的網域
    pub domain: String,
    /// DNS 記錄名稱，固定為 `_acme-challenge`
    pub record_name: String,
    /// DNS 記錄類型，固定為 `TXT`
    pub record_type: String,
    /// TXT 記錄必須出現的內容
    pub content: String,
    /// CA 端的不透明識別資料
    pub handle: String,
}

impl Challenge {
    /// 建立一個 DNS-01 挑戰。
    ///
    /// # 參數
    ///
    /// - `domain`: 被驗證的網域。
    /// - `content`: CA 要求的 TXT 內容。
    /// - `handle`: CA 端的識別資料。
    pub fn dns01(domain: &str, content: &str, handle: &str) -> Self {
        Self {
            domain: domain.to_owned(),
            record_name: RECORD_NAME.to_owned(),
            record_type: RECORD_TYPE.to_owned(),
            content: content.to_owned(),
            handle: handle.to_owned(),
        }
    }

    /// 根據 key authorization 建立挑戰，TXT 內容為其 SHA-256 摘要的 URL-safe Base64 編碼。
    pub fn from_key_authorization(
        domain: &str,
        key_authorization: &str,
        handle: &str,
    ) -> Result<Self> {
        let content = dns_txt_value(key_authorization)?;
        Ok(Self::dns01(domain, &content, handle))
    }

    /// 挑戰記錄的完整網域名稱，結尾帶有根點，例如 `_acme-challenge.example.com.`。
    ///
    /// 萬用字元網域 `*.example.com` 的記錄放在 `_acme-challenge.example.com.`。
    pub fn fqdn(&self) -> String {
        let base = self.domain.strip_prefix("*.").unwrap_or(&self.domain);
        format!("{}.{}.", self.record_name, base)
    }
}

/// 計算 DNS-01 的 TXT 記錄值。
pub fn dns_txt_value(key_authorization: &str) -> Result<String> {
    let digest = hash(MessageDigest::sha256(), key_authorization.as_bytes())?;
    let encoded = encode_block(&digest)
        .replace('+', "-")
        .replace('/', "_")
        .trim_end_matches('=')
        .to_owned();
    Ok(encoded)
}
