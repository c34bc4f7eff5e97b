use chrono::{DateTime, Duration, TimeZone, Utc};
use openssl::{asn1::Asn1Time, x509::X509};
use thiserror::Error;

/// 證書相關操作可能出現的錯誤類型
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("Failed to parse certificate: {0}")]
    ParseError(#[from] openssl::error::ErrorStack),
    #[error("Invalid expiration timestamp")]
    InvalidTimestamp,
}

type Result<T> = std::result::Result<T, CertificateError>;

/// X.509 證書封裝結構，提供到期時間與續約判斷
#[derive(Debug, Clone)]
pub struct Certificate {
    /// 內部使用的 X509 證書對象
    pub cert: X509,
}

impl Certificate {
    /// 根據 PEM 格式資料解析 X.509 證書；資料含多張證書時取第一張。
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let cert = X509::from_pem(pem)?;
        Ok(Certificate { cert })
    }

    /// 證書的到期時間（notAfter）。
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.cert.not_after())?;
        let seconds = i64::from(diff.days) * 86_400 + i64::from(diff.secs);

        Utc.timestamp_opt(seconds, 0)
            .single()
            .ok_or(CertificateError::InvalidTimestamp)
    }

    /// 從 `now` 起算的剩餘有效時間，已過期時為負值。
    pub fn remaining(&self, now: DateTime<Utc>) -> Result<Duration> {
        Ok(self.not_after()? - now)
    }

    /// 判斷證書是否應該進行續約
    ///
    /// # 參數
    ///
    /// - `threshold_days`: 續約閾值（以天為單位）
    /// - `now`: 判斷所依據的當下時間
    ///
    /// # 回傳
    ///
    /// 剩餘有效時間小於閾值時回傳 `true`
    pub fn should_renew(&self, threshold_days: u32, now: DateTime<Utc>) -> Result<bool> {
        Ok(self.remaining(now)? < Duration::days(i64::from(threshold_days)))
    }
}
