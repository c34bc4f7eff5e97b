//! DNS 傳播檢查。
//!
//! 送出新增指令後，依固定間隔向設定的名稱伺服器查詢 TXT 記錄，
//! 直到回應中第一個 TXT 值與預期內容逐位元組相同為止。

use std::{
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    str::FromStr,
    time::Duration,
};

use hickory_client::{
    client::{Client, SyncClient},
    error::ClientError,
    proto::error::ProtoError,
    rr::{DNSClass, Name, RData, RecordType},
    udp::UdpClientConnection,
};
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{cancel::CancelToken, zone::PollPolicy};

#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("TXT record {fqdn} not observed after {attempts} attempts")]
    Timeout { fqdn: String, attempts: u32 },
    #[error("Propagation wait cancelled")]
    Cancelled,
    #[error("Cannot resolve nameserver address: {0}")]
    Nameserver(String),
    #[error("DNS client error: {0}")]
    Client(#[from] ClientError),
    #[error("Invalid DNS name: {0}")]
    Name(#[from] ProtoError),
}

type Result<T> = std::result::Result<T, PropagationError>;

/// 向單一名稱伺服器查詢 TXT 記錄。
pub trait TxtLookup: fmt::Debug {
    /// 依回應順序回傳每筆 TXT 記錄的內容；一筆記錄的多個字串會串接起來。
    fn lookup_txt(&self, nameserver: &str, fqdn: &str) -> Result<Vec<String>>;
}

/// 以 UDP 直接查詢名稱伺服器，不經過本機解析器的快取。
#[derive(Debug, Clone)]
pub struct HickoryLookup {
    timeout: Duration,
}

impl HickoryLookup {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// 接受 `IP`、`IP:port` 或主機名稱，未指定埠時使用 53。
    fn server_address(nameserver: &str) -> Result<SocketAddr> {
        if let Ok(addr) = nameserver.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let host = nameserver.trim_start_matches('[').trim_end_matches(']');
        (host, 53)
            .to_socket_addrs()
            .map_err(|e| PropagationError::Nameserver(format!("{nameserver}: {e}")))?
            .next()
            .ok_or_else(|| PropagationError::Nameserver(nameserver.to_owned()))
    }
}

impl Default for HickoryLookup {
    fn default() -> Self {
        Self::new(Self::DEFAULT_TIMEOUT)
    }
}

impl TxtLookup for HickoryLookup {
    fn lookup_txt(&self, nameserver: &str, fqdn: &str) -> Result<Vec<String>> {
        let address = Self::server_address(nameserver)?;
        let conn = UdpClientConnection::with_timeout(address, self.timeout)?;
        let client = SyncClient::new(conn);

        let name = Name::from_str(fqdn)?;
        let response = client.query(&name, DNSClass::IN, RecordType::TXT)?;

        let values = response
            .answers()
            .iter()
            .filter_map(|record| match record.data() {
                Some(RData::TXT(txt)) => Some(
                    txt.txt_data()
                        .iter()
                        .map(|part| String::from_utf8_lossy(part))
                        .collect::<String>(),
                ),
                _ => None,
            })
            .collect();

        Ok(values)
    }
}

/// 傳播檢查器，本身不保存任何記錄狀態，可重複用於每個網域。
#[derive(Debug)]
pub struct PropagationVerifier {
    lookup: Box<dyn TxtLookup>,
    policy: PollPolicy,
    cancel: CancelToken,
}

impl PropagationVerifier {
    pub fn new(lookup: Box<dyn TxtLookup>, policy: PollPolicy, cancel: CancelToken) -> Self {
        Self {
            lookup,
            policy,
            cancel,
        }
    }

    /// 等待 `fqdn` 的 TXT 記錄出現預期內容。
    ///
    /// 每次檢查前先等待一個間隔；名稱伺服器依序詢問，以第一個成功回應為準。
    ///
    /// # 參數
    ///
    /// - `nameservers`: 查詢的名稱伺服器。
    /// - `fqdn`: 記錄的完整網域名稱。
    /// - `expected`: 預期的 TXT 內容。
    ///
    /// # 回傳
    ///
    /// 成功時回傳使用的嘗試次數；超過次數上限回傳 `PropagationError::Timeout`，
    /// 等待中被取消回傳 `PropagationError::Cancelled`。
    pub fn wait_for_record(
        &self,
        nameservers: &[String],
        fqdn: &str,
        expected: &str,
    ) -> Result<u32> {
        debug!(
            record = %fqdn,
            max_attempts = self.policy.max_attempts,
            interval_ms = self.policy.interval.as_millis() as u64,
            "waiting for DNS propagation"
        );

        for attempt in 1..=self.policy.max_attempts {
            if !self.cancel.sleep(self.policy.interval) {
                return Err(PropagationError::Cancelled);
            }

            if self.observe(nameservers, fqdn, expected) {
                debug!(record = %fqdn, attempt, "DNS propagation confirmed");
                return Ok(attempt);
            }
        }

        warn!(record = %fqdn, attempts = self.policy.max_attempts, "DNS propagation timed out");
        Err(PropagationError::Timeout {
            fqdn: fqdn.to_owned(),
            attempts: self.policy.max_attempts,
        })
    }

    fn observe(&self, nameservers: &[String], fqdn: &str, expected: &str) -> bool {
        for nameserver in nameservers {
            match self.lookup.lookup_txt(nameserver, fqdn) {
                Ok(values) => {
                    trace!(
                        record = %fqdn,
                        nameserver = %nameserver,
                        found = ?values.first(),
                        expected = %expected,
                        "checking TXT record"
                    );
                    return values.first().is_some_and(|v| v == expected);
                }
                Err(e) => {
                    warn!(record = %fqdn, nameserver = %nameserver, error = %e, "DNS lookup error");
                }
            }
        }
        false
    }
}
