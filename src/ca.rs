//! 與 CA 互動的能力介面。
//!
//! 本庫不實作 ACME 通訊協定本身；呼叫端提供實作這些 trait 的用戶端，
//! 協調流程與帳戶管理只透過這裡定義的方法與 CA 溝通。

use std::fmt;

use thiserror::Error;

use crate::{
    challenge::{Challenge, ChallengeStatus},
    key_pair::KeyPair,
};

/// CA 用戶端回報的錯誤。
#[derive(Debug, Error)]
pub enum CaError {
    #[error("CA rejected the request: {0}")]
    Rejected(String),
    #[error("CA transport error: {0}")]
    Transport(String),
    #[error("Unexpected CA response: {0}")]
    Protocol(String),
}

/// CA 簽發的憑證，`chain_pem` 依序包含葉憑證與中繼憑證。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub chain_pem: String,
}

/// 已綁定帳戶的 CA 用戶端。
pub trait CaClient: fmt::Debug {
    /// 為網域取得 DNS-01 挑戰。
    fn request_challenge(&self, domain: &str) -> Result<Challenge, CaError>;

    /// 通知 CA 記錄已就緒，開始驗證。
    fn request_validation(&self, challenge: &Challenge) -> Result<(), CaError>;

    /// 查詢挑戰目前的驗證狀態。
    fn validation_status(&self, challenge: &Challenge) -> Result<ChallengeStatus, CaError>;

    /// 提交 DER 編碼的 CSR，取得簽發的憑證鏈。
    fn submit_certificate_request(&self, csr_der: &[u8]) -> Result<IssuedCertificate, CaError>;
}

/// 以帳戶金鑰建立 CA 用戶端。
pub trait CaConnector {
    /// 以既有的帳戶金鑰連線。
    fn connect(&self, key: &KeyPair, endpoint: &str) -> Result<Box<dyn CaClient>, CaError>;

    /// 以新金鑰註冊帳戶並連線。
    fn register(
        &self,
        key: &KeyPair,
        contact: &str,
        endpoint: &str,
    ) -> Result<Box<dyn CaClient>, CaError>;
}
