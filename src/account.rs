//! CA 帳戶金鑰的載入與建立。

use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::{
    ca::{CaClient, CaConnector, CaError},
    key_pair::{KeyError, KeyPair, ACCOUNT_KEY_BITS},
};

/// 帳戶金鑰檔的權限：僅擁有者可讀。
pub const ACCOUNT_KEY_MODE: u32 = 0o400;

/// 錯誤類型，用於描述在處理 CA 帳戶時可能發生的各類錯誤。
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("Account key error: {0}")]
    Key(#[from] KeyError),
    #[error("Account registration rejected: {0}")]
    Registration(CaError),
    #[error("Cannot connect with existing account key: {0}")]
    Connect(CaError),
}

pub type Result<T> = std::result::Result<T, AccountError>;

/// 確保帳戶存在並回傳已綁定帳戶的 CA 用戶端。
///
/// - 金鑰檔存在：讀取金鑰並連線，不會重新註冊。
/// - 金鑰檔不存在：產生 RSA 4096 金鑰、以 `contact_email` 註冊，註冊成功後才寫入金鑰檔
///   （權限 0400，必要時建立上層目錄）。
///
/// # 參數
///
/// * `path` - 帳戶金鑰檔路徑。
/// * `contact_email` - 註冊時使用的聯絡信箱。
/// * `endpoint` - CA 目錄 URL。
/// * `connector` - 實際與 CA 溝通的連線器。
///
/// # Errors
///
/// 金鑰檔無法讀取或解析時回傳 [`AccountError::Key`]；CA 拒絕註冊時回傳
/// [`AccountError::Registration`]，此時不會留下金鑰檔。
pub fn ensure_account(
    path: &Path,
    contact_email: &str,
    endpoint: &str,
    connector: &dyn CaConnector,
) -> Result<Box<dyn CaClient>> {
    ensure_account_with_bits(path, contact_email, endpoint, connector, ACCOUNT_KEY_BITS)
}

pub(crate) fn ensure_account_with_bits(
    path: &Path,
    contact_email: &str,
    endpoint: &str,
    connector: &dyn CaConnector,
    bits: u32,
) -> Result<Box<dyn CaClient>> {
    if path.exists() {
        let key = KeyPair::from_file(path)?;
        info!(key = %path.display(), endpoint = %endpoint, "using existing account key");
        return connector.connect(&key, endpoint).map_err(AccountError::Connect);
    }

    info!(key = %path.display(), bits, "generating account key");
    let key = KeyPair::generate(bits)?;
    let client = connector
        .register(&key, &format!("mailto:{contact_email}"), endpoint)
        .map_err(AccountError::Registration)?;

    key.write_new(path, ACCOUNT_KEY_MODE)?;
    info!(key = %path.display(), contact = %contact_email, "account registered");

    Ok(client)
}
