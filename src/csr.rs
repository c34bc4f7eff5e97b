use std::result;

use openssl::{
    hash::MessageDigest,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509Req},
};
use thiserror::Error;

use crate::key_pair::KeyPair;

/// 用於描述建立 CSR（證書簽名請求）過程中可能發生的錯誤。
#[derive(Debug, Error)]
pub enum CsrError {
    #[error("Openssl error: {0}")]
    OpensslError(#[from] openssl::error::ErrorStack),
    #[error("No SAN entries")]
    NoSanEntries,
}

type Result<T> = result::Result<T, CsrError>;

/// CSR 建構器，所有網域都列入主體替代名稱 (SAN)。
///
/// 網域超過一個時，第一個網域同時作為主體的 CN。
#[derive(Debug, Default)]
pub struct CSR {
    san_entries: Vec<String>,
}

impl CSR {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新增一個 DNS 主體替代名稱 (SAN)。
    pub fn set_san(mut self, dns_name: &str) -> Self {
        self.san_entries.push(dns_name.to_string());
        self
    }

    /// 依序新增多個 SAN。
    pub fn set_sans<I, S>(self, dns_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        dns_names
            .into_iter()
            .fold(self, |csr, name| csr.set_san(name.as_ref()))
    }

    /// 以指定的金鑰對簽署並建立 CSR。
    ///
    /// # 參數
    ///
    /// * `key_pair` - 憑證金鑰，公鑰寫入請求並以私鑰簽署。
    ///
    /// # 錯誤
    ///
    /// 未設定 SAN 時回傳 `CsrError::NoSanEntries`，其餘為 OpenSSL 錯誤。
    pub fn build(self, key_pair: &KeyPair) -> Result<X509Req> {
        if self.san_entries.is_empty() {
            return Err(CsrError::NoSanEntries);
        }

        let mut req_builder = X509Req::builder()?;

        if self.san_entries.len() > 1 {
            let mut name = X509NameBuilder::new()?;
            name.append_entry_by_text("CN", &self.san_entries[0])?;
            req_builder.set_subject_name(&name.build())?;
        }

        let mut san_builder = SubjectAlternativeName::new();
        for entry in &self.san_entries {
            san_builder.dns(entry);
        }
        let san_extension = san_builder.build(&req_builder.x509v3_context(None))?;

        let mut stack = Stack::new()?;
        stack.push(san_extension)?;
        req_builder.add_extensions(&stack)?;

        req_builder.set_pubkey(&key_pair.pri_key)?;
        req_builder.sign(&key_pair.pri_key, MessageDigest::sha256())?;

        Ok(req_builder.build())
    }
}
