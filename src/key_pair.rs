use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::Path,
};

use openssl::{
    error::ErrorStack,
    pkey::{Id, PKey, Private, Public},
    rsa::Rsa,
};
use thiserror::Error;

/// 帳戶金鑰的預設長度。
pub const ACCOUNT_KEY_BITS: u32 = 4096;

/// 鍵相關操作的錯誤列舉，涵蓋 OpenSSL、檔案讀寫與不支援的演算法。
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("OpenSSL error: {0}")]
    OpenSSL(#[from] ErrorStack),
    #[error("Key file I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Unsupported algorithm")]
    UnsupportedAlgorithm,
}

/// 本模組使用的結果類型，當中錯誤皆為 `KeyError`。
type Result<T> = std::result::Result<T, KeyError>;

/// 表示一組 RSA 非對稱金鑰對。
///
/// 帳戶金鑰與每次簽發的憑證金鑰都使用此結構。
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// 私鑰，使用 OpenSSL 的 `PKey` 封裝。
    pub pri_key: PKey<Private>,
    /// 公鑰，從私鑰派生而來。
    pub pub_key: PKey<Public>,
}

impl KeyPair {
    /// 產生一組新的 RSA 金鑰對。
    ///
    /// # 參數
    ///
    /// - `bits`: 金鑰長度。
    ///
    /// # 回傳
    ///
    /// 成功回傳新產生的 `KeyPair`，否則回傳 `KeyError::OpenSSL`。
    pub fn generate(bits: u32) -> Result<Self> {
        let pri_key = PKey::from_rsa(Rsa::generate(bits)?)?;
        let pub_key = Self::derive_public_key(&pri_key)?;

        Ok(Self { pri_key, pub_key })
    }

    /// 根據 PEM 格式的私鑰資料建立一組金鑰對。
    ///
    /// # 參數
    ///
    /// - `pri_key_pem`: 私鑰的 PEM 格式位元組切片。
    ///
    /// # 回傳
    ///
    /// 成功回傳建立好的 `KeyPair`；資料無法解析或不是 RSA 金鑰時回傳錯誤。
    pub fn from_pem(pri_key_pem: &[u8]) -> Result<Self> {
        let pri_key = PKey::private_key_from_pem(pri_key_pem)?;
        let pub_key = Self::derive_public_key(&pri_key)?;

        Ok(Self { pri_key, pub_key })
    }

    /// 從指定的檔案路徑讀取 PEM 格式的私鑰並建立金鑰對。
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pri_key_data = fs::read(path)?;
        Self::from_pem(&pri_key_data)
    }

    /// 以 PKCS#8 PEM 格式匯出私鑰。
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        Ok(self.pri_key.private_key_to_pem_pkcs8()?)
    }

    /// 將私鑰寫入新檔案，檔案權限為 `mode`，必要時建立上層目錄。
    ///
    /// 目標檔案已存在時回傳 `io::ErrorKind::AlreadyExists`，既有的金鑰不會被覆寫。
    ///
    /// # 參數
    ///
    /// - `path`: 目標檔案路徑。
    /// - `mode`: Unix 權限位元，例如 `0o400`。
    pub fn write_new<P: AsRef<Path>>(&self, path: P, mode: u32) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let pem = self.to_pem()?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(path)?;
        file.write_all(&pem)?;
        file.sync_all()?;

        Ok(())
    }

    /// 取得金鑰的位元長度，例如 4096。
    pub fn bits(&self) -> Result<u32> {
        match self.pri_key.id() {
            Id::RSA => Ok(self.pri_key.rsa()?.size() * 8),
            _ => Err(KeyError::UnsupportedAlgorithm),
        }
    }

    fn derive_public_key(pri_key: &PKey<Private>) -> Result<PKey<Public>> {
        match pri_key.id() {
            Id::RSA => {
                let rsa = pri_key.rsa()?;
                let pub_rsa =
                    Rsa::from_public_components(rsa.n().to_owned()?, rsa.e().to_owned()?)?;
                Ok(PKey::from_rsa(pub_rsa)?)
            }
            _ => Err(KeyError::UnsupportedAlgorithm),
        }
    }
}
