//! 憑證續約判斷與原子化發布。
//!
//! 目錄結構：
//!
//! ```text
//! <certdir>/<issuance-id>/{privkey,cert,chain,fullchain}.pem
//! <certdir>/current -> <issuance-id>
//! ```
//!
//! 每次簽發寫入新的子目錄，舊目錄保留不刪；`current` 連結以「建立暫存連結後改名」
//! 的方式切換，讀取端只會看到舊的或新的完整組合。

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::{symlink, OpenOptionsExt},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Duration, Local, Utc};
use openssl::x509::X509;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    ca::{CaClient, CaError},
    certificate::{Certificate, CertificateError},
    csr::{CsrError, CSR},
    key_pair::{KeyError, KeyPair},
    zone::CertNames,
};

#[derive(Debug, Error)]
pub enum RenewalError {
    #[error("Certificate issuance failed: {0}")]
    Issuance(#[from] CaError),
    #[error("CSR error: {0}")]
    Csr(#[from] CsrError),
    #[error("Certificate key error: {0}")]
    Key(#[from] KeyError),
    #[error("Issued chain is unusable: {0}")]
    InvalidChain(String),
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),
    #[error("Failed to persist {path:?}: {source}")]
    Persist { path: PathBuf, source: io::Error },
}

type Result<T> = std::result::Result<T, RenewalError>;

/// 簽發目錄名稱的時間格式。
const ISSUANCE_ID_FORMAT: &str = "%Y%m%d%H%M%S";
const CURRENT_LINK: &str = "current";
/// 同一秒內重複簽發時可嘗試的後綴數量。
const MAX_ID_SUFFIX: u32 = 1000;

/// 憑證金鑰的預設長度。
pub const CERT_KEY_BITS: u32 = 2048;

fn persist_error(path: &Path) -> impl FnOnce(io::Error) -> RenewalError + '_ {
    move |source| RenewalError::Persist {
        path: path.to_path_buf(),
        source,
    }
}

/// 單次簽發寫入磁碟的憑證組合。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateArtifact {
    /// 簽發識別碼，也是子目錄名稱
    pub id: String,
    pub dir: PathBuf,
    pub privkey: PathBuf,
    pub cert: PathBuf,
    pub chain: PathBuf,
    pub fullchain: PathBuf,
    /// 葉憑證的到期時間
    pub not_after: DateTime<Utc>,
}

impl CertificateArtifact {
    fn locate(dir: PathBuf, names: &CertNames, not_after: DateTime<Utc>) -> Self {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id,
            privkey: dir.join(&names.privkey),
            cert: dir.join(&names.cert),
            chain: dir.join(&names.chain),
            fullchain: dir.join(&names.fullchain),
            not_after,
            dir,
        }
    }
}

/// 管理憑證目錄：判斷是否需要續約、寫入新憑證並切換 `current`。
#[derive(Debug, Clone)]
pub struct RenewalManager {
    cert_dir: PathBuf,
    names: CertNames,
    key_bits: u32,
}

impl RenewalManager {
    pub fn new(cert_dir: PathBuf, names: CertNames) -> Self {
        Self {
            cert_dir,
            names,
            key_bits: CERT_KEY_BITS,
        }
    }

    /// 設定憑證金鑰長度。
    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub fn current_link(&self) -> PathBuf {
        self.cert_dir.join(CURRENT_LINK)
    }

    /// 讀取 `current` 底下的葉憑證；尚未發布過時回傳 `None`。
    pub fn current_certificate(&self) -> Result<Option<Certificate>> {
        let path = self.current_link().join(&self.names.cert);
        match fs::read(&path) {
            Ok(pem) => Ok(Some(Certificate::from_pem(&pem)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RenewalError::Persist { path, source: e }),
        }
    }

    /// 目前發布的憑證在 `now` 時的剩餘有效時間。
    pub fn current_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self.current_certificate() {
            Ok(Some(cert)) => cert.remaining(now).ok(),
            _ => None,
        }
    }

    /// 以目前時間判斷是否需要續約，見 [`RenewalManager::is_renewal_due_at`]。
    pub fn is_renewal_due(&self, margin_days: u32) -> bool {
        self.is_renewal_due_at(Utc::now(), margin_days)
    }

    /// `current` 沒有可用的憑證，或剩餘有效時間少於 `margin_days` 時回傳 `true`。
    ///
    /// 此判斷不改變任何狀態，同一時間點重複呼叫結果相同。
    pub fn is_renewal_due_at(&self, now: DateTime<Utc>, margin_days: u32) -> bool {
        match self.current_certificate() {
            Ok(None) => {
                debug!(dir = %self.cert_dir.display(), "no current certificate");
                true
            }
            Ok(Some(cert)) => match cert.should_renew(margin_days, now) {
                Ok(due) => due,
                Err(e) => {
                    warn!(error = %e, "cannot read certificate expiry, treating as due");
                    true
                }
            },
            Err(e) => {
                warn!(error = %e, "current certificate is unreadable, treating as due");
                true
            }
        }
    }

    /// 讀回目前發布中的憑證組合。
    pub fn current_artifact(&self) -> Result<Option<CertificateArtifact>> {
        let link = self.current_link();
        let target = match fs::read_link(&link) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RenewalError::Persist { path: link, source: e }),
        };
        let dir = if target.is_absolute() {
            target
        } else {
            self.cert_dir.join(target)
        };

        let pem = fs::read(dir.join(&self.names.cert)).map_err(persist_error(&dir))?;
        let not_after = Certificate::from_pem(&pem)?.not_after()?;

        Ok(Some(CertificateArtifact::locate(dir, &self.names, not_after)))
    }

    /// 申請新憑證、寫入新的簽發目錄並切換 `current`。
    ///
    /// # 參數
    ///
    /// - `domains`: 憑證涵蓋的網域，依序列入 SAN，超過一個時第一個作為 CN。
    /// - `client`: 已綁定帳戶的 CA 用戶端。
    ///
    /// # 回傳
    ///
    /// 成功回傳新發布的 [`CertificateArtifact`]；任何一步失敗時 `current` 維持原狀。
    pub fn renew(&self, domains: &[String], client: &dyn CaClient) -> Result<CertificateArtifact> {
        let artifact = self.stage(domains, client)?;
        self.publish(&artifact)?;
        Ok(artifact)
    }

    /// 申請憑證並寫入新的簽發目錄，但不切換 `current`。
    pub fn stage(&self, domains: &[String], client: &dyn CaClient) -> Result<CertificateArtifact> {
        let key = KeyPair::generate(self.key_bits)?;
        let csr = CSR::new().set_sans(domains).build(&key)?;
        let csr_der = csr.to_der().map_err(CsrError::from)?;

        info!(domains = ?domains, "submitting certificate request");
        let issued = client.submit_certificate_request(&csr_der)?;

        let chain = X509::stack_from_pem(issued.chain_pem.as_bytes())
            .map_err(|e| RenewalError::InvalidChain(e.to_string()))?;
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or_else(|| RenewalError::InvalidChain("empty chain".to_owned()))?;

        let to_pem = |cert: &X509| {
            cert.to_pem()
                .map_err(|e| RenewalError::InvalidChain(e.to_string()))
        };
        let cert_pem = to_pem(leaf)?;
        let mut chain_pem = Vec::new();
        for cert in intermediates {
            chain_pem.extend(to_pem(cert)?);
        }
        let mut fullchain_pem = cert_pem.clone();
        fullchain_pem.extend_from_slice(&chain_pem);

        let not_after = Certificate { cert: leaf.clone() }.not_after()?;
        let key_pem = key.to_pem()?;

        let dir = self.create_issuance_dir()?;
        let artifact = CertificateArtifact::locate(dir, &self.names, not_after);

        let written = write_file(&artifact.privkey, &key_pem, 0o600)
            .and_then(|_| write_file(&artifact.cert, &cert_pem, 0o644))
            .and_then(|_| write_file(&artifact.chain, &chain_pem, 0o644))
            .and_then(|_| write_file(&artifact.fullchain, &fullchain_pem, 0o644));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_dir_all(&artifact.dir) {
                warn!(
                    dir = %artifact.dir.display(),
                    error = %cleanup,
                    "cannot remove incomplete issuance directory"
                );
            }
            return Err(e);
        }

        info!(id = %artifact.id, not_after = %artifact.not_after, "certificate staged");
        Ok(artifact)
    }

    /// 將 `current` 原子化地指向 `artifact` 的目錄。
    pub fn publish(&self, artifact: &CertificateArtifact) -> Result<()> {
        let link = self.current_link();
        let staging = self.cert_dir.join(format!("{CURRENT_LINK}.{}.tmp", artifact.id));

        match fs::remove_file(&staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RenewalError::Persist { path: staging, source: e }),
        }
        symlink(&artifact.id, &staging).map_err(persist_error(&staging))?;

        if let Err(e) = fs::rename(&staging, &link) {
            let _ = fs::remove_file(&staging);
            return Err(RenewalError::Persist { path: link, source: e });
        }

        info!(id = %artifact.id, link = %link.display(), "current certificate switched");
        Ok(())
    }

    fn create_issuance_dir(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.cert_dir).map_err(persist_error(&self.cert_dir))?;

        let base = Local::now().format(ISSUANCE_ID_FORMAT).to_string();
        for suffix in 0..MAX_ID_SUFFIX {
            let id = match suffix {
                0 => base.clone(),
                n => format!("{base}-{n}"),
            };
            let dir = self.cert_dir.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(RenewalError::Persist { path: dir, source: e }),
            }
        }

        Err(RenewalError::Persist {
            path: self.cert_dir.join(base),
            source: io::Error::new(io::ErrorKind::AlreadyExists, "no free issuance id"),
        })
    }
}

fn write_file(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
        .map_err(persist_error(path))?;
    file.write_all(content).map_err(persist_error(path))?;
    file.sync_all().map_err(persist_error(path))?;
    Ok(())
}
