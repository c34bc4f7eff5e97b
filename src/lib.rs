//! # ACME DNS-01 Authorization Library
//!
//! 本庫以 DNS-01 挑戰自動完成網域驗證，並在整批網域全部驗證成功後申請新憑證、
//! 以原子化的方式切換目前使用中的憑證。適合自行管理權威 DNS（區域檔或 DNS 服務商 API）、
//! 又無法使用 HTTP-01 的環境。
//!
//! ## 模組
//!
//! - **zone**: 區域設定的載入、預設值與驗證。
//! - **account**: CA 帳戶金鑰的讀取或建立與註冊。
//! - **orchestrator**: 授權流程本體：取得挑戰、送出 DNS 指令、等待傳播、請求驗證、清除記錄與續約。
//! - **propagation**: 向名稱伺服器輪詢 TXT 記錄。
//! - **renewal**: 續約判斷、憑證寫入與 `current` 連結切換。
//! - **provider** / **zonefile** / **gehirn**: 執行 DNS 記錄指令的轉接器。
//! - **ca**: 與 CA 溝通的能力介面，由使用者提供實作。
//!
//! ## 使用方式
//!
//! ```no_run
//! use acme_dns01::{
//!     account::ensure_account,
//!     ca::CaConnector,
//!     logging,
//!     orchestrator::Orchestrator,
//!     provider::create_adapter,
//!     zone::ZoneConfig,
//! };
//!
//! fn run(connector: &dyn CaConnector) -> Result<(), Box<dyn std::error::Error>> {
//!     // 1. 載入並正規化設定
//!     let zone = ZoneConfig::load("/etc/acme/example.com.toml")?;
//!     logging::init(&zone.log, "info")?;
//!
//!     // 2. 取得或建立 CA 帳戶
//!     let client = ensure_account(&zone.authkey, &zone.mail, &zone.endpoint, connector)?;
//!
//!     // 3. 依設定建立 DNS 轉接器並執行授權流程
//!     let mut adapter = create_adapter(&zone)?;
//!     let report = Orchestrator::new(zone, client).authorize(&mut adapter)?;
//!     println!("{} domain(s) validated", report.valid_count());
//!
//!     Ok(())
//! }
//! ```

pub mod account;
pub mod ca;
pub mod cancel;
pub mod certificate;
pub mod challenge;
pub mod csr;
pub mod directive;
pub mod gehirn;
pub mod key_pair;
pub mod logging;
pub mod orchestrator;
pub mod propagation;
pub mod provider;
pub mod renewal;
pub mod zone;
pub mod zonefile;

#[cfg(test)]
mod testing;
