//! DNS-01 授權協調流程。
//!
//! 單次執行依序處理設定中的每個網域：
//!
//! 1. 向 CA 取得挑戰
//! 2. 送出新增 TXT 記錄的指令
//! 3. 等待記錄傳播到名稱伺服器
//! 4. 請求驗證並輪詢至終結狀態
//!
//! 所有網域結束後送出唯一一次清除指令；只有每個網域都驗證成功時才申請新憑證。
//! 單一網域失敗不會中斷整批處理，同一次執行內也不會重試。

use std::mem;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::{
    ca::{CaClient, CaError},
    cancel::CancelToken,
    challenge::{Challenge, ChallengeStatus},
    directive::{DirectiveRecord, TxtRecord},
    propagation::{HickoryLookup, PropagationError, PropagationVerifier, TxtLookup},
    provider::{DnsAdapter, ProviderError},
    renewal::{CertificateArtifact, RenewalError, RenewalManager},
    zone::ZoneConfig,
};

/// 單一網域授權失敗的原因。
#[derive(Debug, Error)]
pub enum AuthorizationError {
    #[error("Challenge request failed: {0}")]
    Challenge(CaError),
    #[error("DNS update failed: {0}")]
    Directive(#[from] ProviderError),
    #[error("TXT record {fqdn} did not propagate after {attempts} attempts")]
    PropagationTimeout { fqdn: String, attempts: u32 },
    #[error("Propagation check failed: {0}")]
    Propagation(PropagationError),
    #[error("Validation request failed: {0}")]
    Validation(CaError),
    #[error("Validation still {status} after {attempts} polls")]
    ValidationTimeout {
        status: ChallengeStatus,
        attempts: u32,
    },
}

/// 中止整次執行的錯誤。
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Run cancelled")]
    Cancelled,
}

type Result<T> = std::result::Result<T, OrchestratorError>;

/// 協調流程目前所在的階段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    CheckingExpiry,
    SkippedNotDue,
    Authorizing { index: usize },
    ClearingRecords,
    Issuing,
    Done,
}

/// 單一網域的授權結果。
#[derive(Debug)]
pub enum DomainOutcome {
    Valid,
    /// CA 回報的非成功終結狀態
    Invalid(ChallengeStatus),
    Failed(AuthorizationError),
}

impl DomainOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// 憑證申請的結果。
#[derive(Debug)]
pub enum RenewalOutcome {
    /// 未申請：憑證尚未到期或並非所有網域都驗證成功
    NotAttempted,
    Renewed(CertificateArtifact),
    Failed(RenewalError),
}

/// 單次執行的報告。
#[derive(Debug)]
pub struct AuthorizationReport {
    /// 憑證尚未進入續約期間，未與 CA 互動
    pub skipped: bool,
    /// 依設定順序排列的各網域結果
    pub outcomes: Vec<(String, DomainOutcome)>,
    /// 清除指令失敗時仍可能留在 DNS 中的記錄
    pub stale_records: Vec<TxtRecord>,
    pub renewal: RenewalOutcome,
}

impl AuthorizationReport {
    fn skipped() -> Self {
        Self {
            skipped: true,
            outcomes: Vec::new(),
            stale_records: Vec::new(),
            renewal: RenewalOutcome::NotAttempted,
        }
    }

    /// 驗證成功的網域數。
    pub fn valid_count(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.is_valid()).count()
    }

    /// 清除指令是否成功。
    pub fn cleared(&self) -> bool {
        self.stale_records.is_empty()
    }

    pub fn renewed(&self) -> Option<&CertificateArtifact> {
        match &self.renewal {
            RenewalOutcome::Renewed(artifact) => Some(artifact),
            _ => None,
        }
    }
}

/// 驅動整個 DNS-01 授權與續約流程。
#[derive(Debug)]
pub struct Orchestrator {
    zone: ZoneConfig,
    client: Box<dyn CaClient>,
    verifier: PropagationVerifier,
    renewal: RenewalManager,
    cancel: CancelToken,
    added: Vec<TxtRecord>,
    state: RunState,
}

impl Orchestrator {
    /// 使用預設的 DNS 查詢與憑證目錄設定建立協調器。
    pub fn new(zone: ZoneConfig, client: Box<dyn CaClient>) -> Self {
        OrchestratorBuilder::new(zone, client).build()
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// 取得本協調器使用的取消權杖，可交給其他執行緒呼叫 `cancel`。
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn renewal_manager(&self) -> &RenewalManager {
        &self.renewal
    }

    /// 執行一次完整的授權流程。
    ///
    /// # 參數
    ///
    /// - `adapter`: 執行 DNS 記錄指令的轉接器。
    ///
    /// # 回傳
    ///
    /// 回傳各網域結果與續約結果；單一網域或續約失敗都記錄在報告中。
    /// 執行期間被取消時，仍會先送出清除指令，再回傳 `OrchestratorError::Cancelled`。
    pub fn authorize(&mut self, adapter: &mut dyn DnsAdapter) -> Result<AuthorizationReport> {
        self.state = RunState::CheckingExpiry;
        if !self.check_expiry() {
            info!(zone = %self.zone.name, "certificate not due for renewal, skip update");
            self.state = RunState::SkippedNotDue;
            return Ok(AuthorizationReport::skipped());
        }

        info!(zone = %self.zone.name, domains = self.zone.domains.len(), "start update");
        self.added.clear();

        let domains = self.zone.domains.clone();
        let mut outcomes = Vec::with_capacity(domains.len());
        let mut cancelled = false;

        for (index, domain) in domains.iter().enumerate() {
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            self.state = RunState::Authorizing { index };
            info!(domain = %domain, index, "authorize");
            match self.authorize_domain(domain, adapter) {
                Ok(outcome) => outcomes.push((domain.clone(), outcome)),
                Err(OrchestratorError::Cancelled) => {
                    cancelled = true;
                    break;
                }
            }
        }

        self.state = RunState::ClearingRecords;
        let stale_records = self.clear_records(adapter);

        if cancelled {
            warn!(zone = %self.zone.name, "run cancelled");
            self.state = RunState::Done;
            return Err(OrchestratorError::Cancelled);
        }

        let mut report = AuthorizationReport {
            skipped: false,
            outcomes,
            stale_records,
            renewal: RenewalOutcome::NotAttempted,
        };

        let valid = report.valid_count();
        if valid == domains.len() {
            if self.cancel.is_cancelled() {
                self.state = RunState::Done;
                return Err(OrchestratorError::Cancelled);
            }

            self.state = RunState::Issuing;
            report.renewal = match self.renewal.renew(&domains, self.client.as_ref()) {
                Ok(artifact) => {
                    info!(
                        id = %artifact.id,
                        not_after = %artifact.not_after,
                        "certificate renewed"
                    );
                    RenewalOutcome::Renewed(artifact)
                }
                Err(e) => {
                    error!(zone = %self.zone.name, error = %e, "certificate renewal failed");
                    RenewalOutcome::Failed(e)
                }
            };
        } else {
            warn!(
                zone = %self.zone.name,
                valid,
                total = domains.len(),
                "not every domain validated, certificate not requested"
            );
        }

        self.state = RunState::Done;
        info!(zone = %self.zone.name, valid, "complete update");
        Ok(report)
    }

    /// 回傳是否需要續約；剩餘時間落在警告天數內時記錄警告。
    fn check_expiry(&self) -> bool {
        let now = Utc::now();
        if let Some(remaining) = self.renewal.current_remaining(now) {
            if remaining < Duration::days(i64::from(self.zone.warning_days)) {
                warn!(
                    zone = %self.zone.name,
                    remaining_days = remaining.num_days(),
                    "current certificate is about to expire"
                );
            }
        }

        self.renewal.is_renewal_due_at(now, self.zone.margin_days)
    }

    fn authorize_domain(
        &mut self,
        domain: &str,
        adapter: &mut dyn DnsAdapter,
    ) -> Result<DomainOutcome> {
        let challenge = match self.client.request_challenge(domain) {
            Ok(challenge) => challenge,
            Err(e) => return Ok(failed(domain, "challenge", AuthorizationError::Challenge(e))),
        };

        let record = TxtRecord::for_challenge(&challenge);
        info!(
            domain = %domain,
            directive = %DirectiveRecord::Upsert(record.clone()),
            "emitting upsert directive"
        );
        if let Err(e) = adapter.apply_upsert(&record) {
            return Ok(failed(domain, "upsert", e.into()));
        }
        self.added.push(record.clone());

        match self
            .verifier
            .wait_for_record(&self.zone.nameservers, &record.fqdn, &record.content)
        {
            Ok(attempts) => debug!(domain = %domain, attempts, "record propagated"),
            Err(PropagationError::Cancelled) => return Err(OrchestratorError::Cancelled),
            Err(PropagationError::Timeout { fqdn, attempts }) => {
                return Ok(failed(
                    domain,
                    "propagation",
                    AuthorizationError::PropagationTimeout { fqdn, attempts },
                ))
            }
            Err(e) => {
                return Ok(failed(
                    domain,
                    "propagation",
                    AuthorizationError::Propagation(e),
                ))
            }
        }

        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::Cancelled);
        }
        if let Err(e) = self.client.request_validation(&challenge) {
            return Ok(failed(domain, "validation", AuthorizationError::Validation(e)));
        }

        self.poll_validation(domain, &challenge)
    }

    fn poll_validation(&self, domain: &str, challenge: &Challenge) -> Result<DomainOutcome> {
        let policy = self.zone.validation;
        let mut status = ChallengeStatus::Pending;

        for attempt in 1..=policy.max_attempts {
            if self.cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            status = match self.client.validation_status(challenge) {
                Ok(status) => status,
                Err(e) => {
                    return Ok(failed(domain, "validation", AuthorizationError::Validation(e)))
                }
            };

            if status == ChallengeStatus::Valid {
                info!(domain = %domain, status = %status, "verify status");
                return Ok(DomainOutcome::Valid);
            }
            if status.is_terminal() {
                warn!(domain = %domain, stage = "validation", status = %status, "verify status");
                return Ok(DomainOutcome::Invalid(status));
            }

            trace!(domain = %domain, status = %status, attempt, "validation pending");
            if attempt < policy.max_attempts && !self.cancel.sleep(policy.interval) {
                return Err(OrchestratorError::Cancelled);
            }
        }

        Ok(failed(
            domain,
            "validation",
            AuthorizationError::ValidationTimeout {
                status,
                attempts: policy.max_attempts,
            },
        ))
    }

    /// 送出清除指令；失敗時回傳可能殘留的記錄。
    fn clear_records(&mut self, adapter: &mut dyn DnsAdapter) -> Vec<TxtRecord> {
        let added = mem::take(&mut self.added);
        info!(records = added.len(), "emitting clear directive");

        match adapter.apply_clear() {
            Ok(()) => Vec::new(),
            Err(e) => {
                let fqdns: Vec<&str> = added.iter().map(|r| r.fqdn.as_str()).collect();
                error!(error = %e, records = ?fqdns, "clear directive failed, records may remain");
                added
            }
        }
    }
}

fn failed(domain: &str, stage: &'static str, error: AuthorizationError) -> DomainOutcome {
    warn!(domain = %domain, stage, error = %error, "domain authorization failed");
    DomainOutcome::Failed(error)
}

/// 用於構建 [`Orchestrator`] 的構造器。
pub struct OrchestratorBuilder {
    zone: ZoneConfig,
    client: Box<dyn CaClient>,
    lookup: Option<Box<dyn TxtLookup>>,
    renewal: Option<RenewalManager>,
    cancel: CancelToken,
}

impl OrchestratorBuilder {
    pub fn new(zone: ZoneConfig, client: Box<dyn CaClient>) -> Self {
        Self {
            zone,
            client,
            lookup: None,
            renewal: None,
            cancel: CancelToken::new(),
        }
    }

    /// 設定 TXT 查詢方式，預設為 [`HickoryLookup`]。
    pub fn lookup(mut self, lookup: Box<dyn TxtLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// 設定憑證目錄管理器，預設依區域設定的 `certdir` 與 `certname` 建立。
    pub fn renewal_manager(mut self, renewal: RenewalManager) -> Self {
        self.renewal = Some(renewal);
        self
    }

    pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn build(self) -> Orchestrator {
        let lookup = self
            .lookup
            .unwrap_or_else(|| Box::new(HickoryLookup::default()));
        let verifier = PropagationVerifier::new(lookup, self.zone.propagation, self.cancel.clone());
        let renewal = self.renewal.unwrap_or_else(|| {
            RenewalManager::new(self.zone.certdir.clone(), self.zone.certname.clone())
        });

        Orchestrator {
            zone: self.zone,
            client: self.client,
            verifier,
            renewal,
            cancel: self.cancel,
            added: Vec::new(),
            state: RunState::Idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EventLog, FakeDns, ScriptedCa};
    use serde_json::json;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    const DOMAINS: [&str; 3] = ["example.com", "www.example.com", "mail.example.com"];

    struct Harness {
        _dir: TempDir,
        log: EventLog,
        dns: FakeDns,
        ca: ScriptedCa,
        zone: ZoneConfig,
        cancel: CancelToken,
    }

    impl Harness {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let log = EventLog::default();
            let zone = zone_config(dir.path());
            Self {
                dns: FakeDns::with_log(log.clone()),
                ca: ScriptedCa::new().with_log(log.clone()),
                log,
                zone,
                cancel: CancelToken::new(),
                _dir: dir,
            }
        }

        fn orchestrator(&self) -> Orchestrator {
            let renewal = RenewalManager::new(self.zone.certdir.clone(), self.zone.certname.clone())
                .key_bits(1024);
            OrchestratorBuilder::new(self.zone.clone(), Box::new(self.ca.clone()))
                .lookup(Box::new(self.dns.lookup()))
                .renewal_manager(renewal)
                .cancel_token(self.cancel.clone())
                .build()
        }

        fn run(&self) -> Result<AuthorizationReport> {
            let mut adapter = self.dns.adapter();
            self.orchestrator().authorize(&mut adapter)
        }
    }

    fn zone_config(dir: &Path) -> ZoneConfig {
        ZoneConfig::from_value(json!({
            "domains": DOMAINS,
            "nameservers": ["192.0.2.53"],
            "authkey": dir.join("account.pem"),
            "certdir": dir.join("certs"),
            "propagation": { "interval_ms": 0, "max_attempts": 3 },
            "validation": { "interval_ms": 0, "max_attempts": 4 },
        }))
        .unwrap()
    }

    fn fqdn(domain: &str) -> String {
        format!("_acme-challenge.{domain}.")
    }

    #[test]
    fn test_all_valid_renews_certificate() {
        let harness = Harness::new();

        let report = harness.run().unwrap();

        assert!(!report.skipped);
        assert_eq!(report.valid_count(), 3);
        assert!(report.cleared());
        let artifact = report.renewed().expect("certificate renewed");
        let current = harness.orchestrator().renewal_manager().current_artifact().unwrap();
        assert_eq!(current.as_ref(), Some(artifact));
        assert_eq!(harness.ca.issued_count(), 1);
    }

    #[test]
    fn test_exactly_one_clear_after_every_attempt() {
        let harness = Harness::new();
        harness.ca.statuses("www.example.com", &[ChallengeStatus::Invalid]);

        harness.run().unwrap();

        let events = harness.log.events();
        let clears: Vec<usize> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.as_str() == "clear")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(clears.len(), 1);

        let last_domain_event = events
            .iter()
            .rposition(|e| e.ends_with("mail.example.com"))
            .unwrap();
        assert!(clears[0] > last_domain_event);
        assert_eq!(harness.dns.directives().last().map(String::as_str), Some(""));
    }

    #[test]
    fn test_per_domain_ordering() {
        let harness = Harness::new();
        harness.run().unwrap();

        let events = harness.log.events();
        let position = |event: String| events.iter().position(|e| *e == event).unwrap();

        for (i, domain) in DOMAINS.iter().enumerate() {
            let upsert = position(format!("upsert {}", fqdn(domain)));
            let validate = position(format!("validate {domain}"));
            assert!(position(format!("challenge {domain}")) < upsert);
            assert!(upsert < validate);
            if let Some(next) = DOMAINS.get(i + 1) {
                assert!(validate < position(format!("challenge {next}")));
            }
        }
        assert_eq!(events.last().map(String::as_str), Some("issue"));
    }

    #[test]
    fn test_expiring_certificate_is_replaced() {
        let harness = Harness::new();
        let expiring = harness
            .orchestrator()
            .renewal_manager()
            .renew(&harness.zone.domains, &ScriptedCa::new().validity_days(5))
            .unwrap();

        let report = harness.run().unwrap();

        assert!(!report.skipped);
        let renewed = report.renewed().expect("certificate renewed");
        assert_ne!(renewed.id, expiring.id);
        assert_ne!(renewed.dir, expiring.dir);
        assert!(renewed.not_after - expiring.not_after > Duration::days(80));
        assert!(expiring.dir.join("cert.pem").exists());

        let current = harness.orchestrator().renewal_manager().current_artifact().unwrap();
        assert_eq!(current.as_ref(), Some(renewed));
        assert_eq!(harness.ca.issued_count(), 1);
    }

    #[test]
    fn test_wildcard_domain_uses_base_record_name() {
        let mut harness = Harness::new();
        harness.zone.domains = vec!["*.example.com".to_owned(), "www.example.com".to_owned()];

        let report = harness.run().unwrap();

        assert_eq!(report.valid_count(), 2);
        assert!(report.renewed().is_some());
        let directives = harness.dns.directives();
        assert_eq!(
            directives[0],
            format!("{} IN TXT \"token-*.example.com\"", fqdn("example.com"))
        );
        assert!(harness
            .log
            .events()
            .contains(&format!("upsert {}", fqdn("example.com"))));
    }

    #[test]
    fn test_one_invalid_domain_blocks_issuance() {
        let harness = Harness::new();
        let first = harness.run().unwrap();
        let published = first.renewed().unwrap().clone();

        // 以超過有效期的邊界強制再次執行
        let mut harness = harness;
        harness.zone.margin_days = 365;
        harness
            .ca
            .statuses("www.example.com", &[ChallengeStatus::Pending, ChallengeStatus::Invalid]);

        let report = harness.run().unwrap();

        assert_eq!(report.valid_count(), 2);
        assert!(matches!(
            report.outcomes[1],
            (_, DomainOutcome::Invalid(ChallengeStatus::Invalid))
        ));
        assert!(matches!(report.renewal, RenewalOutcome::NotAttempted));
        assert_eq!(harness.ca.issued_count(), 1);
        let current = harness.orchestrator().renewal_manager().current_artifact().unwrap();
        assert_eq!(current, Some(published));
    }

    #[test]
    fn test_propagation_timeout_continues_with_next_domain() {
        let harness = Harness::new();
        harness.dns.blackhole(&fqdn("example.com"));

        let report = harness.run().unwrap();

        assert!(matches!(
            &report.outcomes[0],
            (_, DomainOutcome::Failed(AuthorizationError::PropagationTimeout { attempts: 3, .. }))
        ));
        assert!(report.outcomes[1].1.is_valid());
        assert!(report.outcomes[2].1.is_valid());
        assert_eq!(report.valid_count(), 2);

        let events = harness.log.events();
        assert!(!events.contains(&"validate example.com".to_owned()));
        assert!(events.contains(&"challenge www.example.com".to_owned()));
        assert_eq!(events.iter().filter(|e| *e == "clear").count(), 1);
        assert!(!events.contains(&"issue".to_owned()));
    }

    #[test]
    fn test_challenge_and_upsert_failures_do_not_abort() {
        let harness = Harness::new();
        harness.ca.reject_challenge("example.com");
        harness.dns.fail_upsert(&fqdn("www.example.com"));

        let report = harness.run().unwrap();

        assert!(matches!(
            &report.outcomes[0].1,
            DomainOutcome::Failed(AuthorizationError::Challenge(_))
        ));
        assert!(matches!(
            &report.outcomes[1].1,
            DomainOutcome::Failed(AuthorizationError::Directive(_))
        ));
        assert!(report.outcomes[2].1.is_valid());
        assert_eq!(harness.log.events().iter().filter(|e| *e == "clear").count(), 1);
        assert!(matches!(report.renewal, RenewalOutcome::NotAttempted));
    }

    #[test]
    fn test_validation_timeout() {
        let harness = Harness::new();
        harness.ca.statuses("mail.example.com", &[ChallengeStatus::Pending]);

        let report = harness.run().unwrap();

        assert!(matches!(
            &report.outcomes[2].1,
            DomainOutcome::Failed(AuthorizationError::ValidationTimeout {
                status: ChallengeStatus::Pending,
                attempts: 4
            })
        ));
        assert_eq!(harness.ca.status_polls("mail.example.com"), 4);
    }

    #[test]
    fn test_not_due_skips_without_contacting_ca() {
        let harness = Harness::new();
        harness.run().unwrap();
        let before = harness.log.events().len();

        let mut orchestrator = harness.orchestrator();
        let mut adapter = harness.dns.adapter();
        let report = orchestrator.authorize(&mut adapter).unwrap();

        assert!(report.skipped);
        assert_eq!(orchestrator.state(), RunState::SkippedNotDue);
        assert_eq!(harness.log.events().len(), before);
    }

    #[test]
    fn test_cancel_still_emits_clear() {
        let harness = Harness::new();
        harness.dns.cancel_on_upsert(harness.cancel.clone(), 2);

        let mut orchestrator = harness.orchestrator();
        let mut adapter = harness.dns.adapter();
        let result = orchestrator.authorize(&mut adapter);

        assert!(matches!(result, Err(OrchestratorError::Cancelled)));
        assert_eq!(orchestrator.state(), RunState::Done);

        let events = harness.log.events();
        assert_eq!(events.last().map(String::as_str), Some("clear"));
        assert!(!events.contains(&"validate www.example.com".to_owned()));
        assert!(!events.contains(&"challenge mail.example.com".to_owned()));
        assert!(!events.contains(&"issue".to_owned()));
    }

    #[test]
    fn test_failed_clear_is_reported_and_renewal_proceeds() {
        let harness = Harness::new();
        harness.dns.fail_clear();

        let report = harness.run().unwrap();

        assert!(!report.cleared());
        assert_eq!(report.stale_records.len(), 3);
        assert!(report.renewed().is_some());
    }

    #[test]
    fn test_issuance_failure_is_not_fatal() {
        let harness = Harness::new();
        harness.ca.set_fail_issuance(true);

        let report = harness.run().unwrap();

        assert_eq!(report.valid_count(), 3);
        assert!(matches!(
            report.renewal,
            RenewalOutcome::Failed(RenewalError::Issuance(_))
        ));
        assert!(harness
            .orchestrator()
            .renewal_manager()
            .current_artifact()
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_state_starts_idle() {
        let harness = Harness::new();
        assert_eq!(harness.orchestrator().state(), RunState::Idle);
    }
}
