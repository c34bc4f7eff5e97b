//! 測試用的替身：可編排結果的 CA、記錄指令的 DNS 與簽發測試憑證的簽發者。

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    error::ErrorStack,
    hash::MessageDigest,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{X509NameBuilder, X509Req, X509},
};

use crate::{
    ca::{CaClient, CaConnector, CaError, IssuedCertificate},
    cancel::CancelToken,
    challenge::{Challenge, ChallengeStatus},
    directive::{DirectiveRecord, TxtRecord},
    key_pair::KeyPair,
    propagation::{PropagationError, TxtLookup},
    provider::{DnsAdapter, ProviderError},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// CA 與 DNS 替身共用的事件記錄，用於檢查呼叫順序。
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        lock(&self.0).push(event);
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }
}

/// 產生自簽憑證（PEM），有效期自現在起 `days` 天。
pub fn self_signed(common_name: &str, days: u32) -> Result<Vec<u8>, ErrorStack> {
    let key = PKey::from_rsa(Rsa::generate(1024)?)?;
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", common_name)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*BigNum::from_u32(1)?.to_asn1_integer()?)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
    builder.set_not_after(&*Asn1Time::days_from_now(days)?)?;
    builder.sign(&key, MessageDigest::sha256())?;

    builder.build().to_pem()
}

/// 以測試用中繼憑證簽署 CSR 的簽發者。
#[derive(Debug)]
struct TestIssuer {
    key: PKey<Private>,
    cert: X509,
}

impl TestIssuer {
    fn new() -> Result<Self, ErrorStack> {
        let key = PKey::from_rsa(Rsa::generate(1024)?)?;
        let mut name = X509NameBuilder::new()?;
        name.append_entry_by_text("CN", "Test Intermediate")?;
        let name = name.build();

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*BigNum::from_u32(1)?.to_asn1_integer()?)?;
        builder.set_subject_name(&name)?;
        builder.set_issuer_name(&name)?;
        builder.set_pubkey(&key)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(3650)?)?;
        builder.sign(&key, MessageDigest::sha256())?;

        Ok(Self {
            key,
            cert: builder.build(),
        })
    }

    /// 簽署 CSR，回傳葉憑證與中繼憑證串接的 PEM。
    fn issue(&self, csr_der: &[u8], serial: u32, days: u32) -> Result<String, ErrorStack> {
        let req = X509Req::from_der(csr_der)?;
        let pubkey = req.public_key()?;

        let mut builder = X509::builder()?;
        builder.set_version(2)?;
        builder.set_serial_number(&*BigNum::from_u32(serial)?.to_asn1_integer()?)?;
        builder.set_subject_name(req.subject_name())?;
        builder.set_issuer_name(self.cert.subject_name())?;
        builder.set_pubkey(&pubkey)?;
        builder.set_not_before(&*Asn1Time::days_from_now(0)?)?;
        builder.set_not_after(&*Asn1Time::days_from_now(days)?)?;
        for extension in req.extensions()? {
            builder.append_extension(extension)?;
        }
        builder.sign(&self.key, MessageDigest::sha256())?;

        let mut pem = builder.build().to_pem()?;
        pem.extend(self.cert.to_pem()?);
        Ok(String::from_utf8_lossy(&pem).into_owned())
    }
}

#[derive(Debug, Default)]
struct CaState {
    statuses: HashMap<String, VecDeque<ChallengeStatus>>,
    rejected: HashSet<String>,
    polls: HashMap<String, usize>,
    fail_issuance: bool,
    issued: u32,
    validity_days: u32,
}

/// 可預先編排各網域驗證結果的 CA 用戶端。
///
/// 未編排的網域一律驗證成功；編排的狀態序列用完後重複最後一個狀態。
#[derive(Debug, Clone)]
pub struct ScriptedCa {
    state: Arc<Mutex<CaState>>,
    issuer: Arc<TestIssuer>,
    log: EventLog,
}

impl ScriptedCa {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(CaState {
                validity_days: 90,
                ..CaState::default()
            })),
            issuer: Arc::new(TestIssuer::new().unwrap()),
            log: EventLog::default(),
        }
    }

    pub fn with_log(mut self, log: EventLog) -> Self {
        self.log = log;
        self
    }

    pub fn validity_days(self, days: u32) -> Self {
        lock(&self.state).validity_days = days;
        self
    }

    pub fn fail_issuance(self) -> Self {
        self.set_fail_issuance(true);
        self
    }

    pub fn set_fail_issuance(&self, fail: bool) {
        lock(&self.state).fail_issuance = fail;
    }

    pub fn statuses(&self, domain: &str, statuses: &[ChallengeStatus]) {
        lock(&self.state)
            .statuses
            .insert(domain.to_owned(), statuses.iter().copied().collect());
    }

    pub fn reject_challenge(&self, domain: &str) {
        lock(&self.state).rejected.insert(domain.to_owned());
    }

    pub fn issued_count(&self) -> u32 {
        lock(&self.state).issued
    }

    pub fn status_polls(&self, domain: &str) -> usize {
        lock(&self.state).polls.get(domain).copied().unwrap_or(0)
    }
}

impl CaClient for ScriptedCa {
    fn request_challenge(&self, domain: &str) -> Result<Challenge, CaError> {
        self.log.push(format!("challenge {domain}"));
        if lock(&self.state).rejected.contains(domain) {
            return Err(CaError::Rejected(format!("no authorization for {domain}")));
        }
        Ok(Challenge::dns01(
            domain,
            &format!("token-{domain}"),
            &format!("authz/{domain}"),
        ))
    }

    fn request_validation(&self, challenge: &Challenge) -> Result<(), CaError> {
        self.log.push(format!("validate {}", challenge.domain));
        Ok(())
    }

    fn validation_status(&self, challenge: &Challenge) -> Result<ChallengeStatus, CaError> {
        self.log.push(format!("status {}", challenge.domain));
        let mut state = lock(&self.state);
        *state.polls.entry(challenge.domain.clone()).or_default() += 1;

        let status = match state.statuses.get_mut(&challenge.domain) {
            None => ChallengeStatus::Valid,
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(ChallengeStatus::Valid),
            Some(queue) => queue.front().copied().unwrap_or(ChallengeStatus::Valid),
        };
        Ok(status)
    }

    fn submit_certificate_request(&self, csr_der: &[u8]) -> Result<IssuedCertificate, CaError> {
        self.log.push("issue".to_owned());
        let mut state = lock(&self.state);
        if state.fail_issuance {
            return Err(CaError::Rejected("issuance disabled".to_owned()));
        }

        state.issued += 1;
        let chain_pem = self
            .issuer
            .issue(csr_der, state.issued + 1, state.validity_days)
            .map_err(|e| CaError::Protocol(e.to_string()))?;
        Ok(IssuedCertificate { chain_pem })
    }
}

/// 記錄連線與註冊次數的連線器。
#[derive(Debug, Default)]
pub struct ScriptedConnector {
    reject: bool,
    connections: Mutex<usize>,
    registrations: Mutex<Vec<String>>,
}

impl ScriptedConnector {
    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::default()
        }
    }

    pub fn connections(&self) -> usize {
        *lock(&self.connections)
    }

    pub fn registrations(&self) -> Vec<String> {
        lock(&self.registrations).clone()
    }
}

impl CaConnector for ScriptedConnector {
    fn connect(&self, _key: &KeyPair, _endpoint: &str) -> Result<Box<dyn CaClient>, CaError> {
        *lock(&self.connections) += 1;
        Ok(Box::new(ScriptedCa::new()))
    }

    fn register(
        &self,
        _key: &KeyPair,
        contact: &str,
        _endpoint: &str,
    ) -> Result<Box<dyn CaClient>, CaError> {
        if self.reject {
            return Err(CaError::Rejected("terms of service not accepted".to_owned()));
        }
        lock(&self.registrations).push(contact.to_owned());
        Ok(Box::new(ScriptedCa::new()))
    }
}

#[derive(Debug, Default)]
struct DnsState {
    records: HashMap<String, Vec<String>>,
    blackholed: HashSet<String>,
    unreachable: HashSet<String>,
    delays: HashMap<String, u32>,
    failing_upserts: HashSet<String>,
    fail_clear: bool,
    cancel_on_upsert: Option<(CancelToken, usize)>,
    upserts: usize,
    queries: usize,
    directives: Vec<String>,
}

/// 記憶體中的 DNS：轉接器寫入的記錄立即可被查詢到，除非另行設定。
#[derive(Debug, Clone, Default)]
pub struct FakeDns {
    state: Arc<Mutex<DnsState>>,
    log: EventLog,
}

impl FakeDns {
    pub fn with_log(log: EventLog) -> Self {
        Self {
            log,
            ..Self::default()
        }
    }

    pub fn adapter(&self) -> RecordingAdapter {
        RecordingAdapter {
            dns: self.clone(),
            added: Vec::new(),
        }
    }

    pub fn lookup(&self) -> FakeLookup {
        FakeLookup { dns: self.clone() }
    }

    pub fn publish(&self, fqdn: &str, value: &str) {
        lock(&self.state)
            .records
            .entry(fqdn.to_owned())
            .or_default()
            .push(value.to_owned());
    }

    /// 記錄永遠不會出現在查詢結果中。
    pub fn blackhole(&self, fqdn: &str) {
        lock(&self.state).blackholed.insert(fqdn.to_owned());
    }

    /// 前 `queries` 次查詢回傳空結果。
    pub fn delay(&self, fqdn: &str, queries: u32) {
        lock(&self.state).delays.insert(fqdn.to_owned(), queries);
    }

    pub fn unreachable(&self, nameserver: &str) {
        lock(&self.state).unreachable.insert(nameserver.to_owned());
    }

    pub fn fail_upsert(&self, fqdn: &str) {
        lock(&self.state).failing_upserts.insert(fqdn.to_owned());
    }

    pub fn fail_clear(&self) {
        lock(&self.state).fail_clear = true;
    }

    /// 第 `nth` 次新增指令時發出取消訊號。
    pub fn cancel_on_upsert(&self, token: CancelToken, nth: usize) {
        lock(&self.state).cancel_on_upsert = Some((token, nth));
    }

    /// 轉接器收到的指令文字形式。
    pub fn directives(&self) -> Vec<String> {
        lock(&self.state).directives.clone()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.state).queries
    }
}

#[derive(Debug)]
pub struct FakeLookup {
    dns: FakeDns,
}

impl TxtLookup for FakeLookup {
    fn lookup_txt(&self, nameserver: &str, fqdn: &str) -> Result<Vec<String>, PropagationError> {
        let mut state = lock(&self.dns.state);
        state.queries += 1;

        if state.unreachable.contains(nameserver) {
            return Err(PropagationError::Nameserver(nameserver.to_owned()));
        }
        if let Some(remaining) = state.delays.get_mut(fqdn).filter(|n| **n > 0) {
            *remaining -= 1;
            return Ok(Vec::new());
        }
        if state.blackholed.contains(fqdn) {
            return Ok(Vec::new());
        }
        Ok(state.records.get(fqdn).cloned().unwrap_or_default())
    }
}

/// 將指令套用到 [`FakeDns`] 並寫入事件記錄的轉接器。
#[derive(Debug)]
pub struct RecordingAdapter {
    dns: FakeDns,
    added: Vec<TxtRecord>,
}

impl DnsAdapter for RecordingAdapter {
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<(), ProviderError> {
        self.dns.log.push(format!("upsert {}", record.fqdn));
        let mut state = lock(&self.dns.state);
        state
            .directives
            .push(DirectiveRecord::Upsert(record.clone()).to_string());
        state.upserts += 1;

        if let Some((token, nth)) = &state.cancel_on_upsert {
            if *nth == state.upserts {
                token.cancel();
            }
        }
        if state.failing_upserts.contains(&record.fqdn) {
            return Err(ProviderError::Rejected(format!("zone locked for {}", record.fqdn)));
        }

        state
            .records
            .entry(record.fqdn.clone())
            .or_default()
            .push(record.content.clone());
        self.added.push(record.clone());
        Ok(())
    }

    fn apply_clear(&mut self) -> Result<(), ProviderError> {
        self.dns.log.push("clear".to_owned());
        let mut state = lock(&self.dns.state);
        state.directives.push(DirectiveRecord::Clear.to_string());
        if state.fail_clear {
            return Err(ProviderError::Rejected("clear refused".to_owned()));
        }

        for record in self.added.drain(..) {
            if let Some(values) = state.records.get_mut(&record.fqdn) {
                values.retain(|v| *v != record.content);
            }
        }
        Ok(())
    }
}
