//! Gehirn DNS REST API 轉接器。

use std::env;

use reqwest::{
    blocking::{Client, RequestBuilder, Response},
    StatusCode,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::{
    directive::TxtRecord,
    provider::{DnsAdapter, ProviderError},
};

type Result<T> = std::result::Result<T, ProviderError>;

pub const DEFAULT_BASE_URI: &str = "https://api.gis.gehirn.jp/dns/v1/";
pub const TOKEN_ENV: &str = "GEHIRN_DNS_API_TOKEN";
pub const SECRET_ENV: &str = "GEHIRN_DNS_API_SECRET";

const CHALLENGE_TTL: u32 = 60;

/// API 金鑰組。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GehirnCredentials {
    pub token: String,
    pub secret: String,
}

impl GehirnCredentials {
    /// 優先使用設定值，未設定時讀取 `GEHIRN_DNS_API_TOKEN` / `GEHIRN_DNS_API_SECRET`。
    pub fn resolve(token: Option<&str>, secret: Option<&str>) -> Result<Self> {
        let lookup = |value: Option<&str>, name: &str| {
            value
                .map(str::to_owned)
                .or_else(|| env::var(name).ok())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ProviderError::Configuration(format!("{name} is not set")))
        };

        Ok(Self {
            token: lookup(token, TOKEN_ENV)?,
            secret: lookup(secret, SECRET_ENV)?,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
struct Zone {
    id: String,
    name: String,
    current_version_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecordData {
    data: String,
}

/// 同名同類型的記錄集合；未知欄位原樣保留，PUT 時一併送回。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RecordSet {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    name: String,
    #[serde(rename = "type")]
    record_type: String,
    ttl: u32,
    #[serde(default)]
    enable_alias: bool,
    #[serde(default)]
    records: Vec<RecordData>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    message: Option<String>,
}

/// 對記錄集合要做的變更。
#[derive(Debug, Clone, PartialEq)]
enum Change {
    Create(RecordSet),
    Update(RecordSet),
    Delete(String),
    Nothing,
}

/// 透過 Gehirn DNS API 新增與移除 TXT 記錄。
#[derive(Debug)]
pub struct GehirnAdapter {
    client: Client,
    base_uri: String,
    credentials: GehirnCredentials,
    added: Vec<TxtRecord>,
}

impl GehirnAdapter {
    /// # 參數
    ///
    /// - `credentials`: API 金鑰組，以 HTTP Basic 認證送出。
    /// - `base_uri`: API 根路徑，未指定時使用 [`DEFAULT_BASE_URI`]。
    pub fn new(credentials: GehirnCredentials, base_uri: Option<&str>) -> Result<Self> {
        let mut base_uri = base_uri.unwrap_or(DEFAULT_BASE_URI).to_owned();
        if !base_uri.starts_with("http://") && !base_uri.starts_with("https://") {
            return Err(ProviderError::Configuration(format!(
                "invalid base URI: {base_uri}"
            )));
        }
        if !base_uri.ends_with('/') {
            base_uri.push('/');
        }

        Ok(Self {
            client: Client::builder().build()?,
            base_uri,
            credentials,
            added: Vec::new(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_uri, endpoint)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request
            .basic_auth(&self.credentials.token, Some(&self.credentials.secret))
            .send()?;
        Ok(Self::check(response)?.json()?)
    }

    fn dispatch(&self, request: RequestBuilder) -> Result<()> {
        let response = request
            .basic_auth(&self.credentials.token, Some(&self.credentials.secret))
            .send()?;
        Self::check(response).map(|_| ())
    }

    fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(response);
        }

        let body = response.text().unwrap_or_default();
        Err(ProviderError::Api {
            status: status.as_u16(),
            message: api_message(&body),
        })
    }

    fn zones(&self) -> Result<Vec<Zone>> {
        self.send(self.client.get(self.url("zones")))
    }

    fn records_endpoint(zone: &Zone) -> String {
        format!("zones/{}/versions/{}/records", zone.id, zone.current_version_id)
    }

    fn records(&self, zone: &Zone) -> Result<Vec<RecordSet>> {
        self.send(self.client.get(self.url(&Self::records_endpoint(zone))))
    }

    fn lookup(&self, fqdn: &str) -> Result<(Zone, Option<RecordSet>)> {
        let zones = self.zones()?;
        let zone = owning_zone(&zones, fqdn)
            .cloned()
            .ok_or_else(|| ProviderError::ZoneNotFound {
                fqdn: fqdn.to_owned(),
            })?;

        let current = self
            .records(&zone)?
            .into_iter()
            .find(|r| r.name == fqdn && r.record_type == "TXT");
        if current.as_ref().is_some_and(|r| r.enable_alias) {
            return Err(ProviderError::AliasRecord {
                fqdn: fqdn.to_owned(),
            });
        }

        Ok((zone, current))
    }

    fn execute(&self, zone: &Zone, change: Change) -> Result<()> {
        let endpoint = Self::records_endpoint(zone);
        match change {
            Change::Create(set) => {
                debug!(name = %set.name, "creating record set");
                self.dispatch(self.client.post(self.url(&endpoint)).json(&set))?;
            }
            Change::Update(set) => {
                let id = set.id.clone().unwrap_or_default();
                debug!(name = %set.name, id = %id, "updating record set");
                self.dispatch(
                    self.client
                        .put(self.url(&format!("{endpoint}/{id}")))
                        .json(&set),
                )?;
            }
            Change::Delete(id) => {
                debug!(id = %id, "deleting record set");
                self.dispatch(self.client.delete(self.url(&format!("{endpoint}/{id}"))))?;
            }
            Change::Nothing => {}
        }
        Ok(())
    }
}

impl DnsAdapter for GehirnAdapter {
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<()> {
        let (zone, current) = self.lookup(&record.fqdn)?;
        info!(
            fqdn = %record.fqdn,
            zone = %zone.name,
            host = %host_in_zone(&record.fqdn, &zone.name),
            "adding TXT record"
        );

        self.execute(&zone, add_value(current, record))?;
        self.added.push(record.clone());
        Ok(())
    }

    /// 每筆記錄都會嘗試移除；失敗的記錄保留下來，供下一次清除重試。
    fn apply_clear(&mut self) -> Result<()> {
        let mut added = std::mem::take(&mut self.added);
        let result = remove_tracked(&mut added, |record| {
            let (zone, current) = self.lookup(&record.fqdn)?;
            info!(fqdn = %record.fqdn, zone = %zone.name, "removing TXT record");
            self.execute(&zone, remove_value(current, &record.content))
        });
        self.added = added;
        result
    }
}

/// 對每筆記錄呼叫 `remove`，成功的記錄從 `added` 移除，失敗的記錄留在原位。
fn remove_tracked<F>(added: &mut Vec<TxtRecord>, mut remove: F) -> Result<()>
where
    F: FnMut(&TxtRecord) -> Result<()>,
{
    let mut failures = Vec::new();
    added.retain(|record| match remove(record) {
        Ok(()) => false,
        Err(e) => {
            warn!(fqdn = %record.fqdn, error = %e, "cannot remove TXT record");
            failures.push(format!("{}: {e}", record.fqdn));
            true
        }
    });

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ProviderError::IncompleteClear(failures))
    }
}

/// 名稱最長、且為 `fqdn` 後綴的區域。
fn owning_zone<'a>(zones: &'a [Zone], fqdn: &str) -> Option<&'a Zone> {
    zones
        .iter()
        .filter(|z| {
            let apex = format!("{}.", z.name);
            fqdn == apex || fqdn.ends_with(&format!(".{apex}"))
        })
        .max_by_key(|z| z.name.len())
}

/// 去掉 `.<zone>.` 後的主機名稱，位於區域頂點時為空字串。
fn host_in_zone(fqdn: &str, zone: &str) -> String {
    fqdn.strip_suffix(&format!(".{zone}."))
        .unwrap_or_default()
        .to_owned()
}

fn add_value(current: Option<RecordSet>, record: &TxtRecord) -> Change {
    let value = RecordData {
        data: record.content.clone(),
    };

    match current {
        None => Change::Create(RecordSet {
            id: None,
            name: record.fqdn.clone(),
            record_type: "TXT".to_owned(),
            ttl: CHALLENGE_TTL,
            enable_alias: false,
            records: vec![value],
            extra: Map::new(),
        }),
        Some(mut set) => {
            set.records.push(value);
            Change::Update(set)
        }
    }
}

fn remove_value(current: Option<RecordSet>, content: &str) -> Change {
    let Some(mut set) = current else {
        return Change::Nothing;
    };
    let before = set.records.len();
    set.records.retain(|r| r.data != content);

    match (set.records.len() == before, set.records.is_empty(), set.id.clone()) {
        (true, _, _) | (_, _, None) => Change::Nothing,
        (false, true, Some(id)) => Change::Delete(id),
        (false, false, Some(_)) => Change::Update(set),
    }
}

fn api_message(body: &str) -> String {
    if body.is_empty() {
        return "couldn't access to server".to_owned();
    }
    serde_json::from_str::<ApiMessage>(body)
        .ok()
        .and_then(|m| m.message)
        .unwrap_or_else(|| body.to_owned())
}
