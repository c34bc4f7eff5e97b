//! DNS 記錄指令。
//!
//! 協調流程不直接修改 DNS，而是送出指令交由轉接器執行。指令的文字形式為
//! `<fqdn> IN TXT "<content>"`，清除指令的文字形式為空字串。

use std::{fmt, str::FromStr};

use thiserror::Error;

use crate::challenge::Challenge;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectiveParseError {
    #[error("Malformed directive: {0:?}")]
    Malformed(String),
    #[error("Unsupported record type: {0}")]
    UnsupportedType(String),
}

/// 一筆 TXT 記錄。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxtRecord {
    /// 完整網域名稱，結尾帶根點
    pub fqdn: String,
    pub content: String,
}

impl TxtRecord {
    pub fn new(fqdn: &str, content: &str) -> Self {
        Self {
            fqdn: fqdn.to_owned(),
            content: content.to_owned(),
        }
    }

    /// 依挑戰建立對應的 TXT 記錄。
    pub fn for_challenge(challenge: &Challenge) -> Self {
        Self::new(&challenge.fqdn(), &challenge.content)
    }
}

/// 交給 DNS 轉接器的指令。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectiveRecord {
    /// 新增或更新一筆 TXT 記錄
    Upsert(TxtRecord),
    /// 移除本次執行新增的所有記錄
    Clear,
}

impl fmt::Display for DirectiveRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upsert(record) => write!(f, "{} IN TXT \"{}\"", record.fqdn, record.content),
            Self::Clear => Ok(()),
        }
    }
}

impl FromStr for DirectiveRecord {
    type Err = DirectiveParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let line = s.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(Self::Clear);
        }

        let malformed = || DirectiveParseError::Malformed(line.to_owned());

        let (fqdn, rest) = line.split_once(" IN ").ok_or_else(malformed)?;
        let (record_type, quoted) = rest.split_once(' ').ok_or_else(malformed)?;
        if record_type.is_empty() || !record_type.bytes().all(|b| b.is_ascii_uppercase()) {
            return Err(malformed());
        }
        let content = quoted
            .strip_prefix('"')
            .and_then(|q| q.strip_suffix('"'))
            .ok_or_else(malformed)?;

        if record_type != "TXT" {
            return Err(DirectiveParseError::UnsupportedType(record_type.to_owned()));
        }

        Ok(Self::Upsert(TxtRecord::new(fqdn, content)))
    }
}
