//! 直接改寫權威伺服器區域檔的轉接器。
//!
//! 區域檔中 `; token area` 這一行之後的內容由本轉接器管理，每次改寫時整段重建；
//! 其餘內容只會更動序號行（`<數字> ; serial`）。

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
};

use chrono::Local;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{
    directive::{DirectiveRecord, TxtRecord},
    provider::{DnsAdapter, ProviderError},
};

type Result<T> = std::result::Result<T, ProviderError>;

/// 權杖區域的起始標記行。
pub const TOKEN_AREA_MARKER: &str = "; token area";

/// 改寫區域檔並在每次改寫後執行重新載入指令。
#[derive(Debug)]
pub struct ZoneFileAdapter {
    path: PathBuf,
    commands: Vec<String>,
    records: Vec<TxtRecord>,
}

impl ZoneFileAdapter {
    /// # 參數
    ///
    /// - `path`: 區域檔路徑。
    /// - `commands`: 每次改寫後透過 `sh -c` 依序執行的指令，例如 `rndc reload`。
    pub fn new(path: PathBuf, commands: Vec<String>) -> Self {
        Self {
            path,
            commands,
            records: Vec::new(),
        }
    }

    /// 目前寫在權杖區域中的記錄。
    pub fn records(&self) -> &[TxtRecord] {
        &self.records
    }

    fn rewrite(&self) -> Result<u64> {
        let content = fs::read_to_string(&self.path)?;
        let (content, serial) = bump_serial(&content, today_serial())?;

        let mut content = truncate_token_area(&content);
        for record in &self.records {
            content.push_str(&DirectiveRecord::Upsert(record.clone()).to_string());
            content.push('\n');
        }

        write_atomically(&self.path, content.as_bytes())?;
        debug!(
            path = %self.path.display(),
            serial,
            records = self.records.len(),
            "zone file rewritten"
        );

        self.run_commands()?;
        Ok(serial)
    }

    fn run_commands(&self) -> Result<()> {
        for command in &self.commands {
            info!(command = %command, "running reload command");
            let status = Command::new("sh").arg("-c").arg(command).status()?;
            if !status.success() {
                warn!(command = %command, %status, "reload command failed");
                return Err(ProviderError::Command {
                    command: command.clone(),
                    status,
                });
            }
        }
        Ok(())
    }
}

impl DnsAdapter for ZoneFileAdapter {
    fn apply_upsert(&mut self, record: &TxtRecord) -> Result<()> {
        let inserted = !self.records.contains(record);
        if inserted {
            self.records.push(record.clone());
        }

        if let Err(e) = self.rewrite() {
            if inserted {
                self.records.pop();
            }
            return Err(e);
        }
        Ok(())
    }

    fn apply_clear(&mut self) -> Result<()> {
        self.records.clear();
        self.rewrite().map(|_| ())
    }
}

/// 今天日期的最小序號，格式為 `YYYYMMDD00`。
fn today_serial() -> u64 {
    Local::now()
        .format("%Y%m%d00")
        .to_string()
        .parse()
        .unwrap_or_default()
}

/// 將第一個序號行更新為 `max(舊序號 + 1, floor)`。
fn bump_serial(content: &str, floor: u64) -> Result<(String, u64)> {
    let mut output = String::with_capacity(content.len() + 2);
    let mut bumped = None;

    for line in content.split_inclusive('\n') {
        if bumped.is_none() {
            if let Some((start, end, old)) = parse_serial_line(line) {
                let serial = old.saturating_add(1).max(floor);
                output.push_str(&line[..start]);
                output.push_str(&serial.to_string());
                output.push_str(&line[end..]);
                bumped = Some(serial);
                continue;
            }
        }
        output.push_str(line);
    }

    bumped
        .map(|serial| (output, serial))
        .ok_or(ProviderError::MissingSerial)
}

/// 符合 `^\s+(\d+)\s*;\s*serial$`（不分大小寫）時回傳數字的位置與數值。
fn parse_serial_line(line: &str) -> Option<(usize, usize, u64)> {
    let body = line.trim_end_matches(['\n', '\r']);

    let start = body.len() - body.trim_start().len();
    if start == 0 {
        return None;
    }
    let digits = body[start..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    let end = start + digits;

    let comment = body[end..].trim_start().strip_prefix(';')?;
    if !comment.trim_start().eq_ignore_ascii_case("serial") {
        return None;
    }

    let value = body[start..end].parse().ok()?;
    Some((start, end, value))
}

/// 保留標記行之前（含標記行）的內容；沒有標記時在結尾補上。
fn truncate_token_area(content: &str) -> String {
    let mut output = String::with_capacity(content.len());

    for line in content.split_inclusive('\n') {
        if line.trim_end_matches(['\n', '\r']).eq_ignore_ascii_case(TOKEN_AREA_MARKER) {
            output.push_str(TOKEN_AREA_MARKER);
            output.push('\n');
            return output;
        }
        output.push_str(line);
    }

    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(TOKEN_AREA_MARKER);
    output.push('\n');
    output
}

/// 寫入同目錄下的暫存檔後改名覆蓋，保留原檔案權限。
fn write_atomically(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    if let Ok(metadata) = fs::metadata(path) {
        fs::set_permissions(temp.path(), metadata.permissions())?;
    }
    temp.persist(path).map_err(|e| ProviderError::Io(e.error))?;

    Ok(())
}
