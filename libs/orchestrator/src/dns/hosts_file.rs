//! DNS provider backed by a hosts-format file.
//!
//! Each record is one `ip<TAB>name` entry. Upserts move a name to its new
//! address; deletes drop the name and any line left without names. Comments,
//! blank lines and unrelated entries are preserved, including comments that
//! trail an entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hvctl_topology::DnsProviderSpec;
use tracing::{debug, info};

use super::DnsProvider;
use crate::error::{Error, Result};
use crate::hypervisor::{ApplyMode, DnsRecord};

/// One parsed line of a hosts file.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        ip: String,
        names: Vec<String>,
        comment: Option<String>,
    },
    Other(String),
}

impl Line {
    fn maps(&self, address: &str, name: &str) -> bool {
        match self {
            Self::Entry { ip, names, .. } => ip == address && names.iter().any(|n| n == name),
            Self::Other(_) => false,
        }
    }
}

fn parse(content: &str) -> Vec<Line> {
    content
        .lines()
        .map(|raw| {
            let (data, comment) = match raw.find('#') {
                Some(start) => (&raw[..start], Some(raw[start..].to_string())),
                None => (raw, None),
            };
            let mut fields = data.split_whitespace();
            let Some(ip) = fields.next() else {
                return Line::Other(raw.to_string());
            };
            let names: Vec<String> = fields.map(str::to_string).collect();
            if names.is_empty() {
                return Line::Other(raw.to_string());
            }
            Line::Entry {
                ip: ip.to_string(),
                names,
                comment,
            }
        })
        .collect()
}

fn render(lines: &[Line]) -> String {
    let mut out = String::new();
    for line in lines {
        match line {
            Line::Entry { ip, names, comment } => {
                out.push_str(ip);
                out.push('\t');
                out.push_str(&names.join(" "));
                if let Some(comment) = comment {
                    out.push(' ');
                    out.push_str(comment);
                }
            }
            Line::Other(raw) => out.push_str(raw),
        }
        out.push('\n');
    }
    out
}

/// Drop `name` from entries for which `unwanted(ip)` holds.
fn strip_name(lines: &mut Vec<Line>, name: &str, unwanted: impl Fn(&str) -> bool) -> usize {
    let mut removed = 0;
    for line in lines.iter_mut() {
        if let Line::Entry { ip, names, .. } = line {
            if unwanted(ip) {
                let before = names.len();
                names.retain(|n| n != name);
                removed += before - names.len();
            }
        }
    }
    lines.retain(|line| !matches!(line, Line::Entry { names, .. } if names.is_empty()));
    removed
}

/// Apply `records` as upserts. Returns the new content and the number of
/// records that changed.
pub fn upsert(content: &str, records: &[DnsRecord]) -> (String, usize) {
    let mut lines = parse(content);
    let mut changed = 0;

    for record in records {
        let ip = record.ip.to_string();
        let moved = strip_name(&mut lines, &record.name, |line_ip| line_ip != ip);
        let present = lines.iter().any(|line| line.maps(&ip, &record.name));
        if !present {
            lines.push(Line::Entry {
                ip,
                names: vec![record.name.clone()],
                comment: None,
            });
        }
        if moved > 0 || !present {
            changed += 1;
        }
    }

    (render(&lines), changed)
}

/// Apply `records` as deletes. Returns the new content and the number of
/// records that were present.
pub fn remove(content: &str, records: &[DnsRecord]) -> (String, usize) {
    let mut lines = parse(content);
    let mut changed = 0;

    for record in records {
        let ip = record.ip.to_string();
        if strip_name(&mut lines, &record.name, |line_ip| line_ip == ip) > 0 {
            changed += 1;
        }
    }

    (render(&lines), changed)
}

/// Hosts-file DNS provider; `params.path` names the file.
#[derive(Debug, Clone)]
pub struct HostsFileProvider {
    name: String,
    path: PathBuf,
}

impl HostsFileProvider {
    pub const KIND: &'static str = "hosts_file";

    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            path: path.into(),
        }
    }

    pub fn from_spec(name: &str, spec: &DnsProviderSpec) -> Result<Self> {
        let path = spec
            .params
            .get("path")
            .and_then(|value| value.as_str())
            .ok_or_else(|| Error::Config(format!("dns provider {name}: missing param path")))?;
        Ok(Self::new(name, path))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(self.error(format!("reading {}: {e}", self.path.display()))),
        }
    }

    async fn write(&self, content: &str) -> Result<()> {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| self.error(format!("writing {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.error(format!("replacing {}: {e}", self.path.display())))
    }

    async fn apply(
        &self,
        records: &[DnsRecord],
        mode: ApplyMode,
        action: &'static str,
        edit: fn(&str, &[DnsRecord]) -> (String, usize),
    ) -> Result<()> {
        let current = self.read().await?;
        let (updated, changed) = edit(&current, records);

        if changed == 0 {
            debug!(provider = %self.name, action, "Hosts file already up to date");
            return Ok(());
        }
        if !mode.is_apply() {
            info!(provider = %self.name, action, changed, "Plan: would update hosts file");
            return Ok(());
        }

        self.write(&updated).await?;
        info!(provider = %self.name, path = %self.path.display(), action, changed, "Updated hosts file");
        Ok(())
    }

    fn error(&self, message: String) -> Error {
        Error::Dns {
            provider: self.name.clone(),
            message,
        }
    }
}

#[async_trait]
impl DnsProvider for HostsFileProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()> {
        self.apply(records, mode, "upsert", upsert).await
    }

    async fn ensure_not_exists(&self, records: &[DnsRecord], mode: ApplyMode) -> Result<()> {
        self.apply(records, mode, "delete", remove).await
    }
}
