use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use fleetbot_contracts::{Entitlement, Permission, Region};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub const LINE_SEPARATOR: &str = "\n";
pub const BULLET: &str = "• ";
/// Telegram rejects messages above 4096 characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    NotACommand,
}

/// Splits `raw` on whitespace. The first token must start with `/`; a trailing
/// `@botname` on it is dropped and the name is lowercased.
pub fn parse_command(raw: &str) -> Result<ParsedCommand, ParseError> {
    let mut tokens = raw.split_whitespace();
    let head = tokens.next().ok_or(ParseError::NotACommand)?;
    if !head.starts_with('/') || head.len() == 1 {
        return Err(ParseError::NotACommand);
    }
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    Ok(ParsedCommand {
        name,
        args: tokens.map(str::to_string).collect(),
    })
}

pub fn holds_root(entitlements: &[Entitlement]) -> bool {
    entitlements
        .iter()
        .any(|e| e.permission == Permission::RootAccess)
}

/// Root access satisfies every check. A `None` service on either side matches
/// any service.
pub fn entitlements_grant(
    entitlements: &[Entitlement],
    permission: Permission,
    service: Option<&str>,
) -> bool {
    if holds_root(entitlements) {
        return true;
    }
    entitlements.iter().any(|e| {
        e.permission == permission
            && match (service, e.service.as_deref()) {
                (_, None) | (None, _) => true,
                (Some(wanted), Some(held)) => wanted.eq_ignore_ascii_case(held),
            }
    })
}

/// Services the entitlements allow `permission` on. Root and unscoped grants
/// expand to `known_services`; an empty set means nothing is allowed.
pub fn allowed_services(
    entitlements: &[Entitlement],
    permission: Permission,
    known_services: &[&str],
) -> BTreeSet<String> {
    let everything = || known_services.iter().map(|s| s.to_string()).collect();
    if holds_root(entitlements) {
        return everything();
    }
    let mut allowed = BTreeSet::new();
    for entitlement in entitlements.iter().filter(|e| e.permission == permission) {
        match entitlement.service.as_deref() {
            None => return everything(),
            Some(service) => {
                allowed.insert(service.to_ascii_lowercase());
            }
        }
    }
    allowed
}

/// Permission table keys are lowercase without a leading `@`.
pub fn normalize_username(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_ascii_lowercase()
}

/// Lowercases and replaces every run of non-alphanumerics with a single `-`.
pub fn sanitize_label(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

pub fn node_hostname(owner: &str, city: &str, prefix: &str, suffix: u32) -> String {
    let owner = sanitize_label(owner);
    let owner = if owner.is_empty() { "node" } else { &owner };
    format!("{owner}-{}-{prefix}{suffix}", sanitize_label(city))
}

/// Matches `input` against region ids and cities, ignoring case.
pub fn resolve_region<'a>(regions: &'a [Region], input: &str) -> Option<&'a Region> {
    let needle = input.trim();
    regions
        .iter()
        .find(|r| r.id.eq_ignore_ascii_case(needle) || r.city.eq_ignore_ascii_case(needle))
}

pub fn split_key_value(arg: &str) -> Option<(&str, &str)> {
    let (key, value) = arg.split_once('=')?;
    if key.is_empty() {
        return None;
    }
    Some((key, value))
}

pub fn bullet_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| format!("{BULLET}{}", item.as_ref()))
        .collect::<Vec<_>>()
        .join(LINE_SEPARATOR)
}

/// Splits on line boundaries so each chunk stays within `max_chars`. Single
/// lines longer than the limit are hard-split.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.split(LINE_SEPARATOR) {
        let mut line: Vec<char> = line.chars().collect();
        while line.len() > max_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let rest = line.split_off(max_chars);
            chunks.push(line.into_iter().collect());
            line = rest;
        }
        let line: String = line.into_iter().collect();
        let needed = if current.is_empty() {
            line.chars().count()
        } else {
            current.chars().count() + 1 + line.chars().count()
        };
        if needed > max_chars && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str(LINE_SEPARATOR);
        }
        current.push_str(&line);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

pub fn marker_file_name(event_id: &str) -> String {
    let name: String = event_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

pub fn parse_rfc3339(ts: &str) -> Option<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|v| v.with_timezone(&Utc))
}

/// Short "1d 2h", "3h 5m" or "12m" age rendering.
pub fn describe_age(started_at: &str, now: DateTime<Utc>) -> Option<String> {
    let started = parse_rfc3339(started_at)?;
    let minutes = (now - started).num_minutes().max(0);
    let (days, hours, mins) = (minutes / 1440, (minutes % 1440) / 60, minutes % 60);
    Some(if days > 0 {
        format!("{days}d {hours}h")
    } else if hours > 0 {
        format!("{hours}h {mins}m")
    } else {
        format!("{mins}m")
    })
}

pub fn jcs_sha256_hex(value: &Value) -> Result<String, String> {
    let canonical = serde_jcs::to_string(value)
        .map_err(|err| format!("failed to canonicalize JSON via JCS: {err}"))?;
    Ok(sha256_hex(canonical.as_bytes()))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
