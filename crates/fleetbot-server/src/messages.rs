use std::collections::{BTreeMap, HashMap};

pub trait Translator: Send + Sync {
    /// Renders `template` for `language`, substituting `{0}`, `{1}`, ... from `params`.
    fn translate(&self, language: &str, template: &str, params: &[String]) -> String;
}

const BUILTIN_EN: &[(&str, &str)] = &[
    ("error.not_a_command", "Messages must be commands starting with '/'. Send /help to see what you can do."),
    ("error.unknown_command", "Unknown command {0}. Commands available to you:"),
    ("error.invalid_syntax", "Invalid syntax: {0}"),
    ("error.unauthorized", "You are not authorized to perform this action."),
    ("error.internal", "Something went wrong while handling your request. Please try again later."),
    ("help.header", "Available commands:"),
    ("help.empty", "No commands are available to you."),
    ("help.item", "{0} {1}"),
    ("command.help.description", "show the commands you can use"),
    ("command.regions.description", "list supported regions"),
    ("command.services.description", "list supported service types"),
    ("command.runnode.description", "<service> <region> [hostname] [KEY=VALUE...]: launch a node"),
    ("command.nodes.description", "[all]: list running nodes"),
    ("command.stopnode.description", "<task id|hostname>: stop a node"),
    ("command.servers.description", "list servers"),
    ("command.startserver.description", "<name>: start a server and wait until it runs"),
    ("command.stopserver.description", "<name>: stop a server and wait until it stops"),
    ("command.restartserver.description", "<name>: stop then start a server"),
    ("command.rebootserver.description", "<name>: reboot a running server or start a stopped one"),
    ("command.grant.description", "<user> <PERMISSION> [service]: grant a permission"),
    ("command.revoke.description", "<user> [PERMISSION]: revoke permissions"),
    ("command.users.description", "list users and their permissions"),
    ("usage.runnode", "/runnode <service> <region> [hostname] [KEY=VALUE...]"),
    ("usage.nodes", "/nodes [all]"),
    ("usage.stopnode", "/stopnode <task id|hostname>"),
    ("usage.server", "{0} <name>"),
    ("usage.grant", "/grant <user> <PERMISSION> [service]"),
    ("usage.revoke", "/revoke <user> [PERMISSION]"),
    ("usage.bad_argument", "{0} is not KEY=VALUE"),
    ("regions.header", "Supported regions:"),
    ("regions.item", "{0} ({1}): {2}"),
    ("regions.empty", "No regions are configured."),
    ("services.header", "Supported services:"),
    ("nodes.unknown_service", "Unknown service {0}. Supported: {1}"),
    ("nodes.unknown_region", "Unknown region {0}. Send /regions to see the supported ones."),
    ("nodes.unsupported_region", "{0} is not available in {1}."),
    ("nodes.hostname_taken", "Hostname {0} is already in use in {1}."),
    ("nodes.hostname_exhausted", "No free hostname found after {0} attempts."),
    ("nodes.launching", "Launching {0} node {1} in {2}..."),
    ("nodes.ready", "Node {0} is ready. Address: {1}"),
    ("nodes.unhealthy", "Node {0} failed its health check."),
    ("nodes.timeout", "Node {0} is still starting. Check back later with /nodes."),
    ("nodes.header", "Running nodes:"),
    ("nodes.empty", "No running nodes."),
    ("nodes.item", "{0} ({1}, {2}) {3}, ip {4}, owner {5}, up {6}"),
    ("nodes.not_found", "Node {0} was not found."),
    ("nodes.not_owner", "Node {0} belongs to {1}."),
    ("nodes.stopped", "Node {0} is stopping."),
    ("nodes.cloud_error", "Compute request failed: {0}"),
    ("servers.header", "Servers:"),
    ("servers.empty", "No servers found."),
    ("servers.item", "{0} ({1}) in {2}: {3}"),
    ("servers.not_found", "Server {0} was not found."),
    ("servers.starting", "Starting server {0}..."),
    ("servers.started", "Server {0} is running. Address: {1}"),
    ("servers.already_running", "Server {0} is already running."),
    ("servers.stopping", "Stopping server {0}..."),
    ("servers.stopped", "Server {0} is stopped."),
    ("servers.already_stopped", "Server {0} is already stopped."),
    ("servers.timeout", "Server {0} did not become {1} within {2}s. Check back later with /servers."),
    ("servers.rebooting", "Rebooting server {0}."),
    ("servers.reboot_starting", "Server {0} was stopped; starting it."),
    ("servers.invalid_state", "Server {0} cannot be rebooted while {1}."),
    ("servers.cloud_error", "Compute request failed: {0}"),
    ("users.header", "Users:"),
    ("users.empty", "No users hold permissions."),
    ("users.item", "{0}: {1}"),
    ("users.granted", "Granted {1} to {0}."),
    ("users.already_granted", "{0} already holds {1}."),
    ("users.unknown_permission", "Unknown permission {0}. Known: {1}"),
    ("users.revoked", "Removed {1} permission(s) from {0}."),
    ("users.nothing_revoked", "{0} holds no matching permissions."),
    ("users.any_service", "all services"),
];

/// Language to key to text. `en` starts from the built-in table; an optional
/// YAML file of the same shape overrides or adds entries.
pub struct MessageCatalog {
    default_language: String,
    catalogs: HashMap<String, HashMap<String, String>>,
}

impl MessageCatalog {
    pub fn builtin(default_language: &str) -> Self {
        let en = BUILTIN_EN
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            default_language: normalize_language(default_language),
            catalogs: HashMap::from([("en".to_string(), en)]),
        }
    }

    pub fn load(default_language: &str, override_path: Option<&str>) -> Result<Self, String> {
        let mut catalog = Self::builtin(default_language);
        let Some(path) = override_path else {
            return Ok(catalog);
        };
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("read message catalog {path} failed: {e}"))?;
        let overrides: BTreeMap<String, BTreeMap<String, String>> = serde_yaml::from_str(&text)
            .map_err(|e| format!("parse message catalog {path} failed: {e}"))?;
        for (language, entries) in overrides {
            catalog
                .catalogs
                .entry(normalize_language(&language))
                .or_default()
                .extend(entries);
        }
        Ok(catalog)
    }

    fn lookup(&self, language: &str, key: &str) -> Option<&str> {
        self.catalogs
            .get(language)
            .and_then(|entries| entries.get(key))
            .map(String::as_str)
    }
}

impl Translator for MessageCatalog {
    fn translate(&self, language: &str, template: &str, params: &[String]) -> String {
        let text = self
            .lookup(&normalize_language(language), template)
            .or_else(|| self.lookup(&self.default_language, template))
            .unwrap_or(template);
        render(text, params)
    }
}

/// `en-US` and `en_gb` both select `en`.
fn normalize_language(raw: &str) -> String {
    raw.split(|c: char| c == '-' || c == '_')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Substitutes `{N}` placeholders in one pass over the template, so parameter
/// values are never rescanned. Unknown indices are left as written.
fn render(text: &str, params: &[String]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let param = tail.find('}').and_then(|close| {
            let index = &tail[..close];
            if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            let value = params.get(index.parse::<usize>().ok()?)?;
            Some((value, close))
        });
        match param {
            Some((value, close)) => {
                out.push_str(value);
                rest = &tail[close + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}
