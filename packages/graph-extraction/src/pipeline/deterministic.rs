//! Tier A: deterministic extraction.
//!
//! Matchers run in a fixed order and the first one to claim a stretch of text
//! owns it:
//!
//! 1. compose-style `services:` blocks (`depends_on`, `ports`, `links`, `hostname`)
//! 2. directive configs (`upstream`, `server_name`, `listen`, `proxy_pass`) and
//!    `key=value` lines (`host=`, `port=`, `*_HOST=`, `*_PORT=`)
//! 3. identifier regexes (URLs, IPv4 addresses)
//! 4. a dictionary of known service names
//!
//! Everything emitted has confidence 1.0. Lines that look like prose are left
//! for Tier B and reported as unresolved spans.

use std::net::IpAddr;

use indexmap::IndexMap;
use regex::Regex;
use tracing::debug;

use crate::types::config::DeterministicConfig;
use crate::types::document::{Span, Window};
use crate::types::fact::{
    Confidence, ExtractedEntity, ExtractedRelationship, Fact, NodeKey, NodeKind, Provenance, RelKind, Tier,
};

/// Tier A result for one window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeterministicOutput {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,

    /// Prose stretches Tier A did not consume, relative to the window text
    pub unresolved: Vec<Span>,
}

impl DeterministicOutput {
    /// Whether Tier A consumed the whole window.
    pub fn is_resolved(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn fact_count(&self) -> usize {
        self.entities.len() + self.relationships.len()
    }

    pub fn into_facts(self) -> Vec<Fact> {
        self.entities
            .into_iter()
            .map(Fact::from)
            .chain(self.relationships.into_iter().map(Fact::from))
            .collect()
    }
}

/// Pattern and dictionary matcher over structured text.
pub struct DeterministicExtractor {
    extractor_version: String,
    dictionary: Option<Regex>,
    url: Regex,
    ipv4: Regex,
    key_value: Regex,
    yaml_key: Regex,
}

impl DeterministicExtractor {
    pub fn new(config: &DeterministicConfig, extractor_version: impl Into<String>) -> Result<Self, regex::Error> {
        let mut names: Vec<&str> = config
            .known_services
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .collect();
        // Longest first so "postgresql" wins over "postgres".
        names.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        names.dedup();

        let dictionary = if names.is_empty() {
            None
        } else {
            let alternation = names.iter().map(|name| regex::escape(name)).collect::<Vec<_>>().join("|");
            Some(Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))?)
        };

        Ok(Self {
            extractor_version: extractor_version.into(),
            dictionary,
            url: Regex::new(r#"\b(?:https?|grpc|tcp|wss?)://[^\s"'<>;,()\]]+"#)?,
            ipv4: Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b")?,
            key_value: Regex::new(r"^(?:export\s+)?([A-Za-z_][A-Za-z0-9_.-]*)\s*=\s*(.*)$")?,
            yaml_key: Regex::new(r#"^(?:-\s*)?["']?[A-Za-z0-9_.-]+["']?\s*:(?:\s.*)?$"#)?,
        })
    }

    pub fn extractor_version(&self) -> &str {
        &self.extractor_version
    }

    /// Extract facts from one window.
    pub fn extract(&self, window: &Window) -> DeterministicOutput {
        let lines = split_lines(&window.text);
        let mut scan = Scan::new(window, &self.extractor_version);

        let upstreams = upstream_names(&lines);
        let mut i = 0;
        let mut section: Option<&str> = None;
        let mut prose: Option<Span> = None;

        while i < lines.len() {
            let line = &lines[i];
            let trimmed = line.trimmed;

            let is_prose = !(trimmed.is_empty() || is_comment(trimmed))
                && trimmed != "services:"
                && !trimmed.ends_with('{')
                && !trimmed.ends_with(';')
                && trimmed != "}"
                && ini_section(trimmed).is_none()
                && !self.key_value.is_match(trimmed)
                && !self.yaml_key.is_match(trimmed)
                && !trimmed.starts_with("- ")
                && !trimmed.starts_with('|');

            if is_prose {
                let span = Span::new(line.start, line.start + line.text.len());
                prose = Some(match prose {
                    Some(run) => Span::new(run.start, span.end),
                    None => span,
                });
                i += 1;
                continue;
            }
            if let Some(run) = prose.take() {
                scan.unresolved.push(run);
            }

            if trimmed == "services:" {
                i = scan.services_block(&lines, i, &self.yaml_key);
                continue;
            }
            if trimmed.ends_with('{') {
                i = scan.directive_block(&lines, i, &upstreams);
                continue;
            }
            if let Some(name) = ini_section(trimmed) {
                section = Some(name);
            } else if let Some(caps) = self.key_value.captures(trimmed) {
                if let (Some(key), Some(value)) = (caps.get(1), caps.get(2)) {
                    scan.key_value(line, key.as_str(), value.as_str(), section);
                }
            }
            i += 1;
        }
        if let Some(run) = prose.take() {
            scan.unresolved.push(run);
        }

        scan.identifiers(&self.url, &self.ipv4);
        if let Some(dictionary) = &self.dictionary {
            scan.dictionary(dictionary);
        }

        debug!(
            window_id = %window.window_id,
            entities = scan.entities.len(),
            relationships = scan.relationships.len(),
            unresolved = scan.unresolved.len(),
            "tier A extraction complete"
        );
        scan.finish()
    }
}

struct Line<'a> {
    /// Byte offset in the window text
    start: usize,
    text: &'a str,
    trimmed: &'a str,
    indent: usize,
}

fn split_lines(text: &str) -> Vec<Line<'_>> {
    let mut lines = Vec::new();
    let mut start = 0;
    for raw in text.split_inclusive('\n') {
        let line = raw.trim_end_matches(['\n', '\r']);
        lines.push(Line {
            start,
            text: line,
            trimmed: line.trim(),
            indent: line.len() - line.trim_start().len(),
        });
        start += raw.len();
    }
    lines
}

/// Byte offset of `inner` inside `outer`; `inner` must be a subslice.
fn offset_in(outer: &str, inner: &str) -> usize {
    (inner.as_ptr() as usize).saturating_sub(outer.as_ptr() as usize)
}

fn is_comment(trimmed: &str) -> bool {
    trimmed.starts_with('#') || trimmed.starts_with("//") || trimmed.starts_with(';')
}

fn ini_section(trimmed: &str) -> Option<&str> {
    let name = trimmed.strip_prefix('[')?.strip_suffix(']')?.trim();
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '"' || c == '\'').trim()
}

fn upstream_names(lines: &[Line<'_>]) -> Vec<String> {
    lines
        .iter()
        .filter_map(|line| {
            let rest = line.trimmed.strip_prefix("upstream ")?;
            let name = rest.trim_end_matches('{').trim();
            (!name.is_empty()).then(|| name.to_ascii_lowercase())
        })
        .collect()
}

/// Port number from compose/listen syntax: `80`, `8080:80`, `127.0.0.1:80:80/tcp`, `[::]:443`.
fn parse_port(raw: &str) -> Option<(u16, Option<u16>)> {
    let raw = unquote(raw);
    let raw = raw.split('/').next().unwrap_or(raw);
    let mut parts = raw.rsplit(':');
    let target = parts.next()?.trim().parse::<u16>().ok().filter(|p| *p != 0)?;
    let published = parts.next().and_then(|p| p.trim().parse::<u16>().ok());
    Some((target, published))
}

#[derive(Clone, Copy, PartialEq)]
enum ListKey {
    DependsOn,
    Ports,
    Links,
    Ignored,
}

#[derive(Default)]
struct ServerBlock<'a> {
    open: usize,
    names: Vec<(&'a str, usize)>,
    listens: Vec<(&'a str, usize)>,
    passes: Vec<(&'a str, usize)>,
}

enum BlockContext<'a> {
    Upstream(NodeKey),
    Server(ServerBlock<'a>),
    Other,
}

struct Scan<'w> {
    window: &'w Window,
    version: &'w str,
    entities: IndexMap<NodeKey, ExtractedEntity>,
    relationships: IndexMap<(RelKind, NodeKey, NodeKey), ExtractedRelationship>,
    claimed: Vec<Span>,
    unresolved: Vec<Span>,
}

impl<'w> Scan<'w> {
    fn new(window: &'w Window, version: &'w str) -> Self {
        Self {
            window,
            version,
            entities: IndexMap::new(),
            relationships: IndexMap::new(),
            claimed: Vec::new(),
            unresolved: Vec::new(),
        }
    }

    fn provenance(&self, range: Span, method: &str) -> Provenance {
        Provenance {
            doc_id: self.window.doc_id,
            window_id: self.window.window_id,
            span: range.offset(self.window.span.start),
            section: self.window.section.clone(),
            tier: Tier::A,
            extractor_version: self.version.to_string(),
            method: method.to_string(),
        }
    }

    fn claim(&mut self, range: Span) {
        self.claimed.push(range);
    }

    fn is_claimed(&self, range: &Span) -> bool {
        self.claimed
            .iter()
            .any(|claimed| range.start < claimed.end && claimed.start < range.end)
    }

    /// Range of `value` (a subslice of `line.text`) in window coordinates.
    fn range_of(line: &Line<'_>, value: &str) -> Span {
        let start = line.start + offset_in(line.text, value);
        Span::new(start, start + value.len())
    }

    fn entity(&mut self, key: NodeKey, range: Span, method: &str) -> Option<&mut ExtractedEntity> {
        if !self.entities.contains_key(&key) {
            let entity = ExtractedEntity::new(key.clone(), Confidence::CERTAIN, self.provenance(range, method));
            self.entities.insert(key.clone(), entity);
        }
        self.entities.get_mut(&key)
    }

    fn relate(&mut self, kind: RelKind, subject: NodeKey, object: NodeKey, range: Span, method: &str) {
        let id = (kind, subject.clone(), object.clone());
        if self.relationships.contains_key(&id) {
            return;
        }
        match ExtractedRelationship::new(kind, subject, object, Confidence::CERTAIN, self.provenance(range, method)) {
            Ok(rel) => {
                self.relationships.insert(id, rel);
            }
            Err(e) => debug!(error = %e, "tier A skipped disallowed relationship"),
        }
    }

    /// Host-or-IP key for a raw address.
    fn address_key(raw: &str) -> Option<NodeKey> {
        match raw.parse::<IpAddr>() {
            Ok(ip) => Some(NodeKey::ip(ip)),
            Err(_) => NodeKey::parse(NodeKind::Host, raw).ok(),
        }
    }

    fn services_block(&mut self, lines: &[Line<'_>], open: usize, yaml_key: &Regex) -> usize {
        let base = lines[open].indent;
        let mut service: Option<(NodeKey, usize)> = None;
        let mut list: Option<(ListKey, usize, Option<usize>)> = None;
        let mut i = open + 1;

        while i < lines.len() {
            let line = &lines[i];
            let trimmed = line.trimmed;
            if trimmed.is_empty() || is_comment(trimmed) {
                i += 1;
                continue;
            }
            if line.indent <= base {
                break;
            }

            let header = service.as_ref().map_or(true, |(_, indent)| line.indent <= *indent);
            if header {
                list = None;
                match trimmed.strip_suffix(':') {
                    Some(name) if !name.is_empty() => {
                        let name = unquote(name);
                        let key = NodeKey::service(name);
                        let range = Self::range_of(line, name);
                        self.claim(range);
                        self.entity(key.clone(), range, "config:service");
                        service = Some((key, line.indent));
                    }
                    _ => service = None,
                }
                i += 1;
                continue;
            }
            let Some((subject, _)) = service.clone() else {
                i += 1;
                continue;
            };

            if let Some((list_key, list_indent, mut child_indent)) = list {
                if line.indent > list_indent {
                    let child = *child_indent.get_or_insert(line.indent);
                    list = Some((list_key, list_indent, Some(child)));
                    if line.indent == child {
                        let item = trimmed.strip_prefix('-').unwrap_or(trimmed).trim();
                        let item = item.strip_suffix(':').unwrap_or(item);
                        self.service_item(line, list_key, &subject, unquote(item));
                    }
                    i += 1;
                    continue;
                }
                list = None;
            }

            if yaml_key.is_match(trimmed) {
                if let Some((key, value)) = trimmed.split_once(':') {
                    let list_key = match key.trim() {
                        "depends_on" => ListKey::DependsOn,
                        "ports" => ListKey::Ports,
                        "links" => ListKey::Links,
                        _ => ListKey::Ignored,
                    };
                    let value = value.trim();
                    if value.is_empty() {
                        list = Some((list_key, line.indent, None));
                    } else if list_key != ListKey::Ignored {
                        let inline = value.trim_start_matches('[').trim_end_matches(']');
                        for item in inline.split(',') {
                            self.service_item(line, list_key, &subject, unquote(item));
                        }
                    } else {
                        self.service_scalar(line, key.trim(), unquote(value), &subject);
                    }
                }
            }
            i += 1;
        }
        i
    }

    fn service_item(&mut self, line: &Line<'_>, list_key: ListKey, subject: &NodeKey, item: &str) {
        if item.is_empty() {
            return;
        }
        let range = Self::range_of(line, item);
        match list_key {
            ListKey::DependsOn | ListKey::Links => {
                // links use `service:alias`
                let name = item.split(':').next().unwrap_or(item);
                let method = if list_key == ListKey::Links {
                    "config:links"
                } else {
                    "config:depends_on"
                };
                self.claim(range);
                self.relate(RelKind::DependsOn, subject.clone(), NodeKey::service(name), range, method);
            }
            ListKey::Ports => {
                let Some((target, published)) = parse_port(item) else {
                    return;
                };
                self.claim(range);
                self.relate(RelKind::BindsPort, subject.clone(), NodeKey::port(target), range, "config:ports");
                if let Some(published) = published {
                    let id = (RelKind::BindsPort, subject.clone(), NodeKey::port(target));
                    if let Some(rel) = self.relationships.get_mut(&id) {
                        rel.properties.entry("published".into()).or_insert(published.into());
                    }
                }
            }
            ListKey::Ignored => {}
        }
    }

    fn service_scalar(&mut self, line: &Line<'_>, key: &str, value: &str, subject: &NodeKey) {
        if value.is_empty() {
            return;
        }
        let range = Self::range_of(line, value);
        match key {
            "hostname" => {
                if let Some(host) = Self::address_key(value) {
                    self.claim(range);
                    self.entity(host.clone(), range, "config:hostname");
                    let kind = if host.kind == NodeKind::Ip {
                        RelKind::ConnectsTo
                    } else {
                        RelKind::RunsOn
                    };
                    self.relate(kind, subject.clone(), host, range, "config:hostname");
                }
            }
            "image" | "container_name" => {
                self.claim(range);
                if let Some(entity) = self.entities.get_mut(subject) {
                    entity.properties.entry(key.to_string()).or_insert(value.into());
                }
            }
            _ => {}
        }
    }

    fn directive_block(&mut self, lines: &[Line<'w>], open: usize, upstreams: &[String]) -> usize {
        let mut stack: Vec<BlockContext<'w>> = Vec::new();
        let mut i = open;

        while i < lines.len() {
            let line = &lines[i];
            let trimmed = line.trimmed;
            i += 1;

            if trimmed.is_empty() || is_comment(trimmed) {
                continue;
            }

            if let Some(head) = trimmed.strip_suffix('{') {
                let mut words = head.split_whitespace();
                let context = match (words.next(), words.next()) {
                    (Some("upstream"), Some(name)) => {
                        let key = NodeKey::service(name);
                        let range = Self::range_of(line, name);
                        self.claim(range);
                        if let Some(entity) = self.entity(key.clone(), range, "directive:upstream") {
                            entity.properties.entry("upstream".into()).or_insert(true.into());
                        }
                        BlockContext::Upstream(key)
                    }
                    (Some("server"), None) => BlockContext::Server(ServerBlock {
                        open: line.start,
                        ..ServerBlock::default()
                    }),
                    _ => BlockContext::Other,
                };
                stack.push(context);
                continue;
            }

            if trimmed.starts_with('}') {
                if let Some(BlockContext::Server(server)) = stack.pop() {
                    self.emit_server(lines, server, upstreams);
                }
                if stack.is_empty() {
                    break;
                }
                continue;
            }

            let Some(body) = trimmed.strip_suffix(';') else {
                continue;
            };
            let mut parts = body.splitn(2, char::is_whitespace);
            let (Some(name), Some(args)) = (parts.next(), parts.next()) else {
                continue;
            };
            let args = args.trim();

            // Innermost upstream/server context handles the directive.
            let context = stack
                .iter_mut()
                .rev()
                .find(|c| !matches!(c, BlockContext::Other));
            match (context, name) {
                (Some(BlockContext::Server(server)), "server_name") => {
                    server.names.extend(args.split_whitespace().map(|name| (name, i - 1)));
                }
                (Some(BlockContext::Server(server)), "listen") => {
                    if let Some(first) = args.split_whitespace().next() {
                        server.listens.push((first, i - 1));
                    }
                }
                (Some(BlockContext::Server(server)), "proxy_pass") => {
                    server.passes.push((args, i - 1));
                }
                (Some(BlockContext::Upstream(key)), "server") => {
                    let key = key.clone();
                    if let Some(target) = args.split_whitespace().next() {
                        self.upstream_member(line, &key, target);
                    }
                }
                _ => {}
            }
        }
        i
    }

    fn upstream_member(&mut self, line: &Line<'_>, upstream: &NodeKey, target: &str) {
        let (host, port) = match target.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => (host, port.parse::<u16>().ok()),
            _ => (target, None),
        };
        let range = Self::range_of(line, target);
        self.claim(range);
        if let Some(address) = Self::address_key(host) {
            self.entity(address.clone(), range, "directive:upstream");
            let kind = if address.kind == NodeKind::Ip {
                RelKind::ConnectsTo
            } else {
                RelKind::RunsOn
            };
            self.relate(kind, upstream.clone(), address, range, "directive:upstream");
        }
        if let Some(port) = port.filter(|p| *p != 0) {
            self.relate(RelKind::BindsPort, upstream.clone(), NodeKey::port(port), range, "directive:upstream");
        }
    }

    fn emit_server(&mut self, lines: &[Line<'_>], server: ServerBlock<'_>, upstreams: &[String]) {
        let name = server
            .names
            .iter()
            .map(|(name, _)| *name)
            .find(|name| *name != "_")
            .unwrap_or("default-server");
        let proxy = NodeKey::proxy(name);
        self.entity(proxy.clone(), Span::new(server.open, server.open), "directive:server");

        for (host, index) in server.names {
            if host == "_" || host.contains('*') {
                continue;
            }
            if let Ok(key) = NodeKey::parse(NodeKind::Host, host) {
                let range = Self::range_of(&lines[index], host);
                self.claim(range);
                self.entity(key, range, "directive:server_name");
            }
        }

        for (listen, index) in server.listens {
            if let Some((port, _)) = parse_port(listen) {
                let range = Self::range_of(&lines[index], listen);
                self.claim(range);
                self.relate(RelKind::BindsPort, proxy.clone(), NodeKey::port(port), range, "directive:listen");
            }
        }

        for (target, index) in server.passes {
            let range = Self::range_of(&lines[index], target);
            let Ok(url) = url::Url::parse(target) else {
                continue;
            };
            let Some(host) = url.host_str() else {
                continue;
            };
            self.claim(range);
            if upstreams.iter().any(|upstream| upstream.eq_ignore_ascii_case(host)) {
                self.relate(RelKind::RoutesTo, proxy.clone(), NodeKey::service(host), range, "directive:proxy_pass");
            } else if let Ok(endpoint) = NodeKey::parse(NodeKind::Endpoint, target) {
                self.entity(endpoint.clone(), range, "directive:proxy_pass");
                self.relate(RelKind::RoutesTo, proxy.clone(), endpoint, range, "directive:proxy_pass");
            }
        }
    }

    fn key_value(&mut self, line: &Line<'_>, key: &str, value: &str, section: Option<&str>) {
        let value = unquote(value);
        if value.is_empty() {
            return;
        }
        let lower = key.to_ascii_lowercase();
        let (prefix, field) = match lower.rsplit_once(['_', '.']) {
            Some((prefix, field)) => (Some(prefix), field),
            None => (None, lower.as_str()),
        };
        let subject = prefix.or(section).map(NodeKey::service);
        let range = Self::range_of(line, value);

        match field {
            "host" | "hostname" | "addr" | "address" => {
                let Some(address) = Self::address_key(value) else {
                    return;
                };
                self.claim(range);
                self.entity(address.clone(), range, "kv:host");
                if let Some(subject) = subject {
                    let kind = if address.kind == NodeKind::Ip {
                        RelKind::ConnectsTo
                    } else {
                        RelKind::RunsOn
                    };
                    self.relate(kind, subject, address, range, "kv:host");
                }
            }
            "port" => {
                let Some((port, _)) = parse_port(value) else {
                    return;
                };
                self.claim(range);
                match subject {
                    Some(subject) => {
                        self.relate(RelKind::BindsPort, subject, NodeKey::port(port), range, "kv:port")
                    }
                    None => {
                        self.entity(NodeKey::port(port), range, "kv:port");
                    }
                }
            }
            _ => {}
        }
    }

    fn identifiers(&mut self, url: &Regex, ipv4: &Regex) {
        let text = self.window.text.as_str();
        for m in url.find_iter(text) {
            let raw = m.as_str().trim_end_matches(['.', ':']);
            let range = Span::new(m.start(), m.start() + raw.len());
            if self.is_claimed(&range) {
                continue;
            }
            if let Ok(key) = NodeKey::parse(NodeKind::Endpoint, raw) {
                self.claim(range);
                self.entity(key, range, "regex:url");
            }
        }
        for m in ipv4.find_iter(text) {
            let range = Span::new(m.start(), m.end());
            if self.is_claimed(&range) {
                continue;
            }
            if let Ok(ip) = m.as_str().parse::<IpAddr>() {
                self.claim(range);
                self.entity(NodeKey::ip(ip), range, "regex:ipv4");
            }
        }
    }

    fn dictionary(&mut self, dictionary: &Regex) {
        let text = self.window.text.as_str();
        for m in dictionary.find_iter(text) {
            let range = Span::new(m.start(), m.end());
            if self.is_claimed(&range) {
                continue;
            }
            self.claim(range);
            self.entity(NodeKey::service(m.as_str()), range, "dictionary");
        }
    }

    fn finish(self) -> DeterministicOutput {
        DeterministicOutput {
            entities: self.entities.into_values().collect(),
            relationships: self.relationships.into_values().collect(),
            unresolved: self.unresolved,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const COMPOSE: &str = "services:\n  nginx:\n    image: nginx:1.25\n    ports:\n      - \"80:80\"\n    depends_on:\n      - postgres\n  postgres:\n    ports:\n      - \"5432:5432\"\n";

    fn extractor() -> DeterministicExtractor {
        DeterministicExtractor::new(&DeterministicConfig::default(), "1.0.0").unwrap()
    }

    fn window(text: &str) -> Window {
        Window::new(Uuid::new_v4(), text, 0)
    }

    #[test]
    fn test_compose_block() {
        let output = extractor().extract(&window(COMPOSE));

        let services: Vec<_> = output.entities.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(services, vec!["Service:nginx", "Service:postgres"]);
        assert_eq!(output.entities[0].properties["image"], "nginx:1.25");

        let rels: Vec<_> = output
            .relationships
            .iter()
            .map(|r| format!("{}-{}->{}", r.subject, r.kind, r.object))
            .collect();
        assert_eq!(
            rels,
            vec![
                "Service:nginx-BINDS_PORT->Port:80",
                "Service:nginx-DEPENDS_ON->Service:postgres",
                "Service:postgres-BINDS_PORT->Port:5432",
            ]
        );
        assert!(output.is_resolved());
        assert!(output
            .relationships
            .iter()
            .all(|r| r.confidence == Confidence::CERTAIN && r.provenance.tier == Tier::A));
    }

    #[test]
    fn test_provenance_span_points_at_source_text() {
        let w = Window::new(Uuid::new_v4(), COMPOSE, 100);
        let output = extractor().extract(&w);
        let dep = output
            .relationships
            .iter()
            .find(|r| r.kind == RelKind::DependsOn)
            .unwrap();
        let span = dep.provenance.span;
        assert_eq!(&COMPOSE[span.start - 100..span.end - 100], "postgres");
        assert_eq!(dep.provenance.method, "config:depends_on");
    }

    #[test]
    fn test_inline_depends_on_and_links() {
        let text = "services:\n  api:\n    depends_on: [redis, \"postgres\"]\n    links:\n      - \"kafka:broker\"\n    hostname: api01.internal\n";
        let output = extractor().extract(&window(text));
        let rels: Vec<_> = output.relationships.iter().map(|r| r.object.to_string()).collect();
        assert_eq!(
            rels,
            vec!["Service:redis", "Service:postgres", "Service:kafka", "Host:api01.internal"]
        );
    }

    #[test]
    fn test_nginx_directives() {
        let text = "upstream backend {\n    server 10.0.0.5:8080;\n}\nserver {\n    listen 443 ssl;\n    server_name api.example.com;\n    location / {\n        proxy_pass http://backend;\n    }\n    location /status {\n        proxy_pass http://status.internal:9000/health;\n    }\n}\n";
        let output = extractor().extract(&window(text));

        let rels: Vec<_> = output
            .relationships
            .iter()
            .map(|r| format!("{}-{}->{}", r.subject, r.kind, r.object))
            .collect();
        assert!(rels.contains(&"Service:backend-CONNECTS_TO->IP:10.0.0.5".to_string()));
        assert!(rels.contains(&"Service:backend-BINDS_PORT->Port:8080".to_string()));
        assert!(rels.contains(&"Proxy:api.example.com-BINDS_PORT->Port:443".to_string()));
        assert!(rels.contains(&"Proxy:api.example.com-ROUTES_TO->Service:backend".to_string()));
        assert!(rels.contains(
            &"Proxy:api.example.com-ROUTES_TO->Endpoint:http://status.internal:9000/health".to_string()
        ));
        assert!(output.is_resolved());
    }

    #[test]
    fn test_server_name_span_stays_in_its_block() {
        let text = "server {\n    # api.example.com moved to the block below\n    listen 80;\n    server_name legacy.example.com;\n}\nserver {\n    listen 443;\n    server_name www.api.example.com api.example.com;\n}\n";
        let output = extractor().extract(&window(text));

        let second_block = text.rfind("server {").unwrap();
        let host = output
            .entities
            .iter()
            .find(|e| e.key.to_string() == "Host:api.example.com")
            .unwrap();
        let span = host.provenance.span;
        assert!(span.start > second_block, "span {:?} points outside its server block", span);
        assert_eq!(&text[span.start..span.end], "api.example.com");
        assert_eq!(span.start, text.rfind(" api.example.com;").unwrap() + 1);
    }

    #[test]
    fn test_key_value_lines() {
        let text = "[redis]\nhost=10.1.2.3\nport=6379\nPOSTGRES_HOST=db01.internal\n";
        let output = extractor().extract(&window(text));
        let rels: Vec<_> = output
            .relationships
            .iter()
            .map(|r| format!("{}-{}->{}", r.subject, r.kind, r.object))
            .collect();
        assert_eq!(
            rels,
            vec![
                "Service:redis-CONNECTS_TO->IP:10.1.2.3",
                "Service:redis-BINDS_PORT->Port:6379",
                "Service:postgres-RUNS_ON->Host:db01.internal",
            ]
        );
    }

    #[test]
    fn test_prose_is_unresolved_but_dictionary_entities_are_kept() {
        let text = "services:\n  web:\n    ports:\n      - 8080\n\nThe web tier talks to redis at 10.0.0.9 over https://cache.internal/v1.\n";
        let output = extractor().extract(&window(text));
        assert_eq!(output.unresolved.len(), 1);
        let span = output.unresolved[0];
        assert!(text[span.start..span.end].starts_with("The web tier"));

        let keys: Vec<_> = output.entities.iter().map(|e| e.key.to_string()).collect();
        assert!(keys.contains(&"Service:redis".to_string()));
        assert!(keys.contains(&"IP:10.0.0.9".to_string()));
        assert!(keys.contains(&"Endpoint:https://cache.internal:443/v1".to_string()));
    }

    #[test]
    fn test_first_match_wins() {
        // The IP inside the URL belongs to the URL matcher.
        let output = extractor().extract(&window("See http://10.0.0.1:8080/metrics for details."));
        let keys: Vec<_> = output.entities.iter().map(|e| e.key.to_string()).collect();
        assert_eq!(keys, vec!["Endpoint:http://10.0.0.1:8080/metrics"]);
    }

    #[test]
    fn test_output_is_deterministic() {
        let w = window(COMPOSE);
        let a = extractor().extract(&w);
        let b = extractor().extract(&w);
        assert_eq!(a, b);
        let json_a = serde_json::to_string(&a.into_facts()).unwrap();
        let json_b = serde_json::to_string(&b.into_facts()).unwrap();
        assert_eq!(json_a, json_b);
    }
}
