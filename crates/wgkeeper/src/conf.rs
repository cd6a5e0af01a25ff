//! Parser and serializer for the server's WireGuard configuration file.
//!
//! The file is edited by hand as well as by this crate, so the parser keeps
//! every line it understands verbatim and only derives a few fields from
//! them. Serializing an unmodified model gives the input back, except that
//! runs of blank lines collapse to a single one.
//!
//! Peer names live in free-form comments above `[Peer]`. Since there is no
//! delimiter between "comment documenting this peer" and "comment announcing
//! the next one", a comment that looks like a name header (see
//! [`crate::identity::is_peer_header`]) always starts a new peer.

use log::{debug, warn};
use serde::Serialize;

use crate::identity;

pub const INTERFACE_SECTION: &str = "[Interface]";
pub const PEER_SECTION: &str = "[Peer]";

/// Marker left in the file by provisioning scripts before keys exist.
const PLACEHOLDER_MARKER: &str = "placeholder";

/// `Key = value` lookup on a single line. Comments never match.
pub fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let trimmed = line.trim();
    if trimmed.starts_with('#') {
        return None;
    }
    let (k, v) = trimmed.split_once('=')?;
    if !k.trim().eq_ignore_ascii_case(key) {
        return None;
    }
    Some(v.trim())
}

fn first_token(value: &str) -> Option<&str> {
    value.split_whitespace().next()
}

fn is_comment(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// The `[Interface]` section, with every line it owns kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceBlock {
    pub lines: Vec<String>,
    pub address: Option<String>,
    pub listen_port: Option<u16>,
    pub private_key: Option<String>,
}

impl InterfaceBlock {
    pub fn from_lines(lines: Vec<String>) -> Self {
        let mut address = None;
        let mut listen_port = None;
        let mut private_key = None;
        for line in &lines {
            if let Some(v) = field_value(line, "Address") {
                address.get_or_insert_with(|| v.to_string());
            } else if let Some(v) = field_value(line, "ListenPort") {
                if listen_port.is_none() {
                    listen_port = v.parse().ok();
                }
            } else if let Some(v) = field_value(line, "PrivateKey").and_then(first_token) {
                private_key.get_or_insert_with(|| v.to_string());
            }
        }
        Self {
            lines,
            address: address.filter(|a| !a.is_empty()),
            listen_port,
            private_key,
        }
    }

    pub fn has_section_header(&self) -> bool {
        self.lines.iter().any(|l| l.trim() == INTERFACE_SECTION)
    }

    pub fn is_placeholder(&self) -> bool {
        self.lines.iter().any(|l| l.contains(PLACEHOLDER_MARKER))
    }
}

fn public_key_of(body_lines: &[String]) -> Option<&str> {
    body_lines
        .iter()
        .find_map(|l| field_value(l, "PublicKey").and_then(first_token))
}

/// Entries of the first `AllowedIPs` line, as written.
fn allowed_ips_of(body_lines: &[String]) -> Vec<String> {
    body_lines
        .iter()
        .find_map(|l| field_value(l, "AllowedIPs"))
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// One `[Peer]` section and the comment lines directly above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerBlock {
    pub comment_lines: Vec<String>,
    pub body_lines: Vec<String>,
    pub public_key: String,
    /// `AllowedIPs` entries as written, e.g. `10.8.0.2/32`.
    pub allowed_ips: Vec<String>,
    pub name: String,
}

impl PeerBlock {
    /// Build a block from raw lines. Returns `None` when the body carries no
    /// `PublicKey`, which makes the block unusable.
    pub fn from_lines(comment_lines: Vec<String>, body_lines: Vec<String>) -> Option<Self> {
        let public_key = public_key_of(&body_lines)?.to_string();
        let allowed_ips = allowed_ips_of(&body_lines);
        let name = identity::resolve_name(&comment_lines, &public_key);
        Some(Self {
            comment_lines,
            body_lines,
            public_key,
            allowed_ips,
            name,
        })
    }

    /// First allowed address with a host `/32` suffix removed.
    pub fn display_ip(&self) -> Option<&str> {
        self.allowed_ips
            .first()
            .map(|ip| ip.strip_suffix("/32").unwrap_or(ip.as_str()))
    }

    pub fn fallback_suffix(&self) -> String {
        identity::fallback_suffix(&self.public_key)
    }

    /// Comment and body lines as they appear in the file.
    pub fn raw_text(&self) -> String {
        self.comment_lines
            .iter()
            .chain(self.body_lines.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A `[Peer]` section without a `PublicKey`.
///
/// It is not a peer: it has no name, is never listed and cannot be
/// targeted. Its lines are written back where they were found, and its
/// addresses stay reserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InertBlock {
    /// 1-based line number of its `[Peer]` header when parsed.
    pub line: usize,
    /// How many peers precede it in the file.
    pub position: usize,
    pub comment_lines: Vec<String>,
    pub body_lines: Vec<String>,
    pub allowed_ips: Vec<String>,
}

/// A peer block left out of the peer list while parsing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedBlock {
    /// 1-based line number of its `[Peer]` header.
    pub line: usize,
    pub reason: String,
}

/// What the parser could not turn into peers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParseReport {
    pub skipped: Vec<SkippedBlock>,
}

impl ParseReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty()
    }
}

/// Parsed configuration: one interface, peers in file order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigModel {
    pub interface: InterfaceBlock,
    pub peers: Vec<PeerBlock>,
    /// Unusable `[Peer]` sections, ordered by position.
    pub inert: Vec<InertBlock>,
}

impl ConfigModel {
    pub fn parse(text: &str) -> (Self, ParseReport) {
        parse(text)
    }

    pub fn serialize(&self) -> String {
        serialize(self)
    }

    pub fn is_placeholder(&self) -> bool {
        self.interface.is_placeholder()
    }

    /// Append a peer, making sure a blank line separates it from whatever
    /// precedes it. Existing peers keep their order.
    pub fn push_peer(&mut self, peer: PeerBlock) {
        let tail = last_lines(&mut self.interface.lines, &mut self.peers, &mut self.inert);
        if tail.last().map_or(false, |l| !l.trim().is_empty()) {
            tail.push(String::new());
        }
        self.peers.push(peer);
    }

    /// Remove the peer at `index`; inert blocks keep their place in the text.
    pub fn remove_peer(&mut self, index: usize) -> PeerBlock {
        let removed = self.peers.remove(index);
        for block in &mut self.inert {
            if block.position > index {
                block.position -= 1;
            }
        }
        removed
    }
}

/// Lines of whatever comes last in the file.
fn last_lines<'a>(
    interface: &'a mut Vec<String>,
    peers: &'a mut [PeerBlock],
    inert: &'a mut [InertBlock],
) -> &'a mut Vec<String> {
    let inert_last = inert.last().map_or(false, |b| b.position == peers.len());
    if inert_last {
        if let Some(block) = inert.last_mut() {
            return &mut block.body_lines;
        }
    }
    match peers.last_mut() {
        Some(last) => &mut last.body_lines,
        None => interface,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Between sections: comments accumulate as the next peer's header.
    Outside,
    InInterface,
    InPeer,
}

struct OpenPeer {
    line: usize,
    comments: Vec<String>,
    body: Vec<String>,
}

struct Parser {
    state: ParseState,
    seen_interface: bool,
    interface_lines: Vec<String>,
    header: Vec<String>,
    current: Option<OpenPeer>,
    peers: Vec<PeerBlock>,
    inert: Vec<InertBlock>,
    report: ParseReport,
}

impl Parser {
    fn new() -> Self {
        Self {
            state: ParseState::Outside,
            seen_interface: false,
            interface_lines: Vec::new(),
            header: Vec::new(),
            current: None,
            peers: Vec::new(),
            inert: Vec::new(),
            report: ParseReport::default(),
        }
    }

    fn feed(&mut self, line_no: usize, line: &str) {
        match line.trim() {
            INTERFACE_SECTION => self.enter_interface(line),
            PEER_SECTION => self.enter_peer(line_no, line),
            _ => {
                self.state = match self.state {
                    ParseState::Outside => self.outside(line),
                    ParseState::InInterface => self.in_interface(line),
                    ParseState::InPeer => self.in_peer(line),
                }
            }
        }
    }

    fn enter_interface(&mut self, line: &str) {
        self.flush_peer();
        if self.seen_interface {
            warn!("Multiple [Interface] sections; merging into one");
        }
        // Banner comments above [Interface] belong to the interface.
        self.interface_lines.append(&mut self.header);
        self.interface_lines.push(line.to_string());
        self.seen_interface = true;
        self.state = ParseState::InInterface;
    }

    fn enter_peer(&mut self, line_no: usize, line: &str) {
        self.flush_peer();
        // The header collected so far announces this new peer.
        let comments = std::mem::take(&mut self.header);
        self.current = Some(OpenPeer {
            line: line_no,
            comments,
            body: vec![line.to_string()],
        });
        self.state = ParseState::InPeer;
    }

    fn outside(&mut self, line: &str) -> ParseState {
        if is_comment(line) || !self.header.is_empty() {
            self.header.push(line.to_string());
        } else if !self.seen_interface {
            self.interface_lines.push(line.to_string());
        } else {
            debug!("Dropping stray line outside any section: {:?}", line);
        }
        ParseState::Outside
    }

    fn in_interface(&mut self, line: &str) -> ParseState {
        if is_comment(line) && identity::is_peer_header(line) {
            self.header.push(line.to_string());
            return ParseState::Outside;
        }
        self.interface_lines.push(line.to_string());
        ParseState::InInterface
    }

    fn in_peer(&mut self, line: &str) -> ParseState {
        if is_comment(line) && identity::is_peer_header(line) {
            self.flush_peer();
            self.header.push(line.to_string());
            return ParseState::Outside;
        }
        if let Some(open) = self.current.as_mut() {
            open.body.push(line.to_string());
        }
        ParseState::InPeer
    }

    fn flush_peer(&mut self) {
        let Some(open) = self.current.take() else {
            return;
        };
        if public_key_of(&open.body).is_some() {
            if let Some(peer) = PeerBlock::from_lines(open.comments, open.body) {
                self.peers.push(peer);
            }
            return;
        }
        warn!(
            "Keeping [Peer] block at line {} as inert text: no PublicKey",
            open.line
        );
        self.report.skipped.push(SkippedBlock {
            line: open.line,
            reason: "missing PublicKey".to_string(),
        });
        self.inert.push(InertBlock {
            line: open.line,
            position: self.peers.len(),
            allowed_ips: allowed_ips_of(&open.body),
            comment_lines: open.comments,
            body_lines: open.body,
        });
    }

    fn finish(mut self) -> (ConfigModel, ParseReport) {
        self.flush_peer();
        if !self.header.is_empty() {
            // A trailing comment with no [Peer] after it stays where it was.
            let tail = last_lines(&mut self.interface_lines, &mut self.peers, &mut self.inert);
            tail.append(&mut self.header);
        }
        let model = ConfigModel {
            interface: InterfaceBlock::from_lines(self.interface_lines),
            peers: self.peers,
            inert: self.inert,
        };
        debug!(
            "Parsed configuration: {} peers, {} skipped",
            model.peers.len(),
            self.report.skipped.len()
        );
        (model, self.report)
    }
}

/// Parse configuration text. Never fails: peer blocks without a key are
/// kept as inert text and listed in the report.
pub fn parse(text: &str) -> (ConfigModel, ParseReport) {
    let mut parser = Parser::new();
    for (idx, line) in text.split('\n').enumerate() {
        parser.feed(idx + 1, line);
    }
    parser.finish()
}

/// Rebuild configuration text from a model.
pub fn serialize(model: &ConfigModel) -> String {
    let mut lines: Vec<&str> = model.interface.lines.iter().map(String::as_str).collect();
    let mut inert = model.inert.iter().peekable();
    for (i, peer) in model.peers.iter().enumerate() {
        while let Some(block) = inert.next_if(|b| b.position <= i) {
            lines.extend(block.comment_lines.iter().chain(&block.body_lines).map(String::as_str));
        }
        lines.extend(peer.comment_lines.iter().chain(&peer.body_lines).map(String::as_str));
    }
    for block in inert {
        lines.extend(block.comment_lines.iter().chain(&block.body_lines).map(String::as_str));
    }
    collapse_blank_runs(&lines.join("\n"))
}

/// Replace every run of three or more newlines with exactly two.
pub fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for c in text.chars() {
        if c == '\n' {
            newlines += 1;
            if newlines <= 2 {
                out.push(c);
            }
        } else {
            newlines = 0;
            out.push(c);
        }
    }
    out
}
