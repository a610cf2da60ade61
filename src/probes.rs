use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use regex::bytes::{Regex, RegexBuilder};

/// Transport protocol a probe applies to
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeProtocol {
    Tcp,
    Udp,
}

/// A single service-detection rule within a probe
#[derive(Debug, Clone)]
pub struct ProbeMatch {
    /// Service name, e.g. "http"
    pub service_name: String,
    /// Compiled pattern tested against raw response bytes
    pub pattern: Regex,
    /// nmap version-info tokens (p/v/i/o/h/d), keyed by token letter.
    /// Kept for forward compatibility; matching does not consult it.
    pub version_info: HashMap<String, String>,
}

/// A probe: payload to send plus the patterns interpreting the response
#[derive(Debug, Clone)]
pub struct Probe {
    pub protocol: ProbeProtocol,
    /// Probe name from the definition file, e.g. "GetRequest"
    pub name: String,
    /// Raw payload bytes, possibly empty
    pub data: Vec<u8>,
    /// Matches in file order; the first match wins
    pub matches: Vec<ProbeMatch>,
}

/// A parsing error tied to a line of the probe file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

/// Statistics about one probe loading pass
#[derive(Debug, Clone, Default)]
pub struct LoadStats {
    pub total_lines: usize,
    pub probe_count: usize,
    pub match_count: usize,
    /// Matches silently skipped because their pattern uses regex features
    /// (lookaround, backreferences, oversized repeats) the engine rejects
    pub dropped_matches: usize,
    pub error_lines: Vec<ParseError>,
}

/// Why a match line did not produce a `ProbeMatch`
#[derive(Debug)]
enum MatchError {
    /// Pattern uses an unsupported regex feature; skipped without diagnostic
    UnsupportedRegex,
    /// Genuine parse or compile failure, recorded in `LoadStats`
    Invalid(String),
}

/// Read and parse probe definitions from a file.
///
/// The file itself being missing or unreadable is an error; malformed lines
/// are accumulated into the returned [`LoadStats`] while loading continues.
pub fn load_probes(path: impl AsRef<Path>) -> Result<(Vec<Probe>, LoadStats)> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot open probe file {}", path.display()))?;

    let (probes, stats) = parse_probes(&content);
    debug!(
        "loaded {} probes with {} matches from {} ({} lines, {} errors, {} unsupported patterns)",
        stats.probe_count,
        stats.match_count,
        path.display(),
        stats.total_lines,
        stats.error_lines.len(),
        stats.dropped_matches,
    );
    Ok((probes, stats))
}

/// Parse probe definitions from text.
///
/// Every non-blank, non-comment line is one directive. `Probe` opens a new
/// probe scope, `match` adds a rule to the current probe, a handful of other
/// nmap directives are recognized and ignored, and anything else is recorded
/// as a parse error.
pub fn parse_probes(content: &str) -> (Vec<Probe>, LoadStats) {
    let mut probes = Vec::new();
    let mut current: Option<Probe> = None;
    let mut stats = LoadStats::default();

    for raw_line in content.lines() {
        stats.total_lines += 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line.starts_with("Probe") {
            if let Some(probe) = current.take() {
                probes.push(probe);
            }
            match parse_probe_line(line) {
                Ok(probe) => {
                    current = Some(probe);
                    stats.probe_count += 1;
                }
                Err(message) => {
                    stats.error_lines.push(ParseError { line: stats.total_lines, message });
                }
            }
        } else if line.starts_with("match ") {
            let Some(probe) = current.as_mut() else {
                stats.error_lines.push(ParseError {
                    line: stats.total_lines,
                    message: "match found without preceding Probe".to_string(),
                });
                continue;
            };
            match parse_match_line(line) {
                Ok(m) => {
                    probe.matches.push(m);
                    stats.match_count += 1;
                }
                Err(MatchError::UnsupportedRegex) => {
                    stats.dropped_matches += 1;
                }
                Err(MatchError::Invalid(message)) => {
                    stats.error_lines.push(ParseError {
                        line: stats.total_lines,
                        message: format!("match parse error: {}", message),
                    });
                }
            }
        } else if is_known_directive(line) {
            continue;
        } else {
            stats.error_lines.push(ParseError {
                line: stats.total_lines,
                message: "unknown line format".to_string(),
            });
        }
    }

    if let Some(probe) = current.take() {
        probes.push(probe);
    }

    (probes, stats)
}

/// Directives that are valid nmap-service-probes syntax but intentionally
/// unused here: port hints, rarity, fallbacks and global timeouts.
fn is_known_directive(line: &str) -> bool {
    const KNOWN: [&str; 8] = [
        "softmatch",
        "ports",
        "sslports",
        "rarity",
        "fallback",
        "Exclude",
        "totalwaitms",
        "tcpwrappedms",
    ];
    KNOWN.iter().any(|directive| line.starts_with(directive))
}

/// Parse a line like `Probe TCP GetRequest q|GET / HTTP/1.0\r\n\r\n|`
fn parse_probe_line(line: &str) -> Result<Probe, String> {
    let rest = line.strip_prefix("Probe ").ok_or("invalid Probe format")?;

    let mut parts = rest.splitn(3, ' ');
    let protocol = parts.next().ok_or("invalid Probe format")?;
    let name = parts.next().ok_or("invalid Probe format")?;
    let data_str = parts.next().ok_or("invalid Probe format")?;

    let protocol = match protocol {
        "TCP" => ProbeProtocol::Tcp,
        "UDP" => ProbeProtocol::Udp,
        other => return Err(format!("unknown probe protocol: {}", other)),
    };

    let data = parse_probe_data(data_str).map_err(|e| format!("cannot parse probe data: {}", e))?;

    Ok(Probe {
        protocol,
        name: name.to_string(),
        data,
        matches: Vec::new(),
    })
}

/// Extract the payload from a `q|...|` section, decoding escape sequences.
/// Tokens after the closing delimiter (e.g. `no-payload`) are ignored.
fn parse_probe_data(data_str: &str) -> Result<Vec<u8>, String> {
    if data_str.len() < 3 || !data_str.starts_with("q|") {
        return Err("probe data must be in format q|...|".to_string());
    }
    let closing = data_str[2..]
        .rfind('|')
        .ok_or("probe data must be in format q|...|")?
        + 2;

    decode_payload(&data_str[2..closing])
}

/// Decode C-style escape sequences into raw bytes.
///
/// `\0XX` with two octal digits is a single octal byte; a standalone `\0`
/// is NUL and must not consume the following character. `\xHH` accepts
/// either hex case. Unescaped double quotes pass through as-is.
fn decode_payload(raw: &str) -> Result<Vec<u8>, String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        if i + 1 >= bytes.len() {
            return Err("trailing backslash in probe data".to_string());
        }
        match bytes[i + 1] {
            b'0' => {
                if i + 3 < bytes.len() && is_octal(bytes[i + 2]) && is_octal(bytes[i + 3]) {
                    out.push((bytes[i + 2] - b'0') * 8 + (bytes[i + 3] - b'0'));
                    i += 4;
                } else {
                    out.push(0);
                    i += 2;
                }
            }
            b'x' | b'X' => {
                if i + 3 >= bytes.len() {
                    return Err("truncated hex escape".to_string());
                }
                let hi = hex_value(bytes[i + 2]).ok_or("invalid hex escape")?;
                let lo = hex_value(bytes[i + 3]).ok_or("invalid hex escape")?;
                out.push(hi * 16 + lo);
                i += 4;
            }
            b'n' => {
                out.push(b'\n');
                i += 2;
            }
            b'r' => {
                out.push(b'\r');
                i += 2;
            }
            b't' => {
                out.push(b'\t');
                i += 2;
            }
            b'a' => {
                out.push(0x07);
                i += 2;
            }
            b'b' => {
                out.push(0x08);
                i += 2;
            }
            b'f' => {
                out.push(0x0c);
                i += 2;
            }
            b'v' => {
                out.push(0x0b);
                i += 2;
            }
            b'\\' => {
                out.push(b'\\');
                i += 2;
            }
            b'"' => {
                out.push(b'"');
                i += 2;
            }
            other => {
                return Err(format!("unsupported escape sequence \\{}", other as char));
            }
        }
    }

    Ok(out)
}

fn is_octal(c: u8) -> bool {
    (b'0'..=b'7').contains(&c)
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Parse a line like `match http m|^HTTP/1\.[01] |i p/Apache/`.
///
/// The byte after `m` is the pattern delimiter, whatever it happens to be.
/// The suffix after the closing delimiter carries the flag characters and
/// any nmap version-info tokens.
fn parse_match_line(line: &str) -> Result<ProbeMatch, MatchError> {
    let rest = line
        .strip_prefix("match ")
        .ok_or_else(|| MatchError::Invalid("invalid match format".to_string()))?;

    let (service_name, pattern_str) = rest
        .split_once(' ')
        .ok_or_else(|| MatchError::Invalid("invalid match format".to_string()))?;

    let mut chars = pattern_str.chars();
    if chars.next() != Some('m') {
        return Err(MatchError::Invalid(
            "invalid match pattern format: missing 'm'".to_string(),
        ));
    }
    let separator = chars.next().ok_or_else(|| {
        MatchError::Invalid("invalid match pattern format: missing separator".to_string())
    })?;

    let body = &pattern_str[1 + separator.len_utf8()..];
    let (pattern, flags_and_version) = body.split_once(separator).ok_or_else(|| {
        MatchError::Invalid(format!(
            "invalid match pattern format: could not split pattern and flags using separator '{}'",
            separator
        ))
    })?;

    // Flags are the i/s characters immediately after the closing delimiter;
    // version-info tokens follow after whitespace.
    let flags: String = flags_and_version
        .chars()
        .take_while(|c| *c == 'i' || *c == 's')
        .collect();

    let mut regex_str = pattern.to_string();
    if flags.contains('i') {
        regex_str = format!("(?i){}", regex_str);
    }
    if flags.contains('s') {
        regex_str = format!("(?s){}", regex_str);
    }

    if contains_unsupported_regex(&regex_str) {
        return Err(MatchError::UnsupportedRegex);
    }

    // Unicode mode is off so \xHH escapes match raw response bytes rather
    // than UTF-8 encoded codepoints; octal escapes (\0) are part of the RE2
    // dialect the probe files are written in.
    let pattern = match RegexBuilder::new(&regex_str)
        .unicode(false)
        .octal(true)
        .build()
    {
        Ok(re) => re,
        Err(e) => {
            let message = e.to_string();
            // Oversized repeat counts are valid nmap patterns the engine
            // cannot hold; they are skipped like other unsupported features.
            if message.contains("repetition") || message.contains("size limit") {
                return Err(MatchError::UnsupportedRegex);
            }
            return Err(MatchError::Invalid(format!(
                "cannot compile regex '{}': {}",
                regex_str, e
            )));
        }
    };

    Ok(ProbeMatch {
        service_name: service_name.to_string(),
        pattern,
        version_info: parse_version_info(flags_and_version),
    })
}

/// Perl regex features absent from the RE2 subset the `regex` crate speaks
fn contains_unsupported_regex(pattern: &str) -> bool {
    const UNSUPPORTED: [&str; 13] = [
        "(?!", "(?=", "(?<=", "(?<!", r"\1", r"\2", r"\3", r"\4", r"\5", r"\6", r"\7", r"\8",
        r"\9",
    ];
    UNSUPPORTED.iter().any(|feature| pattern.contains(feature))
}

/// Pull `p/…/ v/…/ i/…/ o/…/ h/…/ d/…/` tokens out of the match suffix
fn parse_version_info(suffix: &str) -> HashMap<String, String> {
    let mut info = HashMap::new();
    let bytes = suffix.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let at_token_start = i == 0 || bytes[i - 1].is_ascii_whitespace();
        if at_token_start
            && matches!(bytes[i], b'p' | b'v' | b'i' | b'o' | b'h' | b'd')
            && i + 1 < bytes.len()
            && bytes[i + 1] == b'/'
        {
            if let Some(end) = suffix[i + 2..].find('/') {
                let label = (bytes[i] as char).to_string();
                info.insert(label, suffix[i + 2..i + 2 + end].to_string());
                i += 2 + end + 1;
                continue;
            }
        }
        i += 1;
    }

    info
}

/// The loaded probe database: the full list plus per-protocol views and a
/// name lookup. Immutable after construction, freely shared across workers.
#[derive(Debug, Clone, Default)]
pub struct ProbeCatalogue {
    all: Vec<Arc<Probe>>,
    tcp: Vec<Arc<Probe>>,
    udp: Vec<Arc<Probe>>,
    by_name: HashMap<String, Vec<Arc<Probe>>>,
}

impl ProbeCatalogue {
    pub fn new(probes: Vec<Probe>) -> Self {
        let mut catalogue = Self::default();
        for probe in probes {
            let probe = Arc::new(probe);
            match probe.protocol {
                ProbeProtocol::Tcp => catalogue.tcp.push(Arc::clone(&probe)),
                ProbeProtocol::Udp => catalogue.udp.push(Arc::clone(&probe)),
            }
            catalogue
                .by_name
                .entry(probe.name.clone())
                .or_default()
                .push(Arc::clone(&probe));
            catalogue.all.push(probe);
        }
        catalogue
    }

    /// A catalogue with no probes; scanning degrades to plain port states
    pub fn empty() -> Self {
        Self::default()
    }

    /// All TCP probes in file order
    pub fn tcp_probes(&self) -> &[Arc<Probe>] {
        &self.tcp
    }

    /// All UDP probes in file order
    pub fn udp_probes(&self) -> &[Arc<Probe>] {
        &self.udp
    }

    /// Probes sharing a name, in file order
    pub fn probes_by_name(&self, name: &str) -> Option<&[Arc<Probe>]> {
        self.by_name.get(name).map(|probes| probes.as_slice())
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}
