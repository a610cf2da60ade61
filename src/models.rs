use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Port state classifications assigned by the scan workers
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// The port accepted our probe (TCP handshake or UDP response)
    Open,
    /// The port actively refused the probe (RST or ICMP unreachable)
    Closed,
    /// No definitive evidence either way, typically a silent packet drop
    Filtered,
    /// UDP-only: no response, which may mean open or filtered
    #[serde(rename = "Open|Filtered")]
    OpenFiltered,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Open => write!(f, "Open"),
            ScanState::Closed => write!(f, "Closed"),
            ScanState::Filtered => write!(f, "Filtered"),
            ScanState::OpenFiltered => write!(f, "Open|Filtered"),
        }
    }
}

impl FromStr for ScanState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Open" => Ok(ScanState::Open),
            "Closed" => Ok(ScanState::Closed),
            "Filtered" => Ok(ScanState::Filtered),
            "Open|Filtered" => Ok(ScanState::OpenFiltered),
            _ => Err(format!("invalid scan state: {}", s)),
        }
    }
}

/// Supported scanning strategies
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    /// Full TCP three-way handshake plus probe-based service detection
    #[default]
    Connect,
    /// Half-open raw SYN scan, requires root/administrator privileges
    Syn,
    /// UDP datagram probe
    Udp,
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Connect => write!(f, "connect"),
            ScanMode::Syn => write!(f, "syn"),
            ScanMode::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for ScanMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "connect" => Ok(ScanMode::Connect),
            "syn" => Ok(ScanMode::Syn),
            "udp" => Ok(ScanMode::Udp),
            _ => Err(format!("invalid scan mode: {}", s)),
        }
    }
}

/// A single `(host, port)` probe handed to one worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanJob {
    pub host: String,
    pub port: u16,
}

/// Outcome of probing one `(host, port)` pair
///
/// `service` carries the identified service name for open TCP ports, or the
/// raw banner when nothing matched. It stays empty for every non-open state
/// and for SYN/UDP results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub host: String,
    pub port: u16,
    pub state: ScanState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service: String,
}

/// Lifecycle states of a queued scan task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A scan request travelling through the task queue
///
/// One task fans out to `hosts × ports` jobs. `results` is populated only on
/// completion, `error` only on failure; neither field survives the transition
/// to `running`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanTask {
    pub id: Uuid,
    pub status: TaskStatus,
    pub hosts: Vec<String>,
    /// Port range expression, e.g. "22-80"
    pub ports: String,
    pub mode: ScanMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ScanResult>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl ScanTask {
    /// Create a pending task with a fresh v4 id
    pub fn new(hosts: Vec<String>, ports: impl Into<String>, mode: ScanMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            hosts,
            ports: ports.into(),
            mode,
            results: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            error: String::new(),
        }
    }

    /// Whether the task has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Error types for port range parsing
#[derive(Error, Debug, PartialEq, Eq)]
pub enum PortRangeError {
    #[error("invalid port range format, use startPort-endPort")]
    InvalidFormat,

    #[error("start port is not a number: {0}")]
    InvalidStart(String),

    #[error("end port is not a number: {0}")]
    InvalidEnd(String),

    #[error("ports must be within 0-65535 range")]
    OutOfRange,

    #[error("start port is greater than end port: {0} > {1}")]
    StartGreaterThanEnd(u16, u16),
}

/// Parse a port range expression of the form `"start-end"`.
///
/// Both sides must be decimal integers within 0-65535 and `start <= end`.
pub fn parse_port_range(expr: &str) -> Result<(u16, u16), PortRangeError> {
    let parts: Vec<&str> = expr.split('-').collect();
    if parts.len() != 2 {
        return Err(PortRangeError::InvalidFormat);
    }

    let start: u32 = parts[0]
        .parse()
        .map_err(|_| PortRangeError::InvalidStart(parts[0].to_string()))?;
    let end: u32 = parts[1]
        .parse()
        .map_err(|_| PortRangeError::InvalidEnd(parts[1].to_string()))?;

    if start > 65535 || end > 65535 {
        return Err(PortRangeError::OutOfRange);
    }
    if start > end {
        return Err(PortRangeError::StartGreaterThanEnd(start as u16, end as u16));
    }

    Ok((start as u16, end as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_valid_range() {
        assert_eq!(parse_port_range("22-80").unwrap(), (22, 80));
        assert_eq!(parse_port_range("0-65535").unwrap(), (0, 65535));
        assert_eq!(parse_port_range("443-443").unwrap(), (443, 443));
    }

    #[test]
    fn parse_rejects_bad_format() {
        assert_eq!(parse_port_range("80").unwrap_err(), PortRangeError::InvalidFormat);
        assert_eq!(parse_port_range("1-2-3").unwrap_err(), PortRangeError::InvalidFormat);
        assert_eq!(
            parse_port_range("abc-20").unwrap_err(),
            PortRangeError::InvalidStart("abc".to_string())
        );
        assert_eq!(
            parse_port_range("20-xyz").unwrap_err(),
            PortRangeError::InvalidEnd("xyz".to_string())
        );
    }

    #[test]
    fn parse_rejects_out_of_range_and_inverted() {
        assert_eq!(parse_port_range("1-70000").unwrap_err(), PortRangeError::OutOfRange);
        assert_eq!(
            parse_port_range("90-80").unwrap_err(),
            PortRangeError::StartGreaterThanEnd(90, 80)
        );
    }

    #[test]
    fn scan_state_wire_format() {
        assert_eq!(serde_json::to_string(&ScanState::Open).unwrap(), "\"Open\"");
        assert_eq!(
            serde_json::to_string(&ScanState::OpenFiltered).unwrap(),
            "\"Open|Filtered\""
        );
        assert_eq!("Open|Filtered".parse::<ScanState>().unwrap(), ScanState::OpenFiltered);
        assert_eq!(ScanState::Filtered.to_string(), "Filtered");
    }

    #[test]
    fn scan_mode_round_trip() {
        for mode in [ScanMode::Connect, ScanMode::Syn, ScanMode::Udp] {
            assert_eq!(mode.to_string().parse::<ScanMode>().unwrap(), mode);
        }
        assert!("xmas".parse::<ScanMode>().is_err());
    }

    #[test]
    fn result_omits_empty_service() {
        let result = ScanResult {
            host: "127.0.0.1".to_string(),
            port: 1,
            state: ScanState::Closed,
            service: String::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("service").is_none());
        assert_eq!(json["state"], "Closed");
    }

    #[test]
    fn task_round_trips_through_json() {
        let mut task = ScanTask::new(
            vec!["127.0.0.1".to_string(), "localhost".to_string()],
            "22-80",
            ScanMode::Connect,
        );
        task.status = TaskStatus::Completed;
        task.completed_at = Some(Utc::now());
        task.results = vec![ScanResult {
            host: "127.0.0.1".to_string(),
            port: 22,
            state: ScanState::Open,
            service: "ssh".to_string(),
        }];

        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: ScanTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, task);
    }

    #[test]
    fn pending_task_omits_terminal_fields() {
        let task = ScanTask::new(vec!["127.0.0.1".to_string()], "1-10", ScanMode::Udp);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["mode"], "udp");
        assert!(json.get("results").is_none());
        assert!(json.get("completed_at").is_none());
        assert!(json.get("error").is_none());
        assert!(!task.is_terminal());
    }
}
