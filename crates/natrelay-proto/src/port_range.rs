//! Allowed TCP port range expressions
//!
//! Accepts a single range (`"1024-65535"`), a single port (`"8080"`) or a
//! comma-separated mix of both (`"2000-2010, 3000, 4000-4005"`).

use std::fmt;
use std::str::FromStr;

/// Set of ports a TCP tunnel may bind, kept as inclusive segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRange {
    segments: Vec<(u16, u16)>,
}

/// Port range parse errors
#[derive(Debug, Clone, PartialEq)]
pub enum PortRangeError {
    /// Expression had no segments
    Empty,
    /// A port was not a number in 1..=65535
    InvalidPort(String),
    /// Range with start above end
    Reversed(String),
}

impl fmt::Display for PortRangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortRangeError::Empty => write!(f, "Empty port range"),
            PortRangeError::InvalidPort(s) => write!(f, "Invalid port: {}", s),
            PortRangeError::Reversed(s) => write!(f, "Port range start exceeds end: {}", s),
        }
    }
}

impl std::error::Error for PortRangeError {}

fn parse_port(s: &str) -> Result<u16, PortRangeError> {
    match s.trim().parse::<u16>() {
        Ok(0) | Err(_) => Err(PortRangeError::InvalidPort(s.trim().to_string())),
        Ok(port) => Ok(port),
    }
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            segments: vec![(start.min(end), start.max(end))],
        }
    }

    pub fn parse(expr: &str) -> Result<Self, PortRangeError> {
        let mut segments = Vec::new();

        for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if let Some((start, end)) = part.split_once('-') {
                let start = parse_port(start)?;
                let end = parse_port(end)?;
                if start > end {
                    return Err(PortRangeError::Reversed(part.to_string()));
                }
                segments.push((start, end));
            } else {
                let port = parse_port(part)?;
                segments.push((port, port));
            }
        }

        if segments.is_empty() {
            return Err(PortRangeError::Empty);
        }

        Ok(Self { segments })
    }

    pub fn contains(&self, port: u16) -> bool {
        self.segments
            .iter()
            .any(|(start, end)| (*start..=*end).contains(&port))
    }

    /// Number of ports in the range (overlapping segments count twice)
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(|(start, end)| (*end - *start) as usize + 1)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Port at a position in declaration order
    pub fn nth(&self, mut index: usize) -> Option<u16> {
        for (start, end) in &self.segments {
            let width = (*end - *start) as usize + 1;
            if index < width {
                return Some(*start + index as u16);
            }
            index -= width;
        }
        None
    }

    /// Every port exactly once, starting at `offset` and wrapping around
    pub fn iter_from(&self, offset: usize) -> impl Iterator<Item = u16> + '_ {
        let len = self.len();
        (0..len).filter_map(move |i| self.nth((offset + i) % len))
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(1024, 65535)
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .segments
            .iter()
            .map(|(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{}-{}", start, end)
                }
            })
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
