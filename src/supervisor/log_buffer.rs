use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

const DEFAULT_MAX_LINES: usize = 500;

/// Bounded per-service history of captured stdout/stderr lines.
pub struct LogBuffer {
    max_lines: usize,
    logs: RwLock<HashMap<String, VecDeque<String>>>,
}

impl LogBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            max_lines: max_lines.max(1),
            logs: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line, evicting the oldest once the service is at capacity.
    pub fn push(&self, service: &str, line: String) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        let entries = logs.entry(service.to_string()).or_default();
        if entries.len() == self.max_lines {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Last `n` lines for a service, oldest first.
    pub fn tail(&self, service: &str, n: usize) -> Vec<String> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = logs.get(service) else {
            return Vec::new();
        };
        let skip = entries.len().saturating_sub(n);
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn clear(&self, service: &str) {
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.remove(service);
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_newest_lines() {
        let buf = LogBuffer::new(3);
        for i in 0..7 {
            buf.push("xvfb", format!("frame {i}"));
        }
        assert_eq!(buf.tail("xvfb", 10), vec!["frame 4", "frame 5", "frame 6"]);
        assert_eq!(buf.tail("xvfb", 1), vec!["frame 6"]);
    }

    #[test]
    fn services_are_isolated() {
        let buf = LogBuffer::default();
        buf.push("a", "from a".into());
        buf.push("b", "from b".into());
        buf.clear("a");
        assert!(buf.tail("a", 5).is_empty());
        assert_eq!(buf.tail("b", 5), vec!["from b"]);
    }
}
