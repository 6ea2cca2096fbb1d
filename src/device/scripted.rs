//! Canned-response device for dry runs and tests.

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use super::{Device, DeviceError, DeviceResult};
use crate::config::ScriptedDeviceConfig;

/// A device that answers sent commands from a fixed rule table.
///
/// Each rule pairs a command regex with canned output; the first matching
/// rule's output is appended to the buffer when a command is sent. Tests
/// can also preload output directly with [`push_output`](Self::push_output).
pub struct ScriptedDevice {
    name: String,
    rules: Vec<(Regex, String)>,
    buffer: String,
    /// Read position; everything before it was consumed by `expect`.
    cursor: usize,
    keep_running: bool,
}

impl ScriptedDevice {
    pub fn new(name: &str, config: &ScriptedDeviceConfig) -> DeviceResult<Self> {
        let mut rules = Vec::with_capacity(config.responses.len());
        for rule in &config.responses {
            let pattern = Regex::new(&rule.when).map_err(|e| DeviceError::Pattern {
                pattern: rule.when.clone(),
                source: Box::new(e),
            })?;
            rules.push((pattern, rule.output.clone()));
        }
        Ok(Self {
            name: name.to_string(),
            rules,
            buffer: String::new(),
            cursor: 0,
            keep_running: false,
        })
    }

    /// Appends text to the device buffer, as if the device produced it.
    pub fn push_output(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    fn unread(&self) -> &str {
        &self.buffer[self.cursor..]
    }
}

#[async_trait]
impl Device for ScriptedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&mut self, text: &str) -> DeviceResult<()> {
        if let Some((_, output)) = self.rules.iter().find(|(re, _)| re.is_match(text)) {
            let output = output.clone();
            self.buffer.push_str(&output);
            if !output.ends_with('\n') {
                self.buffer.push('\n');
            }
        }
        Ok(())
    }

    async fn expect(&mut self, pattern: &str, _timeout: Duration) -> DeviceResult<(bool, String)> {
        let re = Regex::new(pattern).map_err(|e| DeviceError::Pattern {
            pattern: pattern.to_string(),
            source: Box::new(e),
        })?;

        // All canned output is already present; the timeout never waits.
        match re.find(self.unread()) {
            Some(m) => {
                let end = self.cursor + m.end();
                let seen = self.buffer[self.cursor..end].to_string();
                self.cursor = end;
                Ok((true, seen))
            }
            None => Ok((false, self.unread().to_string())),
        }
    }

    fn get_buffer(&self) -> String {
        self.unread().to_string()
    }

    fn set_keep_running(&mut self, keep: bool) {
        self.keep_running = keep;
    }

    fn keep_running(&self) -> bool {
        self.keep_running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplayRule;

    fn device_with_rules(rules: Vec<(&str, &str)>) -> ScriptedDevice {
        let config = ScriptedDeviceConfig {
            responses: rules
                .into_iter()
                .map(|(when, output)| ReplayRule {
                    when: when.to_string(),
                    output: output.to_string(),
                })
                .collect(),
            ..Default::default()
        };
        ScriptedDevice::new("FGT1", &config).unwrap()
    }

    #[tokio::test]
    async fn test_send_appends_matching_rule_output() {
        let mut dev = device_with_rules(vec![("get system status", "Version: 7.4.1")]);
        dev.send("get system status").await.unwrap();
        assert!(dev.get_buffer().contains("Version: 7.4.1"));
    }

    #[tokio::test]
    async fn test_expect_advances_buffer() {
        let mut dev = device_with_rules(vec![]);
        dev.push_output("Welcome\nlogin: ");

        let (matched, seen) = dev.expect("login:", Duration::ZERO).await.unwrap();
        assert!(matched);
        assert!(seen.contains("Welcome"));

        // Consumed output never matches again.
        let (matched, _) = dev.expect("login:", Duration::ZERO).await.unwrap();
        assert!(!matched);
    }

    #[tokio::test]
    async fn test_expect_miss_reports_unread_buffer() {
        let mut dev = device_with_rules(vec![]);
        dev.push_output("nothing useful");
        let (matched, seen) = dev.expect("login:", Duration::ZERO).await.unwrap();
        assert!(!matched);
        assert_eq!(seen, "nothing useful");
    }

    #[tokio::test]
    async fn test_bad_pattern_is_an_error() {
        let mut dev = device_with_rules(vec![]);
        let err = dev.expect("(unclosed", Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, DeviceError::Pattern { .. }));
    }

    #[test]
    fn test_keep_running_flag() {
        let mut dev = device_with_rules(vec![]);
        assert!(!dev.keep_running());
        dev.set_keep_running(true);
        assert!(dev.keep_running());
    }
}
