use log::trace;
use regex::{Captures, Regex};

use super::types::{LogEvent, LogRecord, UsageCounters};

/// Recognises relay log records.
///
/// A record is either a single line or a few consecutive lines joined with
/// `\n` (see [`super::line_window::LineWindow`]). Every pattern is anchored on
/// the end of the record, so a multi-line record is recognised once: when its
/// last line is the newest line of the record.
///
/// Patterns are tried in a fixed order (client, allocate, usage, disconnect)
/// and the first match wins.
pub struct LogParser {
    client: Regex,
    allocate: Regex,
    usage: Regex,
    disconnect: Regex,
    bracket: Regex,
    remote_addr: Regex,
    remote_ip: Regex,
    reason: Regex,
    counter: Regex,
}

impl LogParser {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            client: Regex::new(
                r"New UDP endpoint[^\n]*remote addr[^\n]*\n[^\n]*\berror 401\b[^\n]*$",
            )?,
            allocate: Regex::new(
                r"Local relay addr[^\n]*\n[^\n]*\n[^\n]*ALLOCATE processed, success[^\n]*$",
            )?,
            usage: Regex::new(r"usage: realm[^\n]* username=[^\n]* sb=[^\n]*$")?,
            disconnect: Regex::new(
                r"closed[^\n]*user[^\n]*realm[^\n]*origin[^\n]*local[^\n]*remote[^\n]*$",
            )?,
            bracket: Regex::new(r"<([^<>\s]*)>")?,
            remote_addr: Regex::new(r"remote addr:?\s*(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):")?,
            remote_ip: Regex::new(r"remote ([^:\s]*):")?,
            reason: Regex::new(r"reason:(.*)$")?,
            counter: Regex::new(r"\b(rp|rb|sp|sb)=([^\s,]*)")?,
        })
    }

    /// Parses a record into an event, dropping the raw text.
    pub fn parse(&self, record: &str) -> Option<LogEvent> {
        self.parse_record(record).map(|r| r.event)
    }

    /// Parses a record and keeps the matched span alongside the event.
    pub fn parse_record(&self, record: &str) -> Option<LogRecord> {
        let parsed = self
            .parse_client(record)
            .or_else(|| self.parse_allocate(record))
            .or_else(|| self.parse_usage(record))
            .or_else(|| self.parse_disconnect(record));

        if let Some((raw, event)) = &parsed {
            trace!("Recognised {} record: {:?}", event.kind(), raw);
        }
        parsed.map(|(raw, event)| LogRecord {
            raw: raw.to_string(),
            event,
        })
    }

    fn parse_client<'a>(&self, record: &'a str) -> Option<(&'a str, LogEvent)> {
        let span = self.client.find(record)?.as_str();
        let realm = self.brackets(span).into_iter().next()?;
        let ip = self.remote_addr.captures(span)?.get(1)?.as_str().to_string();

        Some((span, LogEvent::Client { realm, ip }))
    }

    fn parse_allocate<'a>(&self, record: &'a str) -> Option<(&'a str, LogEvent)> {
        let span = self.allocate.find(record)?.as_str();
        let mut brackets = self.brackets(span).into_iter();
        let realm = brackets.next()?;
        let user = brackets.next()?;

        Some((span, LogEvent::Allocate { realm, user }))
    }

    fn parse_usage<'a>(&self, record: &'a str) -> Option<(&'a str, LogEvent)> {
        let span = self.usage.find(record)?.as_str();
        let mut brackets = self.brackets(span).into_iter();
        let realm = brackets.next()?;
        let user = brackets.next()?;

        let mut rp = None;
        let mut rb = None;
        let mut sp = None;
        let mut sb = None;
        for caps in self.counter.captures_iter(span) {
            let slot = match &caps[1] {
                "rp" => &mut rp,
                "rb" => &mut rb,
                "sp" => &mut sp,
                _ => &mut sb,
            };
            if slot.is_none() {
                *slot = Some(Self::counter_value(&caps)?);
            }
        }

        let counters = UsageCounters {
            rp: rp?,
            rb: rb?,
            sp: sp?,
            sb: sb?,
        };
        Some((
            span,
            LogEvent::Usage {
                realm,
                user,
                counters,
            },
        ))
    }

    fn parse_disconnect<'a>(&self, record: &'a str) -> Option<(&'a str, LogEvent)> {
        let span = self.disconnect.find(record)?.as_str();
        let mut brackets = self.brackets(span).into_iter();
        let user = brackets.next()?;
        let realm = brackets.next()?;
        let origin = brackets.next()?;
        let ip = self.remote_ip.captures(span)?.get(1)?.as_str().to_string();
        let reason = self
            .reason
            .captures(span)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
            .unwrap_or_default();

        Some((
            span,
            LogEvent::Disconnect {
                user,
                realm,
                origin,
                ip,
                reason,
            },
        ))
    }

    /// Every `<token>` in order of appearance, without the angle brackets.
    fn brackets(&self, text: &str) -> Vec<String> {
        self.bracket
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    fn counter_value(caps: &Captures<'_>) -> Option<u64> {
        caps.get(2)?.as_str().parse().ok()
    }
}
