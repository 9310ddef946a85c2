use chrono::{DateTime, NaiveDateTime};
use mailparse::{parse_mail, MailHeaderMap, ParsedMail};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{DEFAULT_ALERT_SENDER, DEFAULT_ALERT_SUBJECT};
use crate::error::{LedgerError, LedgerResult};
use crate::sync_range::Interval;
use crate::timestamps::{epoch_seconds, strip_offset};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEmail {
    pub message_id: String,
    pub subject: String,
    pub sender: String,
    pub received_at: NaiveDateTime,
    pub body: String,
}

/// One upstream search: alert sender, subject, and the window to cover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertQuery {
    pub sender: String,
    pub subject: String,
    pub window: Interval,
}

impl AlertQuery {
    pub fn new(sender: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            subject: subject.into(),
            window: Interval::default(),
        }
    }

    pub fn with_window(&self, window: Interval) -> Self {
        Self {
            window,
            ..self.clone()
        }
    }

    /// Gmail-style search string; the mail API treats `after`/`before` as epoch
    /// seconds.
    pub fn to_search_string(&self) -> String {
        let mut query = format!("from:{} subject:\"{}\"", self.sender, self.subject);
        if let Some(start) = self.window.start {
            query.push_str(&format!(" after:{}", epoch_seconds(&start)));
        }
        if let Some(end) = self.window.end {
            query.push_str(&format!(" before:{}", epoch_seconds(&end)));
        }
        query
    }

    pub fn matches(&self, email: &RawEmail) -> bool {
        if !contains_ignore_case(&email.sender, &self.sender) {
            return false;
        }
        if !contains_ignore_case(&email.subject, &self.subject) {
            return false;
        }
        if let Some(start) = self.window.start {
            if email.received_at < start {
                return false;
            }
        }
        if let Some(end) = self.window.end {
            if email.received_at > end {
                return false;
            }
        }
        true
    }
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self::new(DEFAULT_ALERT_SENDER, DEFAULT_ALERT_SUBJECT)
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    needle.trim().is_empty() || haystack.to_lowercase().contains(&needle.trim().to_lowercase())
}

/// Upstream mail source. Called once per gap.
pub trait MailSource {
    fn fetch(&self, query: &AlertQuery) -> LedgerResult<Vec<RawEmail>>;
}

impl<M: MailSource + ?Sized> MailSource for &M {
    fn fetch(&self, query: &AlertQuery) -> LedgerResult<Vec<RawEmail>> {
        (**self).fetch(query)
    }
}

/// Reads exported alert messages (`.eml`) from a directory tree.
#[derive(Debug, Clone)]
pub struct EmlDirSource {
    root: PathBuf,
}

impl EmlDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn collect_eml_files(&self) -> LedgerResult<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(LedgerError::Mail(format!(
                "未找到邮件目录: {}",
                self.root.to_string_lossy()
            )));
        }
        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }
        let mut files = WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| {
                p.extension()
                    .and_then(|s| s.to_str())
                    .map(|s| s.eq_ignore_ascii_case("eml"))
                    .unwrap_or(false)
            })
            .collect::<Vec<_>>();
        files.sort();
        Ok(files)
    }
}

impl MailSource for EmlDirSource {
    fn fetch(&self, query: &AlertQuery) -> LedgerResult<Vec<RawEmail>> {
        let files = self.collect_eml_files()?;
        let mut out = Vec::new();
        let mut unreadable = 0_usize;
        for file in &files {
            match read_eml(file) {
                Ok(email) if query.matches(&email) => out.push(email),
                Ok(_) => {}
                Err(err) => {
                    unreadable += 1;
                    tracing::warn!(file = %file.display(), error = %err, "skipping unreadable eml");
                }
            }
        }
        out.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        tracing::debug!(
            query = %query.to_search_string(),
            scanned = files.len(),
            matched = out.len(),
            unreadable,
            "eml directory fetch"
        );
        Ok(out)
    }
}

pub fn read_eml(path: &Path) -> LedgerResult<RawEmail> {
    let bytes = fs::read(path)?;
    let fallback_id = path.to_string_lossy().to_string();
    parse_eml_bytes(&bytes, &fallback_id)
}

pub fn parse_eml_bytes(bytes: &[u8], fallback_id: &str) -> LedgerResult<RawEmail> {
    let mail = parse_mail(bytes).map_err(|e| LedgerError::Mail(format!("解析 eml MIME 失败: {e}")))?;
    let header = |name: &str| mail.headers.get_first_value(name).unwrap_or_default();

    let date_text = header("Date");
    let received_at = parse_mail_date(&date_text)
        .ok_or_else(|| LedgerError::Mail(format!("无法识别邮件日期: {date_text}")))?;
    let body = extract_best_body(&mail)
        .ok_or_else(|| LedgerError::Mail("邮件不包含可解析正文（html/plain）".to_string()))?;
    let message_id = header("Message-ID")
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string();

    Ok(RawEmail {
        message_id: if message_id.is_empty() {
            fallback_id.to_string()
        } else {
            message_id
        },
        subject: header("Subject").trim().to_string(),
        sender: header("From").trim().to_string(),
        received_at,
        body,
    })
}

/// Wall-clock value of the `Date` header; the zone offset is dropped.
fn parse_mail_date(raw: &str) -> Option<NaiveDateTime> {
    let text = raw.trim();
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc2822(text) {
        return Some(strip_offset(&ts));
    }
    // Some exporters append a "(UTC)"-style comment chrono refuses.
    let without_comment = text.split(" (").next().unwrap_or(text);
    if let Ok(ts) = DateTime::parse_from_rfc2822(without_comment) {
        return Some(strip_offset(&ts));
    }
    // Looser layouts go through mailparse, which folds the zone into UTC epoch
    // seconds. Without the zone token its result is the wall clock itself.
    // It also answers 0 for text with no date in it.
    mailparse::dateparse(without_zone(without_comment))
        .ok()
        .filter(|secs| *secs > 0)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|ts| ts.naive_utc())
}

fn without_zone(text: &str) -> &str {
    let text = text.trim_end();
    match text.rsplit_once(char::is_whitespace) {
        Some((head, zone))
            if zone.starts_with(['+', '-'])
                || zone.chars().all(|c| c.is_ascii_alphabetic()) =>
        {
            head
        }
        _ => text,
    }
}

fn extract_best_body(mail: &ParsedMail) -> Option<String> {
    fn walk(mail: &ParsedMail, want_html: bool) -> Option<String> {
        let mime = mail.ctype.mimetype.to_ascii_lowercase();
        if (want_html && mime == "text/html") || (!want_html && mime == "text/plain") {
            if let Ok(body) = mail.get_body() {
                return Some(body);
            }
        }
        for part in &mail.subparts {
            if let Some(body) = walk(part, want_html) {
                return Some(body);
            }
        }
        None
    }

    walk(mail, true).or_else(|| walk(mail, false))
}

#[cfg(test)]
pub(crate) mod fixtures {
    /// A minimal HTML alert in the shape the issuing bank sends.
    pub fn alert_html(amount: &str, merchant: &str) -> String {
        format!(
            r#"<table><tr><td><div class="mobilestyle">Amount</div></td>
<td align="left"><div class="mobilestyle">{amount}</div></td></tr>
<tr><td><div class="mobilestyle">Merchant</div></td>
<td align="left"><div class="mobilestyle">{merchant}</div></td></tr></table>"#
        )
    }

    pub fn alert_eml(date: &str, subject: &str, amount: &str, merchant: &str) -> String {
        format!(
            "From: NCB Card Alerts <no-reply-ncbcardalerts@jncb.com>\r\n\
             To: someone@example.com\r\n\
             Subject: {subject}\r\n\
             Date: {date}\r\n\
             Message-ID: <{merchant}-{amount}@jncb.com>\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             {}\r\n",
            alert_html(amount, merchant)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::alert_eml;
    use super::*;
    use chrono::NaiveDate;

    fn ts(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("valid timestamp")
    }

    #[test]
    fn search_string_includes_present_bounds_only() {
        let query = AlertQuery::default();
        assert_eq!(
            query.to_search_string(),
            "from:no-reply-ncbcardalerts@jncb.com subject:\"Transaction Approved\""
        );
        let windowed = query.with_window(Interval::new(
            Some(NaiveDate::from_ymd_opt(1970, 1, 2).and_then(|d| d.and_hms_opt(0, 0, 0)).expect("ts")),
            None,
        ));
        assert!(windowed.to_search_string().ends_with(" after:86400"));
    }

    #[test]
    fn parses_headers_and_keeps_wall_clock_date() {
        let raw = alert_eml(
            "Wed, 10 Jan 2024 09:15:00 -0500",
            "Transaction Approved",
            "JMD 1,250.00",
            "HI-LO",
        );
        let email = parse_eml_bytes(raw.as_bytes(), "fallback").expect("parse eml");
        assert_eq!(email.subject, "Transaction Approved");
        assert!(email.sender.contains("no-reply-ncbcardalerts@jncb.com"));
        assert_eq!(email.received_at, ts(10, 9) + chrono::TimeDelta::minutes(15));
        assert!(email.message_id.starts_with("HI-LO-"));
        assert!(!email.message_id.starts_with('<'));
        assert!(email.body.contains("mobilestyle"));
    }

    #[test]
    fn loose_date_headers_keep_wall_clock_too() {
        let quarter_past = ts(10, 9) + chrono::TimeDelta::minutes(15);
        assert_eq!(
            parse_mail_date("Wednesday, 10 Jan 2024 09:15:00 -0500"),
            Some(quarter_past)
        );
        assert_eq!(
            parse_mail_date("10 January 2024 09:15:00 +0530 (IST)"),
            Some(quarter_past)
        );
        assert_eq!(parse_mail_date("10 Jan 2024"), Some(ts(10, 0)));
        assert_eq!(parse_mail_date("not a date"), None);
    }

    #[test]
    fn directory_source_filters_by_window_sender_and_subject() {
        let dir = tempfile::tempdir().expect("temp dir");
        let nested = dir.path().join("2024/01");
        fs::create_dir_all(&nested).expect("nested dir");
        let files = [
            ("a.eml", "Fri, 05 Jan 2024 10:00:00 +0000", "Transaction Approved"),
            ("b.eml", "Mon, 15 Jan 2024 10:00:00 +0000", "Transaction Approved"),
            ("c.eml", "Mon, 15 Jan 2024 11:00:00 +0000", "Your statement is ready"),
            ("d.EML", "Sat, 20 Jan 2024 10:00:00 +0000", "Transaction Approved"),
        ];
        for (name, date, subject) in files {
            fs::write(nested.join(name), alert_eml(date, subject, "JMD 100.00", name))
                .expect("write eml");
        }
        fs::write(nested.join("notes.txt"), "not mail").expect("write txt");
        fs::write(nested.join("broken.eml"), "Subject: no date\r\n\r\nbody").expect("write broken");

        let source = EmlDirSource::new(dir.path());
        let query = AlertQuery::default().with_window(Interval::bounded(ts(10, 0), ts(31, 0)));
        let fetched = source.fetch(&query).expect("fetch");
        let dates = fetched.iter().map(|e| e.received_at).collect::<Vec<_>>();
        assert_eq!(dates, vec![ts(15, 10), ts(20, 10)]);
    }

    #[test]
    fn missing_directory_is_a_mail_error() {
        let source = EmlDirSource::new("/definitely/not/here");
        let err = source.fetch(&AlertQuery::default()).expect_err("missing dir");
        assert!(matches!(err, LedgerError::Mail(_)));
    }
}
