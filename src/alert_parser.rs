//! Regex extraction of transaction facts from card-alert bodies.

use chrono::NaiveDateTime;
use regex::Regex;
use std::sync::OnceLock;

use crate::error::{LedgerError, LedgerResult};
use crate::mail_source::RawEmail;

pub const DEFAULT_CURRENCY: &str = "JMD";
const KNOWN_CURRENCIES: &[&str] = &["JMD", "USD"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAlert {
    pub occurred_at: NaiveDateTime,
    pub amount_cents: i64,
    pub currency: String,
    pub merchant: String,
}

fn amount_cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"<div class="mobilestyle">Amount</div></td>\s*<td[^>]*><div class="mobilestyle">([\w\s,.]+)</div>"#,
        )
        .expect("invalid amount cell regex")
    })
}

fn merchant_cell_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"<div class="mobilestyle">Merchant</div></td>\s*<td[^>]*><div class="mobilestyle">([\w\s'-]+)</div>"#,
        )
        .expect("invalid merchant cell regex")
    })
}

fn ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("invalid ws regex"))
}

fn trim_text(s: &str) -> String {
    ws_re().replace_all(s.trim(), " ").trim().to_string()
}

/// Parses one alert. `None` means the body is not a recognisable alert; the
/// reason is logged and the email is skipped.
pub fn parse_alert(email: &RawEmail) -> Option<ParsedAlert> {
    let amount = amount_cell_re()
        .captures(&email.body)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str());
    let merchant = merchant_cell_re()
        .captures(&email.body)
        .and_then(|c| c.get(1))
        .map(|m| trim_text(m.as_str()));

    let (Some(amount), Some(merchant)) = (amount, merchant) else {
        tracing::warn!(
            message_id = %email.message_id,
            received_at = %email.received_at,
            "failed to locate amount/merchant cells in alert"
        );
        return None;
    };
    if merchant.is_empty() {
        tracing::warn!(message_id = %email.message_id, "alert has an empty merchant");
        return None;
    }

    match parse_amount_with_currency(amount) {
        Ok((amount_cents, currency)) => Some(ParsedAlert {
            occurred_at: email.received_at,
            amount_cents,
            currency,
            merchant,
        }),
        Err(err) => {
            tracing::warn!(message_id = %email.message_id, error = %err, "unparseable alert amount");
            None
        }
    }
}

/// `"USD 1,234.5"` → `(123450, "USD")`. A missing code means [`DEFAULT_CURRENCY`].
pub fn parse_amount_with_currency(raw: &str) -> LedgerResult<(i64, String)> {
    let text = trim_text(raw).to_uppercase();
    let mut currency = DEFAULT_CURRENCY.to_string();
    let mut number = text.clone();
    for code in KNOWN_CURRENCIES {
        if text.contains(code) {
            currency = (*code).to_string();
            number = number.replace(code, "");
        }
    }
    Ok((parse_amount_text_to_cents(&number)?, currency))
}

pub fn parse_amount_text_to_cents(raw: &str) -> LedgerResult<i64> {
    let invalid = || LedgerError::Validation(format!("金额格式不合法: {raw}"));
    let mut s = raw.trim().replace([',', ' '], "");
    if s.is_empty() {
        return Err(invalid());
    }
    let negative = s.starts_with('-');
    if s.starts_with('-') || s.starts_with('+') {
        s = s[1..].to_string();
    }
    if s.is_empty() {
        return Err(invalid());
    }
    let parts = s.split('.').collect::<Vec<_>>();
    if parts.len() > 2 {
        return Err(invalid());
    }
    let int_part = if parts[0].is_empty() { "0" } else { parts[0] };
    if !int_part.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let frac_part = if parts.len() == 2 { parts[1] } else { "" };
    if !frac_part.chars().all(|c| c.is_ascii_digit()) || frac_part.len() > 2 {
        return Err(invalid());
    }
    let int_val = int_part
        .parse::<i64>()
        .map_err(|_| LedgerError::Validation(format!("金额超范围: {raw}")))?;
    let frac_val = match frac_part.len() {
        0 => 0,
        1 => frac_part.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => frac_part.parse::<i64>().map_err(|_| invalid())?,
    };
    let mut cents = int_val
        .checked_mul(100)
        .and_then(|v| v.checked_add(frac_val))
        .ok_or_else(|| LedgerError::Validation(format!("金额超范围: {raw}")))?;
    if negative {
        cents = -cents;
    }
    Ok(cents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail_source::fixtures::alert_html;
    use chrono::NaiveDate;

    fn email(body: String) -> RawEmail {
        RawEmail {
            message_id: "m1".to_string(),
            subject: "Transaction Approved".to_string(),
            sender: "no-reply-ncbcardalerts@jncb.com".to_string(),
            received_at: NaiveDate::from_ymd_opt(2024, 1, 10)
                .and_then(|d| d.and_hms_opt(12, 0, 0))
                .expect("ts"),
            body,
        }
    }

    #[test]
    fn extracts_amount_currency_and_merchant() {
        let parsed = parse_alert(&email(alert_html("USD 1,234.50", "JOHN R WONG  SUPERMARKET")))
            .expect("parsed alert");
        assert_eq!(parsed.amount_cents, 123_450);
        assert_eq!(parsed.currency, "USD");
        assert_eq!(parsed.merchant, "JOHN R WONG SUPERMARKET");
    }

    #[test]
    fn currency_defaults_to_jmd() {
        let parsed = parse_alert(&email(alert_html("2,000", "USAIN BOLT'S TRACKS AND R")))
            .expect("parsed alert");
        assert_eq!(parsed.amount_cents, 200_000);
        assert_eq!(parsed.currency, "JMD");
        assert_eq!(parsed.merchant, "USAIN BOLT'S TRACKS AND R");
    }

    #[test]
    fn non_alert_bodies_are_skipped() {
        assert_eq!(parse_alert(&email("<p>Your statement is ready</p>".to_string())), None);
        assert_eq!(parse_alert(&email(alert_html("JMD 1.2.3", "HI-LO"))), None);
    }

    #[test]
    fn amount_text_rules() {
        assert_eq!(parse_amount_text_to_cents("12.5").expect("one decimal"), 1250);
        assert_eq!(parse_amount_text_to_cents("-3").expect("negative"), -300);
        assert_eq!(parse_amount_text_to_cents(".75").expect("no int part"), 75);
        assert!(parse_amount_text_to_cents("1.234").is_err());
        assert!(parse_amount_text_to_cents("abc").is_err());
    }
}
