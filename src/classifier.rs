//! Merchant classification: rule tables plus an explicitly owned TTL cache.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::rules_store::{KeywordRule, RulesStore, SpecialRule};

pub const FALLBACK_PRIMARY_CATEGORY: &str = "Other";
pub const FALLBACK_SUBCATEGORY: &str = "Uncategorized";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerchantCategory {
    pub primary_category: String,
    pub subcategory: String,
    pub confidence: f64,
    pub description: String,
}

impl MerchantCategory {
    pub fn uncategorized() -> Self {
        Self {
            primary_category: FALLBACK_PRIMARY_CATEGORY.to_string(),
            subcategory: FALLBACK_SUBCATEGORY.to_string(),
            confidence: 0.0,
            description: "no rule matched".to_string(),
        }
    }
}

pub trait MerchantClassifier {
    fn classify(&self, merchant: &str) -> LedgerResult<MerchantCategory>;
}

impl<C: MerchantClassifier + ?Sized> MerchantClassifier for &C {
    fn classify(&self, merchant: &str) -> LedgerResult<MerchantCategory> {
        (**self).classify(merchant)
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: KeywordRule,
    regex: Option<Regex>,
}

/// Special rules (exact merchant) win; keyword rules are tried in priority order.
#[derive(Debug, Default)]
pub struct RuleClassifier {
    special: HashMap<String, SpecialRule>,
    keyword: Vec<CompiledRule>,
}

impl RuleClassifier {
    pub fn new(special: Vec<SpecialRule>, mut keyword: Vec<KeywordRule>) -> LedgerResult<Self> {
        keyword.sort_by_key(|r| r.priority);
        let keyword = keyword
            .into_iter()
            .map(|rule| -> LedgerResult<CompiledRule> {
                let regex = if rule.match_type == "regex" {
                    Some(Regex::new(&rule.pattern).map_err(|e| {
                        LedgerError::Classification(format!(
                            "分类规则正则无效 {}: {e}",
                            rule.pattern
                        ))
                    })?)
                } else {
                    None
                };
                Ok(CompiledRule { rule, regex })
            })
            .collect::<LedgerResult<Vec<_>>>()?;
        let special = special
            .into_iter()
            .map(|r| (normalize_merchant(&r.merchant), r))
            .collect();
        Ok(Self { special, keyword })
    }

    pub fn from_store(store: &RulesStore) -> LedgerResult<Self> {
        let classifier = Self::new(store.list_rules()?, store.load_keyword_rules()?)?;
        tracing::info!(
            rules_dir = %store.dir().display(),
            special = classifier.special.len(),
            keyword = classifier.keyword.len(),
            "classification rules loaded"
        );
        Ok(classifier)
    }
}

fn normalize_merchant(merchant: &str) -> String {
    merchant.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

fn match_rule(compiled: &CompiledRule, merchant: &str) -> bool {
    let rule = &compiled.rule;
    let target = normalize_merchant(merchant);
    match rule.match_type.as_str() {
        "exact" => target == normalize_merchant(&rule.pattern),
        "prefix" => target.starts_with(&rule.pattern.to_lowercase()),
        "regex" => compiled
            .regex
            .as_ref()
            .map(|re| re.is_match(merchant))
            .unwrap_or(false),
        _ => rule
            .pattern
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|part| target.contains(&part.to_lowercase())),
    }
}

impl MerchantClassifier for RuleClassifier {
    fn classify(&self, merchant: &str) -> LedgerResult<MerchantCategory> {
        if let Some(rule) = self.special.get(&normalize_merchant(merchant)) {
            return Ok(MerchantCategory {
                primary_category: rule.category.clone(),
                subcategory: rule.subcategory.clone(),
                confidence: 1.0,
                description: format!("special rule for {}", rule.merchant),
            });
        }
        for compiled in &self.keyword {
            if match_rule(compiled, merchant) {
                let rule = &compiled.rule;
                return Ok(MerchantCategory {
                    primary_category: rule.primary_category.clone(),
                    subcategory: rule.subcategory.clone(),
                    confidence: rule.confidence,
                    description: format!("{} rule '{}'", rule.match_type, rule.pattern),
                });
            }
        }
        Ok(MerchantCategory::uncategorized())
    }
}

struct CacheEntry {
    value: MerchantCategory,
    inserted_at: Instant,
}

/// TTL cache in front of another classifier, keyed by normalized merchant.
pub struct CachedClassifier<C> {
    inner: C,
    ttl: Duration,
    max_size: usize,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl<C: MerchantClassifier> CachedClassifier<C> {
    pub fn new(inner: C, config: &CacheConfig) -> Self {
        Self {
            inner,
            ttl: Duration::from_secs(config.ttl_secs),
            max_size: config.max_size,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str, now: Instant) -> Option<MerchantCategory> {
        let mut entries = self.entries.lock().ok()?;
        match entries.get(key) {
            Some(entry) if now.duration_since(entry.inserted_at) < self.ttl => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn store(&self, key: String, value: &MerchantCategory, now: Instant) {
        if self.max_size == 0 {
            return;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, e| now.duration_since(e.inserted_at) < ttl);
            if entries.len() >= self.max_size {
                // Evict the oldest entry.
                if let Some(oldest) = entries
                    .iter()
                    .min_by_key(|(_, e)| e.inserted_at)
                    .map(|(k, _)| k.clone())
                {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                inserted_at: now,
            },
        );
    }
}

impl<C: MerchantClassifier> MerchantClassifier for CachedClassifier<C> {
    fn classify(&self, merchant: &str) -> LedgerResult<MerchantCategory> {
        let key = normalize_merchant(merchant);
        let now = Instant::now();
        if let Some(hit) = self.lookup(&key, now) {
            tracing::trace!(merchant = %key, "classification cache hit");
            return Ok(hit);
        }
        let value = self.inner.classify(merchant)?;
        self.store(key, &value, now);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn keyword(priority: i64, match_type: &str, pattern: &str, primary: &str, sub: &str) -> KeywordRule {
        KeywordRule {
            priority,
            match_type: match_type.to_string(),
            pattern: pattern.to_string(),
            primary_category: primary.to_string(),
            subcategory: sub.to_string(),
            confidence: 0.8,
        }
    }

    fn classifier() -> RuleClassifier {
        RuleClassifier::new(
            vec![SpecialRule {
                merchant: "HI-LO".to_string(),
                category: "Food & Dining".to_string(),
                subcategory: "Groceries & Supermarkets".to_string(),
            }],
            vec![
                keyword(20, "contains", "SUPERMARKET|GROCERY", "Food & Dining", "Groceries & Supermarkets"),
                keyword(10, "prefix", "AMZN", "Shopping & Retail", "Online Retailers"),
                keyword(30, "regex", r"^TOTAL\s+\d+", "Transportation", "Fuel"),
                keyword(40, "exact", "digicel", "Services", "Telecommunications"),
            ],
        )
        .expect("valid rules")
    }

    #[test]
    fn special_rule_beats_keyword_rules() {
        let c = classifier();
        let hit = c.classify("  hi-lo ").expect("classify");
        assert_eq!(hit.subcategory, "Groceries & Supermarkets");
        assert_eq!(hit.confidence, 1.0);
    }

    #[test]
    fn keyword_rules_by_match_type() {
        let c = classifier();
        assert_eq!(
            c.classify("JOHN R WONG SUPERMARKET").expect("contains").primary_category,
            "Food & Dining"
        );
        assert_eq!(
            c.classify("AMZN Mktp US").expect("prefix").subcategory,
            "Online Retailers"
        );
        assert_eq!(c.classify("TOTAL 1234 KGN").expect("regex").subcategory, "Fuel");
        assert_eq!(c.classify("DIGICEL").expect("exact").primary_category, "Services");
        assert_eq!(
            c.classify("DIGICEL TOPUP").expect("not exact"),
            MerchantCategory::uncategorized()
        );
    }

    #[test]
    fn invalid_regex_is_a_classification_error() {
        let err = RuleClassifier::new(vec![], vec![keyword(1, "regex", "(", "Other", "Other")])
            .expect_err("bad regex");
        assert!(matches!(err, LedgerError::Classification(_)));
    }

    struct CountingClassifier {
        calls: Cell<usize>,
    }

    impl MerchantClassifier for CountingClassifier {
        fn classify(&self, _merchant: &str) -> LedgerResult<MerchantCategory> {
            self.calls.set(self.calls.get() + 1);
            Ok(MerchantCategory::uncategorized())
        }
    }

    fn counting() -> CountingClassifier {
        CountingClassifier { calls: Cell::new(0) }
    }

    #[test]
    fn cache_serves_repeats_case_insensitively() {
        let cached = CachedClassifier::new(counting(), &CacheConfig::default());
        cached.classify("PriceSmart").expect("first");
        cached.classify("PRICESMART").expect("second");
        assert_eq!(cached.inner().calls.get(), 1);
        assert_eq!(cached.len(), 1);
    }

    #[test]
    fn cache_respects_max_size_and_ttl() {
        let bounded = CachedClassifier::new(
            counting(),
            &CacheConfig {
                ttl_secs: 3600,
                max_size: 2,
            },
        );
        for merchant in ["A", "B", "C"] {
            bounded.classify(merchant).expect("classify");
        }
        assert_eq!(bounded.len(), 2);

        let expired = CachedClassifier::new(
            counting(),
            &CacheConfig {
                ttl_secs: 0,
                max_size: 10,
            },
        );
        expired.classify("A").expect("first");
        expired.classify("A").expect("second");
        assert_eq!(expired.inner().calls.get(), 2);
    }
}
