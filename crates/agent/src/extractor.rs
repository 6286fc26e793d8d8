//! Entity extraction
//!
//! Independent strategies run concurrently under a join timeout and their
//! candidates are merged per label by confidence (see [`EntitySet::merge`]).
//! Confirmed entities from the previous turn are carried forward unless the
//! new message overrides their label.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clerk_core::domain::conversation::ConversationState;
use clerk_core::domain::entity::{
    Ambiguity, Entity, EntityLabel, EntitySet, EntitySource, EntityValue,
    MODEL_DEFAULT_CONFIDENCE, PATTERN_CONFIDENCE,
};
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::llm::{CompletionRequest, LlmClient, ProviderError, Purpose};

/// Confidence of approximate prices ("around $75").
pub const APPROXIMATE_PRICE_CONFIDENCE: f64 = 0.7;
/// Largest amount accepted as a price, in cents ($10M).
pub const MAX_AMOUNT_CENTS: i64 = 1_000_000_000;
/// Confidence of a sentiment score when no sentiment words were found.
const NEUTRAL_SENTIMENT_CONFIDENCE: f64 = 0.5;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("malformed extraction output: {0}")]
    Malformed(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StrategyOutput {
    pub entities: Vec<Entity>,
    pub ambiguities: Vec<Ambiguity>,
}

#[async_trait]
pub trait ExtractionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    async fn extract(
        &self,
        message: &str,
        context: &ConversationState,
    ) -> Result<StrategyOutput, StrategyError>;
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub entities: EntitySet,
    pub ambiguities: Vec<Ambiguity>,
    /// Every strategy failed or timed out.
    pub failed: bool,
}

impl ExtractionOutcome {
    pub fn failed() -> Self {
        Self { failed: true, ..Self::default() }
    }
}

pub struct Extractor {
    strategies: Vec<Arc<dyn ExtractionStrategy>>,
    strategy_timeout: Duration,
}

impl Extractor {
    pub fn new(strategies: Vec<Arc<dyn ExtractionStrategy>>, strategy_timeout: Duration) -> Self {
        Self { strategies, strategy_timeout }
    }

    /// Pattern matching plus, when given, the model strategy.
    pub fn standard(llm: Option<Arc<dyn LlmClient>>, strategy_timeout: Duration) -> Self {
        let mut strategies: Vec<Arc<dyn ExtractionStrategy>> = vec![Arc::new(PatternStrategy)];
        if let Some(llm) = llm {
            strategies.push(Arc::new(ModelStrategy::new(llm)));
        }
        Self::new(strategies, strategy_timeout)
    }

    pub async fn extract(&self, message: &str, context: &ConversationState) -> ExtractionOutcome {
        let runs = self.strategies.iter().map(|strategy| async move {
            let outcome =
                tokio::time::timeout(self.strategy_timeout, strategy.extract(message, context))
                    .await;
            (strategy.name(), outcome)
        });

        let mut candidates = Vec::new();
        let mut ambiguities = BTreeSet::new();
        let mut succeeded = 0usize;
        for (name, outcome) in join_all(runs).await {
            match outcome {
                Ok(Ok(output)) => {
                    succeeded += 1;
                    debug!(
                        event_name = "agent.extract.strategy_completed",
                        strategy = name,
                        entities = output.entities.len(),
                        "extraction strategy completed"
                    );
                    candidates.extend(output.entities);
                    ambiguities.extend(
                        output.ambiguities.into_iter().map(|item| (item.label, item.raw_text)),
                    );
                }
                Ok(Err(error)) => warn!(
                    event_name = "agent.extract.strategy_failed",
                    strategy = name,
                    error = %error,
                    "extraction strategy failed"
                ),
                Err(_) => warn!(
                    event_name = "agent.extract.strategy_timed_out",
                    strategy = name,
                    timeout_ms = self.strategy_timeout.as_millis() as u64,
                    "extraction strategy timed out; late result discarded"
                ),
            }
        }

        if succeeded == 0 {
            return ExtractionOutcome::failed();
        }

        let merged = EntitySet::merge(candidates);
        let ambiguities: Vec<Ambiguity> = ambiguities
            .into_iter()
            .filter(|(label, _)| !merged.contains(*label))
            .map(|(label, raw_text)| Ambiguity { label, raw_text })
            .collect();
        let entities = carry_forward(context.last_entities(), merged, &ambiguities);

        ExtractionOutcome { entities, ambiguities, failed: false }
    }
}

/// Adds confirmed entities from the previous turn whose label the new turn
/// does not mention. A carried bound that contradicts a new bound is dropped.
pub fn carry_forward(
    previous: Option<&EntitySet>,
    current: EntitySet,
    ambiguities: &[Ambiguity],
) -> EntitySet {
    let Some(previous) = previous else {
        return current;
    };

    let overridden = |label: EntityLabel| {
        current.contains(label) || ambiguities.iter().any(|item| item.label == label)
    };
    let carried: Vec<Entity> = previous
        .iter()
        .filter(|entity| entity.label.carries_forward() && entity.is_confirmed())
        .filter(|entity| !overridden(entity.label))
        .filter(|entity| match entity.label {
            EntityLabel::PriceMin => current
                .cents(EntityLabel::PriceMax)
                .zip(entity.normalized_value.as_cents())
                .map_or(true, |(max, min)| min <= max),
            EntityLabel::PriceMax => current
                .cents(EntityLabel::PriceMin)
                .zip(entity.normalized_value.as_cents())
                .map_or(true, |(min, max)| min <= max),
            _ => true,
        })
        .map(|entity| entity.clone().carried())
        .collect();

    if carried.is_empty() {
        return current;
    }
    EntitySet::merge(current.into_vec().into_iter().chain(carried))
}

/// Parses a money phrase into cents. Accepts `$`, thousands separators,
/// up to two decimals, a `k` suffix and trailing currency words; anything
/// else left over, or an amount above [`MAX_AMOUNT_CENTS`], rejects it.
pub fn parse_amount_cents(raw: &str) -> Option<i64> {
    let mut text = raw.trim().to_ascii_lowercase();
    for suffix in ["dollars", "dollar", "bucks", "usd"] {
        if let Some(stripped) = text.strip_suffix(suffix) {
            text = stripped.trim_end().to_string();
            break;
        }
    }
    let text = text.trim_start_matches('$').trim();
    let (text, multiplier) = match text.strip_suffix('k') {
        Some(stripped) => (stripped.trim_end(), 1_000),
        None => (text, 1),
    };
    let digits: String = text.chars().filter(|ch| *ch != ',').collect();
    if digits.is_empty() {
        return None;
    }

    let (whole, fraction) = match digits.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (digits.as_str(), ""),
    };
    if whole.is_empty()
        || !whole.chars().all(|ch| ch.is_ascii_digit())
        || fraction.len() > 2
        || !fraction.chars().all(|ch| ch.is_ascii_digit())
    {
        return None;
    }

    let whole: i64 = whole.parse().ok()?;
    let fraction: i64 = if fraction.is_empty() { 0 } else { format!("{fraction:0<2}").parse().ok()? };
    whole
        .checked_mul(100)?
        .checked_add(fraction)?
        .checked_mul(multiplier)
        .filter(|cents| *cents <= MAX_AMOUNT_CENTS)
}

const AMOUNT: &str = r"(\$\s?\d[\d,]*(?:\.\d{1,2})?(?:k\b)?|\d[\d,]*(?:\.\d{1,2})?(?:k\b)?(?:\s?(?:dollars|dollar|bucks|usd)\b)?)";

static RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:between|from)\s+{AMOUNT}\s*(?:and|to|-)\s*{AMOUNT}"))
        .expect("valid range regex")
});
static DASH_RANGE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\$\s?\d[\d,]*(?:\.\d{1,2})?(?:k\b)?)\s*(?:-|to)\s*(\$?\s?\d[\d,]*(?:\.\d{1,2})?(?:k\b)?)")
        .expect("valid dash range regex")
});
static MAX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:under|below|less\s+than|cheaper\s+than|up\s+to|no\s+more\s+than|at\s+most|max(?:imum)?)\s+{AMOUNT}"
    ))
    .expect("valid max price regex")
});
static MIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:over|above|more\s+than|at\s+least|min(?:imum)?|starting\s+at)\s+{AMOUNT}"
    ))
    .expect("valid min price regex")
});
static AROUND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:around|about|approximately|roughly|close\s+to)\s+{AMOUNT}"
    ))
    .expect("valid approximate price regex")
});
static EXACT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:exactly|just)\s+(\$\s?\d[\d,]*(?:\.\d{1,2})?(?:k\b)?)")
        .expect("valid exact price regex")
});
static VAGUE_PRICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(under|below|less\s+than|over|above|more\s+than|around|about)\s+(?:a\s+)?([a-z]+(?:[\s-][a-z]+)?)\s+(?:dollars|bucks)\b",
    )
    .expect("valid vague price regex")
});
static UNIT_AFTER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(?:%|percent|days?|weeks?|months?|years?|hours?|minutes?|items?|pieces?|pounds?|lbs?|kg|inch(?:es)?|gb|tb|mp|mm)\b")
        .expect("valid unit regex")
});
static BRAND_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(sony|apple|samsung|nike|adidas|lg|microsoft|dell|hp|canon|nikon|asus|lenovo|razer|logitech|bose)\b")
        .expect("valid brand regex")
});
static CATEGORY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(headphones?|laptops?|cameras?|watch(?:es)?|shoes?|shirts?|electronics|gaming|office|fitness|smartphones?|tablets?)\b")
        .expect("valid category regex")
});
static PRODUCT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(headphones?|earbuds?|headsets?|laptops?|notebooks?|cameras?|smartwatch(?:es)?|watch(?:es)?|sneakers?|shoes?|t-shirts?|shirts?|smartphones?|phones?|tablets?|speakers?|keyboards?|mouse|mice|monitors?|tvs?|televisions?|jackets?|backpacks?)\b")
        .expect("valid product regex")
});
static ORDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(ORD-\d{3,})\b|#\s?(\d{3,})\b|\border\s+(?:number\s+|no\.?\s*|num\s+|id\s+)?#?\s?(\d{3,})\b")
        .expect("valid order regex")
});
static COLOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(red|blue|black|white|green|yellow|pink|purple|orange|brown|gray|grey|silver)\b")
        .expect("valid color regex")
});
static SIZE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(xxl|xl|xs|small|medium|large)\b").expect("valid size regex")
});
static WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[a-z']+").expect("valid word regex"));

const BRANDS: &[(&str, &str)] = &[
    ("sony", "Sony"),
    ("apple", "Apple"),
    ("samsung", "Samsung"),
    ("nike", "Nike"),
    ("adidas", "Adidas"),
    ("lg", "LG"),
    ("microsoft", "Microsoft"),
    ("dell", "Dell"),
    ("hp", "HP"),
    ("canon", "Canon"),
    ("nikon", "Nikon"),
    ("asus", "Asus"),
    ("lenovo", "Lenovo"),
    ("razer", "Razer"),
    ("logitech", "Logitech"),
    ("bose", "Bose"),
];

const POSITIVE_WORDS: &[&str] = &[
    "great", "love", "thanks", "thank", "awesome", "perfect", "excellent", "happy", "good",
    "amazing", "helpful", "nice", "wonderful", "appreciate",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "hate", "worst", "useless", "angry", "broken", "disappointed",
    "disappointing", "poor", "horrible", "wrong", "upset", "damaged", "late", "missing",
];
const FRUSTRATION_WORDS: &[&str] = &[
    "ridiculous", "frustrated", "frustrating", "annoyed", "annoying", "unacceptable", "again",
    "seriously", "waste",
];
const NEGATORS: &[&str] = &["not", "never", "no", "don't", "isn't", "wasn't", "didn't"];

/// Canonical spelling of a known brand.
pub fn canonical_brand(raw: &str) -> Option<&'static str> {
    let lowered = raw.trim().to_ascii_lowercase();
    BRANDS.iter().find(|(key, _)| *key == lowered).map(|(_, canonical)| *canonical)
}

fn canonical_category(raw: &str) -> String {
    let lowered = raw.to_ascii_lowercase();
    match lowered.as_str() {
        "headphone" | "laptop" | "camera" | "shoe" | "shirt" | "smartphone" | "tablet" => {
            format!("{lowered}s")
        }
        "watch" => "watches".to_string(),
        _ => lowered,
    }
}

/// Keyword sentiment in [-1, 1]; `None` when no sentiment words occur.
pub fn score_sentiment(message: &str) -> Option<(f64, Vec<String>)> {
    let lowered = message.to_ascii_lowercase();
    let words: Vec<&str> = WORD_RE.find_iter(&lowered).map(|word| word.as_str()).collect();

    let (mut positive, mut negative) = (0.0_f64, 0.0_f64);
    let mut hits = Vec::new();
    for (index, word) in words.iter().enumerate() {
        let negated = index > 0 && NEGATORS.contains(&words[index - 1]);
        if POSITIVE_WORDS.contains(word) {
            if negated {
                negative += 1.0;
            } else {
                positive += 1.0;
            }
            hits.push((*word).to_string());
        } else if NEGATIVE_WORDS.contains(word) {
            negative += 1.0;
            hits.push((*word).to_string());
        } else if FRUSTRATION_WORDS.contains(word) {
            negative += 1.5;
            hits.push((*word).to_string());
        }
    }
    if lowered.contains("fed up") || lowered.contains("still waiting") {
        negative += 1.5;
        hits.push("fed up/still waiting".to_string());
    }

    let total = positive + negative;
    if total == 0.0 {
        return None;
    }
    let score = (positive - negative) / total.max(2.0);
    Some((score.clamp(-1.0, 1.0), hits))
}

/// Deterministic lexicon and regular-expression rules.
#[derive(Clone, Copy, Debug, Default)]
pub struct PatternStrategy;

impl PatternStrategy {
    pub fn run(&self, message: &str) -> StrategyOutput {
        let mut output = StrategyOutput::default();
        extract_prices(message, &mut output);

        if let Some(found) = BRAND_RE.find(message) {
            if let Some(brand) = canonical_brand(found.as_str()) {
                output.entities.push(pattern_entity(
                    EntityLabel::Brand,
                    found.as_str(),
                    EntityValue::Text(brand.to_string()),
                ));
            }
        }
        if let Some(found) = CATEGORY_RE.find(message) {
            output.entities.push(pattern_entity(
                EntityLabel::Category,
                found.as_str(),
                EntityValue::Text(canonical_category(found.as_str())),
            ));
        }

        let mut terms: Vec<String> = Vec::new();
        for found in PRODUCT_RE.find_iter(message) {
            let term = found.as_str().to_ascii_lowercase();
            if !terms.contains(&term) {
                terms.push(term);
            }
        }
        if !terms.is_empty() {
            let joined = terms.join(" ");
            output.entities.push(pattern_entity(
                EntityLabel::ProductTerm,
                joined.clone(),
                EntityValue::Text(joined),
            ));
        }

        if let Some(captures) = ORDER_RE.captures(message) {
            let order_id = (1..=3)
                .find_map(|group| captures.get(group))
                .map(|found| found.as_str().to_ascii_uppercase());
            if let (Some(order_id), Some(whole)) = (order_id, captures.get(0)) {
                output.entities.push(pattern_entity(
                    EntityLabel::OrderId,
                    whole.as_str(),
                    EntityValue::Text(order_id),
                ));
            }
        }

        if let Some(found) = COLOR_RE.find(message) {
            let color = found.as_str().to_ascii_lowercase().replace("grey", "gray");
            output.entities.push(pattern_entity(
                EntityLabel::Color,
                found.as_str(),
                EntityValue::Text(color),
            ));
        }
        if let Some(found) = SIZE_RE.find(message) {
            output.entities.push(pattern_entity(
                EntityLabel::Size,
                found.as_str(),
                EntityValue::Text(found.as_str().to_ascii_lowercase()),
            ));
        }

        let sentiment = match score_sentiment(message) {
            Some((score, hits)) => Entity::new(
                EntityLabel::SentimentHint,
                hits.join(" "),
                EntityValue::Score(score),
                EntitySource::Pattern,
                PATTERN_CONFIDENCE,
            ),
            None => Entity::new(
                EntityLabel::SentimentHint,
                "",
                EntityValue::Score(0.0),
                EntitySource::Pattern,
                NEUTRAL_SENTIMENT_CONFIDENCE,
            ),
        };
        output.entities.push(sentiment);

        output
    }
}

#[async_trait]
impl ExtractionStrategy for PatternStrategy {
    fn name(&self) -> &'static str {
        "pattern"
    }

    async fn extract(
        &self,
        message: &str,
        _context: &ConversationState,
    ) -> Result<StrategyOutput, StrategyError> {
        Ok(self.run(message))
    }
}

fn pattern_entity(label: EntityLabel, raw: impl Into<String>, value: EntityValue) -> Entity {
    Entity::new(label, raw, value, EntitySource::Pattern, PATTERN_CONFIDENCE)
}

fn price_entity(label: EntityLabel, raw: &str, cents: i64, confidence: f64) -> Entity {
    Entity::new(label, raw, EntityValue::Cents(cents), EntitySource::Pattern, confidence)
}

/// `cents * numerator / 10`, or `None` on overflow.
fn scaled(cents: i64, numerator: i64) -> Option<i64> {
    cents.checked_mul(numerator).map(|value| value / 10)
}

fn overlaps(spans: &[(usize, usize)], start: usize, end: usize) -> bool {
    spans.iter().any(|(left, right)| start < *right && *left < end)
}

fn is_unit_amount(message: &str, captures: &Captures<'_>, group: usize) -> bool {
    let Some(amount) = captures.get(group) else {
        return false;
    };
    let has_currency = {
        let text = amount.as_str().to_ascii_lowercase();
        text.contains('$') || text.ends_with("dollars") || text.ends_with("bucks")
    };
    !has_currency && UNIT_AFTER_RE.is_match(&message[amount.end()..])
}

#[derive(Clone, Copy)]
enum Bound {
    Max,
    Min,
    Around,
    Exact,
}

fn extract_prices(message: &str, output: &mut StrategyOutput) {
    let mut spans: Vec<(usize, usize)> = Vec::new();
    let mut next_range = 0u32;

    // A range yields both bounds from one match.
    for regex in [&*RANGE_RE, &*DASH_RANGE_RE] {
        for captures in regex.captures_iter(message) {
            let Some(whole) = captures.get(0) else { continue };
            if overlaps(&spans, whole.start(), whole.end()) {
                continue;
            }
            let low = captures.get(1).and_then(|found| parse_amount_cents(found.as_str()));
            let high = captures.get(2).and_then(|found| parse_amount_cents(found.as_str()));
            if let (Some(low), Some(high)) = (low, high) {
                let (low, high) = if low <= high { (low, high) } else { (high, low) };
                output.entities.push(
                    price_entity(EntityLabel::PriceMin, whole.as_str(), low, PATTERN_CONFIDENCE)
                        .in_range(next_range),
                );
                output.entities.push(
                    price_entity(EntityLabel::PriceMax, whole.as_str(), high, PATTERN_CONFIDENCE)
                        .in_range(next_range),
                );
                next_range += 1;
                spans.push((whole.start(), whole.end()));
            }
        }
    }

    let single: [(&Regex, Bound); 4] = [
        (&*MAX_RE, Bound::Max),
        (&*MIN_RE, Bound::Min),
        (&*AROUND_RE, Bound::Around),
        (&*EXACT_RE, Bound::Exact),
    ];
    for (regex, bound) in single {
        for captures in regex.captures_iter(message) {
            let Some(whole) = captures.get(0) else { continue };
            if overlaps(&spans, whole.start(), whole.end()) || is_unit_amount(message, &captures, 1) {
                continue;
            }
            let Some(cents) = captures.get(1).and_then(|found| parse_amount_cents(found.as_str()))
            else {
                continue;
            };
            let bounds = match bound {
                Bound::Max => vec![(EntityLabel::PriceMax, cents, PATTERN_CONFIDENCE)],
                Bound::Min => vec![(EntityLabel::PriceMin, cents, PATTERN_CONFIDENCE)],
                Bound::Around => {
                    let (Some(low), Some(high)) = (scaled(cents, 9), scaled(cents, 11)) else {
                        continue;
                    };
                    vec![
                        (EntityLabel::PriceMin, low, APPROXIMATE_PRICE_CONFIDENCE),
                        (EntityLabel::PriceMax, high, APPROXIMATE_PRICE_CONFIDENCE),
                    ]
                }
                Bound::Exact => vec![
                    (EntityLabel::PriceMin, cents, PATTERN_CONFIDENCE),
                    (EntityLabel::PriceMax, cents, PATTERN_CONFIDENCE),
                ],
            };
            spans.push((whole.start(), whole.end()));

            let paired = bounds.len() == 2;
            for (label, value, confidence) in bounds {
                let entity = price_entity(label, whole.as_str(), value, confidence);
                output.entities.push(if paired { entity.in_range(next_range) } else { entity });
            }
            if paired {
                next_range += 1;
            }
        }
    }

    for captures in VAGUE_PRICE_RE.captures_iter(message) {
        let Some(whole) = captures.get(0) else { continue };
        if overlaps(&spans, whole.start(), whole.end()) {
            continue;
        }
        let keyword = captures.get(1).map(|found| found.as_str().to_ascii_lowercase());
        let label = match keyword.as_deref() {
            Some("over" | "above") => EntityLabel::PriceMin,
            Some(keyword) if keyword.starts_with("more") => EntityLabel::PriceMin,
            _ => EntityLabel::PriceMax,
        };
        output.ambiguities.push(Ambiguity { label, raw_text: whole.as_str().to_string() });
    }
}

/// Structured-output completion asking the model for entities.
pub struct ModelStrategy {
    llm: Arc<dyn LlmClient>,
}

impl ModelStrategy {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    fn schema() -> Value {
        let labels: Vec<&str> = EntityLabel::ALL.iter().map(EntityLabel::as_str).collect();
        json!({
            "type": "object",
            "required": ["entities"],
            "properties": {
                "entities": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["label", "value"],
                        "properties": {
                            "label": {"type": "string", "enum": labels},
                            "value": {"type": ["string", "number"]},
                            "raw_text": {"type": "string"},
                            "confidence": {"type": "number", "minimum": 0, "maximum": 1},
                        },
                    },
                },
            },
        })
    }
}

#[async_trait]
impl ExtractionStrategy for ModelStrategy {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn extract(
        &self,
        message: &str,
        _context: &ConversationState,
    ) -> Result<StrategyOutput, StrategyError> {
        let request = CompletionRequest {
            purpose: Purpose::Extraction,
            system: "You extract shopping entities from one customer message. Prices are \
                     amounts in dollars. SENTIMENT_HINT is a number from -1 (angry) to 1 \
                     (delighted). Only report what the message states."
                .to_string(),
            prompt: format!("Customer message: {message}"),
            schema: Some(Self::schema()),
        };

        let value = self
            .llm
            .complete(request)
            .await?
            .into_structured()
            .map_err(StrategyError::Malformed)?;
        let items = value
            .get("entities")
            .and_then(Value::as_array)
            .ok_or_else(|| StrategyError::Malformed("missing `entities` array".to_string()))?;

        let mut output = StrategyOutput::default();
        for item in items {
            let Some(label) = item.get("label").and_then(Value::as_str).and_then(EntityLabel::parse)
            else {
                continue;
            };
            let Some(value) = item.get("value") else { continue };
            let raw_text = item
                .get("raw_text")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| value_text(value));
            let confidence = item
                .get("confidence")
                .and_then(Value::as_f64)
                .unwrap_or(MODEL_DEFAULT_CONFIDENCE);

            match normalize_model_value(label, value) {
                Some(normalized) => output.entities.push(Entity::new(
                    label,
                    raw_text,
                    normalized,
                    EntitySource::Model,
                    confidence,
                )),
                None => output.ambiguities.push(Ambiguity { label, raw_text }),
            }
        }
        Ok(output)
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn normalize_model_value(label: EntityLabel, value: &Value) -> Option<EntityValue> {
    match label {
        EntityLabel::PriceMin | EntityLabel::PriceMax => {
            let cents = match value {
                Value::Number(number) => number
                    .as_f64()
                    .map(|amount| (amount * 100.0).round())
                    .filter(|cents| {
                        cents.is_finite() && *cents >= 0.0 && *cents <= MAX_AMOUNT_CENTS as f64
                    })
                    .map(|cents| cents as i64),
                Value::String(text) => parse_amount_cents(text),
                _ => None,
            }?;
            Some(EntityValue::Cents(cents))
        }
        EntityLabel::SentimentHint => {
            let score = match value {
                Value::Number(number) => number.as_f64(),
                Value::String(text) => text.trim().parse().ok(),
                _ => None,
            }?;
            score.is_finite().then(|| EntityValue::Score(score.clamp(-1.0, 1.0)))
        }
        EntityLabel::OrderId => {
            let text = value_text(value);
            let id = text.trim().trim_start_matches('#').to_ascii_uppercase();
            (!id.is_empty()).then_some(EntityValue::Text(id))
        }
        EntityLabel::Brand => {
            let text = value_text(value);
            let text = text.trim();
            if text.is_empty() {
                return None;
            }
            Some(EntityValue::Text(
                canonical_brand(text).map_or_else(|| text.to_string(), str::to_string),
            ))
        }
        EntityLabel::Category => {
            let text = value_text(value);
            let text = text.trim();
            (!text.is_empty()).then(|| EntityValue::Text(canonical_category(text)))
        }
        EntityLabel::ProductTerm | EntityLabel::Color | EntityLabel::Size => {
            let text = value_text(value).trim().to_ascii_lowercase();
            (!text.is_empty()).then_some(EntityValue::Text(text))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use clerk_core::domain::conversation::{ConversationId, ConversationState};
    use clerk_core::domain::entity::{Entity, EntityLabel, EntitySet, EntitySource, EntityValue};
    use serde_json::json;

    use super::{
        parse_amount_cents, score_sentiment, ExtractionStrategy, Extractor, PatternStrategy,
        StrategyError, StrategyOutput,
    };
    use crate::llm::{LlmClient, Purpose, ScriptedLlm};

    fn state() -> ConversationState {
        ConversationState::new(ConversationId::new("c-extract"))
    }

    fn patterns(message: &str) -> EntitySet {
        EntitySet::merge(PatternStrategy.run(message).entities)
    }

    struct StalledStrategy;

    #[async_trait]
    impl ExtractionStrategy for StalledStrategy {
        fn name(&self) -> &'static str {
            "stalled"
        }

        async fn extract(
            &self,
            _message: &str,
            _context: &ConversationState,
        ) -> Result<StrategyOutput, StrategyError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(StrategyOutput::default())
        }
    }

    #[test]
    fn amounts_normalize_to_cents() {
        assert_eq!(parse_amount_cents("$100"), Some(10_000));
        assert_eq!(parse_amount_cents("$1,299.99"), Some(129_999));
        assert_eq!(parse_amount_cents("75 dollars"), Some(7_500));
        assert_eq!(parse_amount_cents("1.5k"), Some(150_000));
        assert_eq!(parse_amount_cents("$9.5"), Some(950));
        assert_eq!(parse_amount_cents("fifty"), None);
        assert_eq!(parse_amount_cents("$12abc"), None);
        assert_eq!(parse_amount_cents("$"), None);
        assert_eq!(parse_amount_cents("$10,000,000"), Some(1_000_000_000));
        assert_eq!(parse_amount_cents("$10,000,001"), None);
        assert_eq!(parse_amount_cents("$80000000000000000"), None);
    }

    #[test]
    fn oversized_amounts_yield_no_bounds() {
        for message in ["a car around $80000000000000000", "a yacht under $92233720368547758"] {
            let output = PatternStrategy.run(message);
            assert!(
                output.entities.iter().all(|entity| !entity.label.is_price_bound()),
                "{message}"
            );
        }
    }

    #[test]
    fn headline_query_yields_brand_term_and_price_max() {
        let entities = patterns("Sony headphones under $100");

        assert_eq!(entities.text(EntityLabel::Brand), Some("Sony"));
        assert_eq!(entities.text(EntityLabel::ProductTerm), Some("headphones"));
        assert_eq!(entities.cents(EntityLabel::PriceMax), Some(10_000));
        assert!(!entities.contains(EntityLabel::PriceMin));
    }

    #[test]
    fn range_phrases_yield_exactly_one_pair() {
        for message in [
            "laptops between $500 and $1,000",
            "laptops from 500 to 1000 dollars",
            "laptops $500 - $1000",
            "laptops between $1,000 and $500",
        ] {
            let output = PatternStrategy.run(message);
            let mins = output.entities.iter().filter(|e| e.label == EntityLabel::PriceMin).count();
            let maxes = output.entities.iter().filter(|e| e.label == EntityLabel::PriceMax).count();
            assert_eq!((mins, maxes), (1, 1), "{message}");

            let merged = EntitySet::merge(output.entities);
            assert_eq!(merged.cents(EntityLabel::PriceMin), Some(50_000), "{message}");
            assert_eq!(merged.cents(EntityLabel::PriceMax), Some(100_000), "{message}");
        }
    }

    #[test]
    fn approximate_price_becomes_a_lower_confidence_band() {
        let entities = patterns("a watch around $75");
        let min = entities.get(EntityLabel::PriceMin).expect("min");
        let max = entities.get(EntityLabel::PriceMax).expect("max");

        assert_eq!(min.normalized_value.as_cents(), Some(6_750));
        assert_eq!(max.normalized_value.as_cents(), Some(8_250));
        assert!(min.confidence < 0.8);
    }

    #[test]
    fn quantities_with_units_are_not_prices() {
        let entities = patterns("shoes that ship in under 3 days");
        assert!(!entities.contains(EntityLabel::PriceMax));
    }

    #[test]
    fn spelled_out_prices_are_ambiguous() {
        let output = PatternStrategy.run("headphones under fifty dollars");
        assert!(output.entities.iter().all(|entity| !entity.label.is_price_bound()));
        assert_eq!(output.ambiguities.len(), 1);
        assert_eq!(output.ambiguities[0].label, EntityLabel::PriceMax);
    }

    #[test]
    fn order_ids_are_recognised() {
        assert_eq!(patterns("where is order #1001?").text(EntityLabel::OrderId), Some("1001"));
        assert_eq!(
            patterns("status of order number 12345").text(EntityLabel::OrderId),
            Some("12345")
        );
        assert_eq!(patterns("my ord-20001 is late").text(EntityLabel::OrderId), Some("ORD-20001"));
    }

    #[test]
    fn sentiment_is_scored_from_keywords() {
        let (angry, _) = score_sentiment("This is ridiculous, terrible service").expect("angry");
        assert!(angry < -0.3);
        let (happy, _) = score_sentiment("thanks, that was really helpful").expect("happy");
        assert!(happy > 0.3);
        let (negated, _) = score_sentiment("that is not good").expect("negated");
        assert!(negated < 0.0);
        assert!(score_sentiment("show me laptops").is_none());
    }

    #[tokio::test]
    async fn extraction_is_idempotent() {
        let extractor = Extractor::standard(None, Duration::from_millis(500));
        let context = state();
        let first = extractor.extract("Sony headphones between $50 and $100", &context).await;
        let second = extractor.extract("Sony headphones between $50 and $100", &context).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn model_candidates_merge_by_confidence() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_json(
            Purpose::Extraction,
            json!({"entities": [
                {"label": "PRICE_MAX", "value": "$80", "raw_text": "under $100", "confidence": 0.5},
                {"label": "COLOR", "value": "Black", "confidence": 0.85},
                {"label": "NOT_A_LABEL", "value": "x"}
            ]}),
        );
        let llm: Arc<dyn LlmClient> = llm;
        let extractor = Extractor::standard(Some(llm), Duration::from_millis(500));

        let outcome = extractor.extract("Sony headphones under $100", &state()).await;

        assert_eq!(outcome.entities.cents(EntityLabel::PriceMax), Some(10_000));
        let color = outcome.entities.get(EntityLabel::Color).expect("model color");
        assert_eq!(color.source, EntitySource::Model);
        assert_eq!(color.normalized_value.as_text(), Some("black"));
    }

    #[tokio::test]
    async fn model_bound_does_not_split_a_range() {
        let llm = Arc::new(ScriptedLlm::new());
        llm.push_json(
            Purpose::Extraction,
            json!({"entities": [
                {"label": "PRICE_MIN", "value": "$70", "raw_text": "$70", "confidence": 0.95}
            ]}),
        );
        let llm: Arc<dyn LlmClient> = llm;
        let extractor = Extractor::standard(Some(llm), Duration::from_millis(500));

        let outcome = extractor.extract("headphones between $50 and $100", &state()).await;

        let min = outcome.entities.get(EntityLabel::PriceMin).expect("min");
        let max = outcome.entities.get(EntityLabel::PriceMax).expect("max");
        assert_eq!(min.normalized_value.as_cents(), Some(5_000));
        assert_eq!(max.normalized_value.as_cents(), Some(10_000));
        assert_eq!(min.source, EntitySource::Pattern);
        assert_eq!(min.range, max.range);
    }

    #[test]
    fn approximate_band_survives_a_lone_model_bound() {
        let mut candidates = PatternStrategy.run("a watch around $75").entities;
        candidates.push(Entity::new(
            EntityLabel::PriceMax,
            "$100",
            EntityValue::Cents(10_000),
            EntitySource::Model,
            0.9,
        ));

        let merged = EntitySet::merge(candidates);
        assert_eq!(merged.cents(EntityLabel::PriceMin), Some(6_750));
        assert_eq!(merged.cents(EntityLabel::PriceMax), Some(8_250));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_strategy_does_not_block_fast_ones() {
        let extractor = Extractor::new(
            vec![Arc::new(PatternStrategy), Arc::new(StalledStrategy)],
            Duration::from_millis(200),
        );

        let outcome = extractor.extract("Sony headphones under $100", &state()).await;
        assert!(!outcome.failed);
        assert_eq!(outcome.entities.text(EntityLabel::Brand), Some("Sony"));
    }

    #[tokio::test(start_paused = true)]
    async fn all_strategies_failing_yields_an_empty_failed_outcome() {
        let extractor = Extractor::new(vec![Arc::new(StalledStrategy)], Duration::from_millis(50));
        let outcome = extractor.extract("anything", &state()).await;

        assert!(outcome.failed);
        assert!(outcome.entities.is_empty());
    }

    #[tokio::test]
    async fn confirmed_entities_carry_into_the_next_turn() {
        let extractor = Extractor::standard(None, Duration::from_millis(500));
        let mut context = state();
        context.entity_history.push(patterns("Sony headphones under $100"));

        let outcome = extractor.extract("what about in black?", &context).await;
        let brand = outcome.entities.get(EntityLabel::Brand).expect("carried brand");
        assert!(brand.carried_over);
        assert_eq!(outcome.entities.cents(EntityLabel::PriceMax), Some(10_000));
        assert_eq!(outcome.entities.text(EntityLabel::Color), Some("black"));

        let overridden = extractor.extract("actually under $60", &context).await;
        assert_eq!(overridden.entities.cents(EntityLabel::PriceMax), Some(6_000));
        assert!(!overridden.entities.get(EntityLabel::PriceMax).expect("max").carried_over);
    }

    #[tokio::test]
    async fn contradicting_carried_bound_is_dropped() {
        let extractor = Extractor::standard(None, Duration::from_millis(500));
        let mut context = state();
        context.entity_history.push(patterns("laptops over $800"));

        let outcome = extractor.extract("show me ones under $500", &context).await;
        assert_eq!(outcome.entities.cents(EntityLabel::PriceMax), Some(50_000));
        assert!(!outcome.entities.contains(EntityLabel::PriceMin));
    }
}
