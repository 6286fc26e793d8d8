use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Confidence assigned to deterministic pattern matches.
pub const PATTERN_CONFIDENCE: f64 = 0.9;
/// Confidence assumed for model-derived entities that report none.
pub const MODEL_DEFAULT_CONFIDENCE: f64 = 0.6;
/// Entities at or above this confidence are carried into the next turn.
pub const CONFIRMED_CONFIDENCE: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityLabel {
    PriceMin,
    PriceMax,
    Brand,
    Category,
    ProductTerm,
    OrderId,
    Color,
    Size,
    SentimentHint,
}

impl EntityLabel {
    pub const ALL: [EntityLabel; 9] = [
        Self::PriceMin,
        Self::PriceMax,
        Self::Brand,
        Self::Category,
        Self::ProductTerm,
        Self::OrderId,
        Self::Color,
        Self::Size,
        Self::SentimentHint,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PriceMin => "PRICE_MIN",
            Self::PriceMax => "PRICE_MAX",
            Self::Brand => "BRAND",
            Self::Category => "CATEGORY",
            Self::ProductTerm => "PRODUCT_TERM",
            Self::OrderId => "ORDER_ID",
            Self::Color => "COLOR",
            Self::Size => "SIZE",
            Self::SentimentHint => "SENTIMENT_HINT",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "PRICE_MIN" | "MIN_PRICE" => Some(Self::PriceMin),
            "PRICE_MAX" | "MAX_PRICE" => Some(Self::PriceMax),
            "BRAND" => Some(Self::Brand),
            "CATEGORY" => Some(Self::Category),
            "PRODUCT_TERM" | "PRODUCT" => Some(Self::ProductTerm),
            "ORDER_ID" | "ORDER_NUMBER" => Some(Self::OrderId),
            "COLOR" | "COLOUR" => Some(Self::Color),
            "SIZE" => Some(Self::Size),
            "SENTIMENT_HINT" | "SENTIMENT" => Some(Self::SentimentHint),
            _ => None,
        }
    }

    pub fn is_price_bound(&self) -> bool {
        matches!(self, Self::PriceMin | Self::PriceMax)
    }

    /// Sentiment describes a single message and never carries into later turns.
    pub fn carries_forward(&self) -> bool {
        !matches!(self, Self::SentimentHint)
    }
}

impl fmt::Display for EntityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitySource {
    Pattern,
    Model,
    Fallback,
}

impl EntitySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Model => "model",
            Self::Fallback => "fallback",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pattern => 3,
            Self::Model => 2,
            Self::Fallback => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum EntityValue {
    Cents(i64),
    Text(String),
    Score(f64),
}

impl EntityValue {
    pub fn as_cents(&self) -> Option<i64> {
        match self {
            Self::Cents(cents) => Some(*cents),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_score(&self) -> Option<f64> {
        match self {
            Self::Score(score) => Some(*score),
            _ => None,
        }
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Cents(left), Self::Cents(right)) => left.cmp(right),
            (Self::Score(left), Self::Score(right)) => left.total_cmp(right),
            (Self::Text(left), Self::Text(right)) => left.cmp(right),
            _ => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl fmt::Display for EntityValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cents(cents) => {
                let sign = if *cents < 0 { "-" } else { "" };
                let abs = cents.unsigned_abs();
                write!(f, "{sign}${}.{:02}", abs / 100, abs % 100)
            }
            Self::Text(text) => f.write_str(text),
            Self::Score(score) => write!(f, "{score:.2}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub label: EntityLabel,
    pub raw_text: String,
    pub normalized_value: EntityValue,
    pub source: EntitySource,
    pub confidence: f64,
    #[serde(default)]
    pub carried_over: bool,
    /// Shared by the two bounds of one range match; the bounds are merged as a unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<u32>,
}

impl Entity {
    pub fn new(
        label: EntityLabel,
        raw_text: impl Into<String>,
        normalized_value: EntityValue,
        source: EntitySource,
        confidence: f64,
    ) -> Self {
        Self {
            label,
            raw_text: raw_text.into(),
            normalized_value,
            source,
            confidence: clamp_confidence(confidence),
            carried_over: false,
            range: None,
        }
    }

    pub fn carried(mut self) -> Self {
        self.carried_over = true;
        self
    }

    pub fn in_range(mut self, range: u32) -> Self {
        self.range = Some(range);
        self
    }

    pub fn is_confirmed(&self) -> bool {
        self.confidence >= CONFIRMED_CONFIDENCE
    }

    /// Total order used by the merge: higher confidence first, then the more
    /// deterministic source, then the smaller value so ties never depend on
    /// arrival order.
    fn merge_order(&self, other: &Self) -> Ordering {
        other
            .confidence
            .total_cmp(&self.confidence)
            .then_with(|| other.source.rank().cmp(&self.source.rank()))
            .then_with(|| self.normalized_value.cmp_key(&other.normalized_value))
            .then_with(|| self.raw_text.cmp(&other.raw_text))
            .then_with(|| self.carried_over.cmp(&other.carried_over))
            .then_with(|| self.range.cmp(&other.range))
    }
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// A phrase the extractor recognised but could not normalise.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiguity {
    pub label: EntityLabel,
    pub raw_text: String,
}

/// Merged entities for one turn: at most one entity per label, ordered by label.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntitySet(Vec<Entity>);

impl EntitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the best candidate per label. The result does not depend on the
    /// order candidates arrive in.
    ///
    /// Price bounds are special: when any complete range pair is present the
    /// bounds come from the best pair as a unit, so a lone bound from another
    /// strategy can never split a range.
    pub fn merge<I>(candidates: I) -> Self
    where
        I: IntoIterator<Item = Entity>,
    {
        let (bounds, others): (Vec<Entity>, Vec<Entity>) =
            candidates.into_iter().partition(|entity| entity.label.is_price_bound());

        let mut best = best_per_label(others);
        match best_range_pair(&bounds) {
            Some((min, max)) => {
                best.push(min.clone());
                best.push(max.clone());
            }
            None => best.extend(best_per_label(bounds)),
        }
        best.sort_by_key(|entity| entity.label);
        Self(best)
    }

    pub fn get(&self, label: EntityLabel) -> Option<&Entity> {
        self.0.iter().find(|entity| entity.label == label)
    }

    pub fn contains(&self, label: EntityLabel) -> bool {
        self.get(label).is_some()
    }

    pub fn text(&self, label: EntityLabel) -> Option<&str> {
        self.get(label).and_then(|entity| entity.normalized_value.as_text())
    }

    pub fn cents(&self, label: EntityLabel) -> Option<i64> {
        self.get(label).and_then(|entity| entity.normalized_value.as_cents())
    }

    pub fn sentiment(&self) -> Option<f64> {
        self.get(EntityLabel::SentimentHint).and_then(|entity| entity.normalized_value.as_score())
    }

    pub fn remove(&mut self, label: EntityLabel) -> Option<Entity> {
        let index = self.0.iter().position(|entity| entity.label == label)?;
        Some(self.0.remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entities that describe what the customer wants, excluding sentiment.
    pub fn factual(&self) -> impl Iterator<Item = &Entity> {
        self.0.iter().filter(|entity| entity.label != EntityLabel::SentimentHint)
    }

    pub fn mean_confidence(&self) -> Option<f64> {
        let (sum, count) =
            self.factual().fold((0.0, 0usize), |(sum, count), entity| (sum + entity.confidence, count + 1));
        (count > 0).then(|| sum / count as f64)
    }

    pub fn into_vec(self) -> Vec<Entity> {
        self.0
    }
}

fn best_per_label(candidates: Vec<Entity>) -> Vec<Entity> {
    let mut best: Vec<Entity> = Vec::new();
    for candidate in candidates {
        match best.iter_mut().find(|entity| entity.label == candidate.label) {
            Some(current) => {
                if candidate.merge_order(current) == Ordering::Less {
                    *current = candidate;
                }
            }
            None => best.push(candidate),
        }
    }
    best
}

/// Best complete range pair among the price bounds. A pair ranks by its
/// weaker side, then by its minimum under the usual merge order.
fn best_range_pair(bounds: &[Entity]) -> Option<(&Entity, &Entity)> {
    let mut pairs: Vec<(&Entity, &Entity)> = Vec::new();
    for min in bounds.iter().filter(|entity| entity.label == EntityLabel::PriceMin) {
        let Some(range) = min.range else { continue };
        let partner = bounds
            .iter()
            .filter(|entity| {
                entity.label == EntityLabel::PriceMax
                    && entity.range == Some(range)
                    && entity.source == min.source
                    && entity.carried_over == min.carried_over
            })
            .min_by(|left, right| left.merge_order(right));
        if let Some(max) = partner {
            pairs.push((min, max));
        }
    }

    pairs.into_iter().min_by(|(left_min, left_max), (right_min, right_max)| {
        let left = left_min.confidence.min(left_max.confidence);
        let right = right_min.confidence.min(right_max.confidence);
        right
            .total_cmp(&left)
            .then_with(|| left_min.merge_order(right_min))
            .then_with(|| left_max.merge_order(right_max))
    })
}

impl FromIterator<Entity> for EntitySet {
    fn from_iter<T: IntoIterator<Item = Entity>>(iter: T) -> Self {
        Self::merge(iter)
    }
}
