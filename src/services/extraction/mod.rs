// Nutrient extraction: recognized label text -> structured per-100g record
//
// Semantic parsing is delegated to a chat-completion service; this module
// owns the prompt, unwraps and leniently parses the reply, and caches results
// by text.

pub mod api_client;
pub mod cache;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::core::config::ExtractionConfig;
use crate::core::errors::{ExtractionResult, StartupError};
use crate::core::types::{Grade, NutrientRecord, NUTRIENT_FIELDS};
use crate::utils::Metrics;

pub use api_client::{CompletionBackend, OpenAiChatClient};
pub use cache::ExtractionCache;

pub const SYSTEM_PROMPT: &str = "You are an expert in nutritional data extraction.";

static JSON_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("valid fence regex"));

/// Build the extraction prompt for one block of recognized text
pub fn build_prompt(text: &str) -> String {
    format!(
        r#"Extract the following nutritional information from the text below and structure it as a JSON.
Follow these important rules:

1. Convert all values to per 100g. If you see values per serving, use the serving size to calculate per 100g.
2. Pay careful attention to units (mg vs g):
   - 1g = 1000mg
   - Convert all mg values to g by dividing by 1000
   - Example: 500mg sodium = 0.5g sodium_100g
3. "Total Carbohydrate(s)" or "Total Carb" should be extracted as "carbohydrates_100g"
4. Extract both the original serving size AND the per 100g values

Extract these fields:
- serving_size (text description of serving size, e.g. "1 cup (245g)")
- servings_per_container (number of servings in the package)
- fat_100g (default 0 if missing)
- saturated-fat_100g (default 0 if missing)
- trans-fat_100g (default 0 if missing)
- cholesterol_100g (default 0 if missing, convert from mg)
- sodium_100g (default 0 if missing, convert from mg)
- carbohydrates_100g (default 0 if missing, this is "Total Carbohydrate")
- fiber_100g (default 0 if missing)
- sugars_100g (default 0 if missing)
- proteins_100g (default 0 if missing)
- nutri_score (default 0 if missing)

Return only the JSON object.

Text: "{}""#,
        text
    )
}

/// Strip an optional fenced code block around the JSON object
pub fn strip_code_fence(raw: &str) -> &str {
    JSON_FENCE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| raw.trim(), |m| m.as_str())
}

/// Read a quantity in grams from a loosely typed JSON value
///
/// Accepts numbers, numeric strings and strings with a `g`/`mg` unit
/// ("0.5", "12 g", "<1g", "160mg", "2,5 g"). Milligrams become grams.
/// Anything unreadable, null, negative or non-finite is 0.
pub fn lenient_grams(value: &Value) -> f64 {
    let grams = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => parse_quantity(s).unwrap_or(0.0),
        _ => 0.0,
    };
    if grams.is_finite() && grams > 0.0 {
        grams
    } else {
        0.0
    }
}

fn parse_quantity(raw: &str) -> Option<f64> {
    let s = raw
        .trim()
        .trim_start_matches(['<', '>', '~', '≈'])
        .trim()
        .to_ascii_lowercase()
        .replace(',', ".");

    let (number, divisor) = if let Some(n) = s.strip_suffix("mg") {
        (n, 1000.0)
    } else if let Some(n) = s.strip_suffix('g') {
        (n, 1.0)
    } else {
        (s.as_str(), 1.0)
    };

    number.trim().parse::<f64>().ok().map(|v| v / divisor)
}

fn lookup<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    object
        .get(field)
        .or_else(|| object.get(&field.replace('-', "_")))
}

/// Build a total record from a parsed reply object
///
/// Every nutrient field is filled (0 when missing). `nutri_score` is kept
/// only when it is a grade letter; the usual `0` placeholder means none.
pub fn record_from_object(object: &Map<String, Value>) -> NutrientRecord {
    let mut record = NutrientRecord::default();

    for field in NUTRIENT_FIELDS {
        let grams = lookup(object, field).map_or(0.0, lenient_grams);
        if let Some(slot) = record.field_mut(field) {
            *slot = grams;
        }
    }

    record.serving_size = match object.get("serving_size") {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    };

    record.servings_per_container = object
        .get("servings_per_container")
        .map(|v| match v {
            Value::String(s) => parse_quantity(s).unwrap_or(0.0),
            other => lenient_grams(other),
        })
        .filter(|n| n.is_finite() && *n > 0.0);

    record.nutri_score = match object.get("nutri_score") {
        Some(Value::String(s)) => s.parse::<Grade>().ok(),
        _ => None,
    };
    record.nutri_score_predicted = false;

    record
}

/// Parse a raw service reply into a record
pub fn parse_reply(raw: &str) -> ExtractionResult<NutrientRecord> {
    let json = strip_code_fence(raw);
    let object: Map<String, Value> = serde_json::from_str(json)?;
    Ok(record_from_object(&object))
}

/// Turns recognized text into a `NutrientRecord`
pub struct NutrientExtractor {
    backend: Arc<dyn CompletionBackend>,
    cache: Option<ExtractionCache>,
}

impl NutrientExtractor {
    pub fn new(backend: Arc<dyn CompletionBackend>, cache: Option<ExtractionCache>) -> Self {
        Self { backend, cache }
    }

    /// OpenAI-compatible backend plus LRU cache, from configuration
    pub fn from_config(config: &ExtractionConfig, metrics: Metrics) -> Result<Self, StartupError> {
        let client = OpenAiChatClient::new(config, None, Some(metrics.clone()))?;
        let cache = ExtractionCache::new(config.cache_capacity, Some(metrics));
        Ok(Self::new(Arc::new(client), Some(cache)))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Extract a record from recognized text
    ///
    /// Fails when the service call fails or times out, or when its reply is
    /// not a JSON object after unwrapping.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn extract(&self, text: &str) -> ExtractionResult<NutrientRecord> {
        let key = ExtractionCache::key_for(text);
        if let Some(record) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            debug!("Extraction cache hit");
            return Ok(record);
        }

        let reply = self.backend.complete(SYSTEM_PROMPT, &build_prompt(text)).await?;
        let record = parse_reply(&reply)?;
        debug!(
            "Extracted record: fat={} sodium={} carbs={} grade={:?}",
            record.fat_100g, record.sodium_100g, record.carbohydrates_100g, record.nutri_score
        );

        if let Some(ref cache) = self.cache {
            cache.put(key, &record);
        }
        Ok(record)
    }
}
