//! Scripted fallback responses
//!
//! When a model service fails terminally for a turn, the agent still has
//! to say something. Templates are grouped by category; selection within
//! a category is random. A JSON file can override the defaults.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

/// Fallback template categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FallbackCategory {
    Greeting,
    ErrorGeneric,
    ErrorStt,
    Goodbye,
}

/// Template sets with random in-category selection
pub struct FallbackResponses {
    templates: HashMap<FallbackCategory, Vec<String>>,
}

impl FallbackResponses {
    pub fn new() -> Self {
        let mut templates = HashMap::new();
        templates.insert(
            FallbackCategory::Greeting,
            vec![
                "Hello, thank you for calling. How can I assist you?".to_string(),
                "Hi there! How can I help you today?".to_string(),
            ],
        );
        templates.insert(
            FallbackCategory::ErrorGeneric,
            vec![
                "I'm sorry, I'm having some technical difficulties. Please call back later."
                    .to_string(),
                "It seems I'm unable to process your request at the moment. Please try again \
                 shortly."
                    .to_string(),
            ],
        );
        templates.insert(
            FallbackCategory::ErrorStt,
            vec![
                "I'm sorry, I didn't catch that. Could you please repeat yourself?".to_string(),
                "I'm having trouble understanding you. Could you speak a bit more clearly?"
                    .to_string(),
            ],
        );
        templates.insert(
            FallbackCategory::Goodbye,
            vec![
                "Thank you for calling. Goodbye!".to_string(),
                "Have a great day! Goodbye.".to_string(),
            ],
        );
        Self { templates }
    }

    /// Pick a random response from a category
    pub fn pick(&self, category: FallbackCategory) -> Option<String> {
        self.templates
            .get(&category)
            .and_then(|options| options.choose(&mut rand::rng()))
            .cloned()
    }

    /// Every template in a category (for tests and inspection)
    pub fn all(&self, category: FallbackCategory) -> &[String] {
        self.templates
            .get(&category)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Replace the templates from a JSON file of
    /// `{ "CATEGORY": ["text", ...], ... }`
    pub fn load_from_json(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("reading fallback templates {}", path.as_ref().display()))?;
        let templates: HashMap<FallbackCategory, Vec<String>> =
            serde_json::from_str(&contents).context("parsing fallback templates")?;
        Ok(Self { templates })
    }
}

impl Default for FallbackResponses {
    fn default() -> Self {
        Self::new()
    }
}
