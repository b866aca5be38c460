//! Static per-model price and limit tables.
//!
//! Rates are USD per 1,000,000 tokens. Unknown model names fall back to the
//! table's default model so cost accounting never silently drops to zero.

// ---------------------------------------------------------------------------
// ModelSpec / PriceTable
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub name: &'static str,
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub context_window: u32,
    pub max_output_tokens: u32,
}

pub struct PriceTable {
    models: &'static [ModelSpec],
    default_model: &'static str,
}

impl PriceTable {
    pub fn find(&self, model: &str) -> Option<&ModelSpec> {
        self.models.iter().find(|m| m.name == model)
    }

    /// Spec for `model`, falling back to the table's default model.
    pub fn lookup(&self, model: &str) -> &ModelSpec {
        self.find(model)
            .or_else(|| self.find(self.default_model))
            .unwrap_or(&self.models[0])
    }

    /// Pure cost function over the static rate table.
    pub fn cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let spec = self.lookup(model);
        (input_tokens as f64 * spec.input_per_million
            + output_tokens as f64 * spec.output_per_million)
            / 1_000_000.0
    }

    pub fn default_model(&self) -> &'static str {
        self.default_model
    }

    /// Lowest input rate in the table; used by health probes.
    pub fn cheapest_model(&self) -> &'static str {
        self.models
            .iter()
            .min_by(|a, b| {
                a.input_per_million
                    .partial_cmp(&b.input_per_million)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|m| m.name)
            .unwrap_or(self.default_model)
    }

    pub fn model_names(&self) -> Vec<String> {
        self.models.iter().map(|m| m.name.to_string()).collect()
    }
}

// ---------------------------------------------------------------------------
// Provider tables
// ---------------------------------------------------------------------------

pub static OPENAI_PRICES: PriceTable = PriceTable {
    models: &[
        ModelSpec {
            name: "gpt-4o",
            input_per_million: 2.50,
            output_per_million: 10.00,
            context_window: 128_000,
            max_output_tokens: 16_384,
        },
        ModelSpec {
            name: "gpt-4o-mini",
            input_per_million: 0.15,
            output_per_million: 0.60,
            context_window: 128_000,
            max_output_tokens: 16_384,
        },
        ModelSpec {
            name: "gpt-4.1",
            input_per_million: 2.00,
            output_per_million: 8.00,
            context_window: 1_047_576,
            max_output_tokens: 32_768,
        },
        ModelSpec {
            name: "gpt-3.5-turbo",
            input_per_million: 0.50,
            output_per_million: 1.50,
            context_window: 16_385,
            max_output_tokens: 4_096,
        },
    ],
    default_model: "gpt-4o-mini",
};

pub static ANTHROPIC_PRICES: PriceTable = PriceTable {
    models: &[
        ModelSpec {
            name: "claude-sonnet-4-5",
            input_per_million: 3.00,
            output_per_million: 15.00,
            context_window: 200_000,
            max_output_tokens: 64_000,
        },
        ModelSpec {
            name: "claude-haiku-4-5",
            input_per_million: 1.00,
            output_per_million: 5.00,
            context_window: 200_000,
            max_output_tokens: 64_000,
        },
        ModelSpec {
            name: "claude-opus-4-1",
            input_per_million: 15.00,
            output_per_million: 75.00,
            context_window: 200_000,
            max_output_tokens: 32_000,
        },
    ],
    default_model: "claude-sonnet-4-5",
};

pub static GEMINI_PRICES: PriceTable = PriceTable {
    models: &[
        ModelSpec {
            name: "gemini-2.5-pro",
            input_per_million: 1.25,
            output_per_million: 10.00,
            context_window: 1_048_576,
            max_output_tokens: 65_536,
        },
        ModelSpec {
            name: "gemini-2.5-flash",
            input_per_million: 0.30,
            output_per_million: 2.50,
            context_window: 1_048_576,
            max_output_tokens: 65_536,
        },
        ModelSpec {
            name: "gemini-2.5-flash-lite",
            input_per_million: 0.10,
            output_per_million: 0.40,
            context_window: 1_048_576,
            max_output_tokens: 65_536,
        },
    ],
    default_model: "gemini-2.5-flash",
};

pub static OPENROUTER_PRICES: PriceTable = PriceTable {
    models: &[
        ModelSpec {
            name: "openai/gpt-4o-mini",
            input_per_million: 0.15,
            output_per_million: 0.60,
            context_window: 128_000,
            max_output_tokens: 16_384,
        },
        ModelSpec {
            name: "anthropic/claude-sonnet-4.5",
            input_per_million: 3.00,
            output_per_million: 15.00,
            context_window: 200_000,
            max_output_tokens: 64_000,
        },
        ModelSpec {
            name: "deepseek/deepseek-chat",
            input_per_million: 0.27,
            output_per_million: 1.10,
            context_window: 65_536,
            max_output_tokens: 8_192,
        },
        // Free tier routes cost nothing.
        ModelSpec {
            name: "meta-llama/llama-3.1-8b-instruct:free",
            input_per_million: 0.0,
            output_per_million: 0.0,
            context_window: 131_072,
            max_output_tokens: 8_192,
        },
    ],
    default_model: "openai/gpt-4o-mini",
};

// ---------------------------------------------------------------------------
// Token estimation
// ---------------------------------------------------------------------------

/// Heuristic token count for providers that do not report usage: one token
/// per four characters, rounded up. An estimate, not a guaranteed count.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
