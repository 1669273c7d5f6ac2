//! Model routing: a pure mapping from (task type, complexity) to a
//! provider, model, and its pricing.
//!
//! The default table sends asset work to the image provider, simple work
//! to local inference, and everything else to the cloud tier sized by
//! complexity. Routes can be overridden at composition time; the router is
//! immutable afterwards.

use std::collections::HashMap;

use conductor_db::models::{Complexity, TaskType};

/// Per-million-token pricing for a model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
}

impl Pricing {
    /// Cost of a call in account currency.
    pub fn cost(&self, tokens_in: i64, tokens_out: i64) -> f64 {
        (tokens_in as f64 * self.input_per_mtok + tokens_out as f64 * self.output_per_mtok)
            / 1_000_000.0
    }
}

/// A routing decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChoice {
    pub provider_id: String,
    pub model_id: String,
    pub pricing: Pricing,
}

impl ModelChoice {
    fn new(provider_id: &str, model_id: &str, pricing: Pricing) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            pricing,
        }
    }
}

/// Expected token volumes per complexity, used for cost estimation before
/// a task runs.
fn expected_tokens(complexity: Complexity) -> (i64, i64) {
    match complexity {
        Complexity::Simple => (2_000, 500),
        Complexity::Medium => (8_000, 2_000),
        Complexity::Complex => (20_000, 8_000),
    }
}

/// Maps (task type, complexity) to a model choice.
#[derive(Debug, Clone)]
pub struct ModelRouter {
    routes: HashMap<(TaskType, Complexity), ModelChoice>,
    fallback: ModelChoice,
}

impl Default for ModelRouter {
    fn default() -> Self {
        let local = Pricing {
            input_per_mtok: 0.0,
            output_per_mtok: 0.0,
        };
        let small = Pricing {
            input_per_mtok: 0.8,
            output_per_mtok: 4.0,
        };
        let large = Pricing {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        let image = Pricing {
            input_per_mtok: 1.0,
            output_per_mtok: 40.0,
        };

        let mut routes = HashMap::new();
        for task_type in [
            TaskType::Code,
            TaskType::Research,
            TaskType::Analysis,
            TaskType::Asset,
            TaskType::Integration,
            TaskType::Documentation,
        ] {
            for complexity in [Complexity::Simple, Complexity::Medium, Complexity::Complex] {
                let choice = match (task_type, complexity) {
                    (TaskType::Asset, _) => ModelChoice::new("image", "diffusion-xl", image),
                    (_, Complexity::Simple) => ModelChoice::new("local", "local-7b", local),
                    (_, Complexity::Medium) => {
                        ModelChoice::new("cloud", "frontier-small", small)
                    }
                    (_, Complexity::Complex) => {
                        ModelChoice::new("cloud", "frontier-large", large)
                    }
                };
                routes.insert((task_type, complexity), choice);
            }
        }

        Self {
            routes,
            fallback: ModelChoice::new("cloud", "frontier-small", small),
        }
    }
}

impl ModelRouter {
    /// Replace the route for one (task type, complexity) cell.
    pub fn with_route(
        mut self,
        task_type: TaskType,
        complexity: Complexity,
        choice: ModelChoice,
    ) -> Self {
        self.routes.insert((task_type, complexity), choice);
        self
    }

    /// Route a task. Pure: same inputs, same choice.
    pub fn route(&self, task_type: TaskType, complexity: Complexity) -> &ModelChoice {
        self.routes
            .get(&(task_type, complexity))
            .unwrap_or(&self.fallback)
    }

    /// Estimated cost of running a task once, from the routed model's
    /// pricing and the expected token volume for its complexity.
    pub fn estimated_cost(&self, task_type: TaskType, complexity: Complexity) -> f64 {
        let choice = self.route(task_type, complexity);
        let (tokens_in, tokens_out) = expected_tokens(complexity);
        choice.pricing.cost(tokens_in, tokens_out)
    }
}
