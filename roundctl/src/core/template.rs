//! Argument templating for external commands.
//!
//! Commands for the store, the generator and the scheduler job name are
//! configured as lists of `minijinja` templates rendered against the round.

use minijinja::{Environment, UndefinedBehavior, Value, context};

use crate::core::params::RoundParams;

/// Template context describing a round.
pub fn round_context(params: &RoundParams) -> Value {
    context! {
        round => params.round,
        workload => params.workload.as_str(),
        tasks => params.tasks,
        steps => params.steps,
        minutes => params.minutes,
        data_home => params.data_home.display().to_string(),
        port => params.port,
        platform => params.platform.as_str(),
    }
}

/// Render each template in order. Unknown variables are errors.
pub fn render_args(templates: &[String], ctx: &Value) -> Result<Vec<String>, minijinja::Error> {
    let env = strict_env();
    templates
        .iter()
        .map(|template| env.render_str(template, ctx))
        .collect()
}

pub fn render_one(template: &str, ctx: &Value) -> Result<String, minijinja::Error> {
    strict_env().render_str(template, ctx)
}

fn strict_env() -> Environment<'static> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env
}
