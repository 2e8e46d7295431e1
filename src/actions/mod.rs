//! Side-effecting actions keyed on the classified intent.

pub mod executor;

pub use executor::{ActionContext, ActionExecutor, ActionOutcome, ActionResult, effect_key};
