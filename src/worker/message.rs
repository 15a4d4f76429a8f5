//! Message templates for submitted actions.

use rand::Rng;
use rand::seq::SliceRandom;

/// Placeholder replaced by the global sequence number.
pub const SEQ_PLACEHOLDER: &str = "{seq}";
/// Placeholder replaced by the per-session action counter.
pub const SESSION_PLACEHOLDER: &str = "{session}";

/// A non-empty pool of templates.
#[derive(Debug, Clone)]
pub struct MessagePool {
    templates: Vec<String>,
}

impl MessagePool {
    /// Returns `None` for an empty pool.
    pub fn new(templates: Vec<String>) -> Option<Self> {
        if templates.is_empty() {
            None
        } else {
            Some(Self { templates })
        }
    }

    /// Render a uniformly chosen template.
    pub fn render<R: Rng + ?Sized>(&self, seq: u64, session: u32, rng: &mut R) -> String {
        let template = self
            .templates
            .choose(rng)
            .map(String::as_str)
            .unwrap_or_default();
        template
            .replace(SEQ_PLACEHOLDER, &seq.to_string())
            .replace(SESSION_PLACEHOLDER, &session.to_string())
    }
}
