use std::time::Duration;

use serde_json::Value;

use crate::errors::HandlerError;
use crate::handlers::HandlerId;

/// The one-shot result of a single invocation; folded into the handler's state
/// right away and never persisted itself.
#[derive(Debug)]
pub struct Outcome {
    pub is_final: bool,
    pub delay: Option<Duration>,
    pub result: Option<Value>,
    pub error: Option<HandlerError>,
    pub subrefs: Vec<HandlerId>,
}

impl Outcome {
    pub fn success(result: Option<Value>) -> Self {
        Self { is_final: true, delay: None, result, error: None, subrefs: Vec::new() }
    }

    pub fn failure(error: HandlerError) -> Self {
        Self { is_final: true, delay: None, result: None, error: Some(error), subrefs: Vec::new() }
    }

    pub fn retry(error: HandlerError, delay: Option<Duration>) -> Self {
        Self { is_final: false, delay, result: None, error: Some(error), subrefs: Vec::new() }
    }

    pub fn with_subrefs(mut self, subrefs: Vec<HandlerId>) -> Self {
        self.subrefs = subrefs;
        self
    }

    pub fn is_success(&self) -> bool {
        self.is_final && self.error.is_none()
    }

    pub fn is_failure(&self) -> bool {
        self.is_final && self.error.is_some()
    }
}
