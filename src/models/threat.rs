use std::fmt;

/// What a single chain stage decided about a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    /// No opinion; fall through to the next stage.
    Continue,
    /// Stop and reject the request.
    Reject,
    /// Stop and skip every remaining stage; the request proceeds.
    Pass,
}

/// Final outcome of a whole chain evaluation, handed to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Forward to the real backend.
    Pass,
    /// Forward to the backend through the status-code observer.
    PassToOverride,
    /// Answer with 403 and no body.
    Reject,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "pass"),
            Outcome::PassToOverride => write!(f, "pass-to-override"),
            Outcome::Reject => write!(f, "reject"),
        }
    }
}

impl Outcome {
    pub fn is_blocking(&self) -> bool {
        matches!(self, Outcome::Reject)
    }
}
