//! Session state machine for one upload-through-result interaction cycle.
//!
//! Transitions are pure by-value functions over an owned [`Session`] so the
//! machine can be tested without any rendering or network layer. Late
//! completions are fenced by a monotonically increasing token: every
//! transition that invalidates an in-flight request bumps the token, and
//! [`Session::complete`] only applies an outcome whose ticket still matches.

/// Normalized source photo as produced by the engine's image normalizer.
///
/// Immutable once built; selecting a new photo replaces the whole value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceImage {
    /// Always `image/jpeg` after normalization.
    pub mime_type: String,
    /// Base64 of the JPEG bytes, without any data-URL header.
    pub base64_data: String,
    /// Displayable `data:image/jpeg;base64,…` representation of the same bytes.
    pub preview_url: String,
    pub width: u32,
    pub height: u32,
}

/// One generated edit, held by the session until reset or replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// Base64 PNG data as returned by the generator.
    pub png_base64: String,
}

impl GeneratedImage {
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.png_base64)
    }
}

/// User-visible phase of the session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Success,
    Error(String),
}

/// Handle for one in-flight generation request.
///
/// The token is compared against the session's current token when the
/// completion arrives; a mismatch means the session moved on (new image or
/// reset) and the outcome must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    pub token: u64,
}

/// Terminal outcome of one generation request.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success(GeneratedImage),
    Failure(String),
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    phase: Phase,
    image: Option<SourceImage>,
    result: Option<GeneratedImage>,
    token: u64,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn image(&self) -> Option<&SourceImage> {
        self.image.as_ref()
    }

    pub fn result(&self) -> Option<&GeneratedImage> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            Phase::Error(message) => Some(message.as_str()),
            _ => None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    pub fn token(&self) -> u64 {
        self.token
    }

    /// Installs a new source photo. Allowed from any phase; clears the prior
    /// result and error, invalidates any in-flight request, returns to Idle.
    pub fn select_image(mut self, image: SourceImage) -> Session {
        self.image = Some(image);
        self.result = None;
        self.phase = Phase::Idle;
        self.token += 1;
        self
    }

    /// Starts a generation request. Only valid from Idle or Error with a
    /// source image and a non-blank instruction; anything else is a no-op
    /// and yields no ticket. Refusing while Loading is what enforces the
    /// at-most-one-in-flight contract.
    pub fn submit(mut self, instruction: &str) -> (Session, Option<Ticket>) {
        if !matches!(self.phase, Phase::Idle | Phase::Error(_)) {
            return (self, None);
        }
        if self.image.is_none() || instruction.trim().is_empty() {
            return (self, None);
        }
        self.phase = Phase::Loading;
        self.token += 1;
        let ticket = Ticket { token: self.token };
        (self, Some(ticket))
    }

    /// Applies a completion. Returns `true` when the outcome was applied;
    /// `false` means the ticket was stale (the session was reset or got a
    /// new image while the request was in flight) and nothing changed.
    pub fn complete(mut self, ticket: Ticket, outcome: Outcome) -> (Session, bool) {
        if self.phase != Phase::Loading || ticket.token != self.token {
            return (self, false);
        }
        match outcome {
            Outcome::Success(image) => {
                self.result = Some(image);
                self.phase = Phase::Success;
            }
            Outcome::Failure(message) => {
                self.result = None;
                self.phase = Phase::Error(message);
            }
        }
        (self, true)
    }

    /// Returns to the pristine pre-upload state, keeping the token monotonic
    /// so any in-flight completion lands stale.
    pub fn reset(self) -> Session {
        Session {
            token: self.token + 1,
            ..Session::default()
        }
    }
}
