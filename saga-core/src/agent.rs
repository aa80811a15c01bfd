//! Agent roster and the provider boundary.
//!
//! An agent is a narrator or player whose turns are produced by a remote
//! content-generation call. The only contract this crate depends on from a
//! provider is [`AgentClient`]: one finished generation per request, with
//! errors classified well enough to drive the retry policy. Providers may
//! be mixed per agent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The part an agent plays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Sees every agent's memory; narrates the world and runs its creatures.
    Narrator,
    /// Sees only its own memory.
    Player,
}

/// Static description of one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent identifier; also the tag used on the wire.
    pub id: String,

    pub role: Role,

    /// Persona text prepended to the system prompt. Authored externally.
    pub persona: String,

    /// Model override for this agent, if any.
    pub model: Option<String>,

    /// Context budget in tokens. Drives the compression threshold.
    pub token_budget: usize,
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            role,
            persona: String::new(),
            model: None,
            token_budget: 8_000,
        }
    }

    pub fn narrator(id: impl Into<String>) -> Self {
        Self::new(id, Role::Narrator)
    }

    pub fn player(id: impl Into<String>) -> Self {
        Self::new(id, Role::Player)
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_token_budget(mut self, tokens: usize) -> Self {
        self.token_budget = tokens;
        self
    }
}

/// One message of the transcript handed to a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptMessage {
    pub speaker: String,
    pub text: String,
}

/// A provider-neutral generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The agent being invoked; its own lines map to the assistant role.
    pub agent_id: String,

    /// System prompt: persona plus the memory context block.
    pub system: String,

    /// Visible conversation, oldest first.
    pub transcript: Vec<TranscriptMessage>,

    /// Reformulated prompt appended after an empty response.
    pub nudge: Option<String>,

    pub model: Option<String>,
}

impl GenerationRequest {
    pub fn new(agent_id: impl Into<String>, system: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            system: system.into(),
            transcript: Vec::new(),
            nudge: None,
            model: None,
        }
    }
}

/// Error classes at the provider boundary.
///
/// These are the only distinctions the retry policy needs; provider-specific
/// detail stays in the message strings.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("provider returned empty content")]
    Empty,

    #[error("provider request timed out")]
    Timeout,

    #[error("provider rate limit or quota exhausted")]
    RateLimited,

    #[error("provider error: {message}")]
    Other { message: String, transient: bool },
}

impl ProviderError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
            transient: true,
        }
    }

    /// Whether exponential backoff could help.
    pub fn is_backoff_retryable(&self) -> bool {
        matches!(
            self,
            ProviderError::Timeout | ProviderError::Other { transient: true, .. }
        )
    }
}

/// The remote invocation boundary.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Produce the agent's next contribution for the given request.
    async fn generate(&self, request: GenerationRequest) -> Result<String, ProviderError>;
}

/// Claude-backed [`AgentClient`].
pub struct ClaudeAgent {
    client: claude::Claude,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl ClaudeAgent {
    pub fn new(client: claude::Claude) -> Self {
        Self {
            client,
            max_tokens: 4096,
            temperature: Some(0.8),
        }
    }

    pub fn from_env() -> Result<Self, claude::Error> {
        Ok(Self::new(claude::Claude::from_env()?))
    }

    pub fn with_max_tokens(mut self, tokens: usize) -> Self {
        self.max_tokens = tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Map the multi-party transcript onto the two-role Messages API.
    ///
    /// The invoked agent's own lines become assistant turns; everyone
    /// else's are user turns carrying their wire tag so the model can tell
    /// speakers apart. The API requires the conversation to open with a
    /// user turn.
    fn build_messages(request: &GenerationRequest) -> Vec<claude::Message> {
        let mut messages = Vec::with_capacity(request.transcript.len() + 2);

        for line in &request.transcript {
            if line.speaker == request.agent_id {
                messages.push(claude::Message::assistant(line.text.clone()));
            } else {
                messages.push(claude::Message::user(format!(
                    "[{}]: {}",
                    line.speaker, line.text
                )));
            }
        }

        if let Some(nudge) = &request.nudge {
            messages.push(claude::Message::user(nudge.clone()));
        }

        let opens_with_user = messages
            .first()
            .map(|m| m.role == claude::Role::User)
            .unwrap_or(false);
        if !opens_with_user {
            messages.insert(0, claude::Message::user("Continue the scene.".to_string()));
        }

        messages
    }
}

#[async_trait]
impl AgentClient for ClaudeAgent {
    async fn generate(&self, request: GenerationRequest) -> Result<String, ProviderError> {
        let messages = Self::build_messages(&request);

        let mut api_request =
            claude::Request::new(messages).with_max_tokens(self.max_tokens);
        api_request = api_request.with_system(request.system.clone());
        if let Some(model) = request.model.as_ref() {
            api_request = api_request.with_model(model.clone());
        }
        if let Some(temperature) = self.temperature {
            api_request = api_request.with_temperature(temperature);
        }

        let response = self.client.complete(api_request).await.map_err(|e| {
            if e.is_rate_limited() {
                ProviderError::RateLimited
            } else if matches!(e, claude::Error::Timeout) {
                ProviderError::Timeout
            } else if e.is_transient() {
                ProviderError::transient(e.to_string())
            } else {
                ProviderError::other(e.to_string())
            }
        })?;

        if response.text.trim().is_empty() {
            return Err(ProviderError::Empty);
        }

        Ok(response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with(transcript: Vec<TranscriptMessage>) -> GenerationRequest {
        GenerationRequest {
            agent_id: "rogue".to_string(),
            system: "persona".to_string(),
            transcript,
            nudge: None,
            model: None,
        }
    }

    #[test]
    fn test_profile_builder() {
        let profile = AgentProfile::player("rogue")
            .with_persona("A cautious burglar.")
            .with_token_budget(2_000);

        assert_eq!(profile.id, "rogue");
        assert_eq!(profile.role, Role::Player);
        assert_eq!(profile.token_budget, 2_000);
    }

    #[test]
    fn test_own_lines_map_to_assistant() {
        let request = request_with(vec![
            TranscriptMessage {
                speaker: "narrator".to_string(),
                text: "The vault looms.".to_string(),
            },
            TranscriptMessage {
                speaker: "rogue".to_string(),
                text: "I check for traps.".to_string(),
            },
        ]);

        let messages = ClaudeAgent::build_messages(&request);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, claude::Role::User);
        assert!(messages[0].content.starts_with("[narrator]:"));
        assert_eq!(messages[1].role, claude::Role::Assistant);
    }

    #[test]
    fn test_conversation_opens_with_user() {
        let request = request_with(vec![TranscriptMessage {
            speaker: "rogue".to_string(),
            text: "Previously, I picked the lock.".to_string(),
        }]);

        let messages = ClaudeAgent::build_messages(&request);
        assert_eq!(messages[0].role, claude::Role::User);
        assert_eq!(messages[0].content, "Continue the scene.");
    }

    #[test]
    fn test_nudge_is_appended() {
        let mut request = request_with(vec![]);
        request.nudge = Some("Your last reply was empty.".to_string());

        let messages = ClaudeAgent::build_messages(&request);
        assert_eq!(messages.len(), 1);
        assert!(messages[0].content.contains("empty"));
    }

    #[test]
    fn test_backoff_retryable_classes() {
        assert!(ProviderError::Timeout.is_backoff_retryable());
        assert!(ProviderError::transient("overloaded").is_backoff_retryable());
        assert!(!ProviderError::RateLimited.is_backoff_retryable());
        assert!(!ProviderError::Empty.is_backoff_retryable());
        assert!(!ProviderError::other("bad request").is_backoff_retryable());
    }
}
