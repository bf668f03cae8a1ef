//! Capability card: the immutable, versioned descriptor of an agent.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MAX_ID_LEN: usize = 64;
const MAX_CAPABILITY_LEN: usize = 96;

/// Operating limits advertised by a capability card.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardLimits {
    max_input_tokens: u32,
    max_output_tokens: u32,
    max_latency_ms: u64,
    max_cost_per_invoke: f64,
}

impl CardLimits {
    /// Creates a limits block.
    #[must_use]
    pub const fn new(
        max_input_tokens: u32,
        max_output_tokens: u32,
        max_latency_ms: u64,
        max_cost_per_invoke: f64,
    ) -> Self {
        Self {
            max_input_tokens,
            max_output_tokens,
            max_latency_ms,
            max_cost_per_invoke,
        }
    }

    /// Maximum accepted input tokens per invocation.
    #[must_use]
    pub const fn max_input_tokens(&self) -> u32 {
        self.max_input_tokens
    }

    /// Maximum produced output tokens per invocation.
    #[must_use]
    pub const fn max_output_tokens(&self) -> u32 {
        self.max_output_tokens
    }

    /// Maximum end-to-end latency in milliseconds.
    #[must_use]
    pub const fn max_latency_ms(&self) -> u64 {
        self.max_latency_ms
    }

    /// Maximum cost a single invocation may incur, in USD.
    #[must_use]
    pub const fn max_cost_per_invoke(&self) -> f64 {
        self.max_cost_per_invoke
    }

    /// Returns a copy with a reduced output-token ceiling.
    ///
    /// Used by the negotiator to state degraded scope explicitly.
    #[must_use]
    pub const fn with_max_output_tokens(mut self, tokens: u32) -> Self {
        self.max_output_tokens = tokens;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.max_input_tokens == 0 || self.max_output_tokens == 0 {
            return Err(Error::invalid_card("token limits must be greater than zero"));
        }
        if self.max_latency_ms == 0 {
            return Err(Error::invalid_card("max latency must be greater than zero"));
        }
        if !self.max_cost_per_invoke.is_finite() || self.max_cost_per_invoke <= 0.0 {
            return Err(Error::invalid_card(
                "max cost per invoke must be a positive finite amount",
            ));
        }
        Ok(())
    }
}

/// Data-handling posture declared by the agent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrivacyPolicy {
    /// Whether the agent may receive personally identifiable information.
    pub pii: bool,
    /// Whether the agent may receive protected health information.
    pub phi: bool,
    /// Retention window for submitted payloads, in days.
    pub retention_days: u32,
}

/// Authentication expectations declared by the agent.
///
/// Carried as data only; identity verification itself is an external concern.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AuthRequirement {
    /// Authentication method name (e.g., `bearer`).
    pub method: String,
    /// Expected token audience.
    pub audience: String,
}

/// Immutable, versioned descriptor of what an agent can do and its limits.
///
/// Loaded once per process at startup from a trusted source and never mutated
/// afterwards. A card that fails validation prevents the process from serving
/// traffic; this is the one place config errors are fatal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CapabilityCard {
    id: String,
    version: String,
    capabilities: BTreeSet<String>,
    limits: CardLimits,
    privacy: PrivacyPolicy,
    auth: AuthRequirement,
}

impl CapabilityCard {
    /// Starts building a card in process (primarily for tests and embedding).
    #[must_use]
    pub fn builder(id: impl Into<String>) -> CapabilityCardBuilder {
        CapabilityCardBuilder {
            id: id.into(),
            version: None,
            capabilities: BTreeSet::new(),
            limits: None,
            privacy: None,
            auth: None,
        }
    }

    /// Loads and validates a card from its JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedCard`] when the document does not decode and
    /// [`Error::InvalidCard`] when any field fails schema validation. Callers
    /// must treat either as fatal at startup.
    pub fn from_json(document: &str) -> Result<Self> {
        let card: Self = serde_json::from_str(document)?;
        card.validate()?;
        Ok(card)
    }

    /// Returns the stable card identifier.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the semantic version of the card.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Returns the set of operation names the agent serves.
    #[must_use]
    pub const fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    /// Returns `true` when the card advertises the supplied method.
    #[must_use]
    pub fn supports(&self, method: &str) -> bool {
        self.capabilities.contains(method)
    }

    /// Returns the advertised operating limits.
    #[must_use]
    pub const fn limits(&self) -> &CardLimits {
        &self.limits
    }

    /// Returns the declared privacy posture.
    #[must_use]
    pub const fn privacy(&self) -> &PrivacyPolicy {
        &self.privacy
    }

    /// Returns the declared authentication expectations.
    #[must_use]
    pub const fn auth(&self) -> &AuthRequirement {
        &self.auth
    }

    /// Validates the card against its schema.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCard`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        validate_card_id(&self.id)?;
        validate_semver(&self.version)?;
        if self.capabilities.is_empty() {
            return Err(Error::invalid_card(
                "card must advertise at least one capability",
            ));
        }
        for capability in &self.capabilities {
            validate_capability_name(capability)?;
        }
        self.limits.validate()?;
        if self.auth.method.trim().is_empty() {
            return Err(Error::invalid_card("auth method cannot be empty"));
        }
        Ok(())
    }
}

/// Builder for [`CapabilityCard`].
#[derive(Debug)]
pub struct CapabilityCardBuilder {
    id: String,
    version: Option<String>,
    capabilities: BTreeSet<String>,
    limits: Option<CardLimits>,
    privacy: Option<PrivacyPolicy>,
    auth: Option<AuthRequirement>,
}

impl CapabilityCardBuilder {
    /// Sets the semantic version of the card.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Adds a capability (operation name) to the card.
    #[must_use]
    pub fn capability(mut self, name: impl Into<String>) -> Self {
        self.capabilities.insert(name.into());
        self
    }

    /// Sets the operating limits.
    #[must_use]
    pub const fn limits(mut self, limits: CardLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Sets the privacy posture.
    #[must_use]
    pub const fn privacy(mut self, privacy: PrivacyPolicy) -> Self {
        self.privacy = Some(privacy);
        self
    }

    /// Sets the authentication expectations.
    #[must_use]
    pub fn auth(mut self, auth: AuthRequirement) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Finalises and validates the card.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCard`] when required fields are missing or any
    /// field fails validation.
    pub fn build(self) -> Result<CapabilityCard> {
        let version = self
            .version
            .ok_or_else(|| Error::invalid_card("version must be provided"))?;
        let limits = self
            .limits
            .ok_or_else(|| Error::invalid_card("limits must be provided"))?;
        let privacy = self.privacy.unwrap_or(PrivacyPolicy {
            pii: false,
            phi: false,
            retention_days: 0,
        });
        let auth = self
            .auth
            .ok_or_else(|| Error::invalid_card("auth block must be provided"))?;

        let card = CapabilityCard {
            id: self.id,
            version,
            capabilities: self.capabilities,
            limits,
            privacy,
            auth,
        };
        card.validate()?;
        Ok(card)
    }
}

fn validate_card_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::invalid_card("card id cannot be empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(Error::invalid_card(format!(
            "card id length must be <= {MAX_ID_LEN}"
        )));
    }
    if !id
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::invalid_card(
            "card id must contain lowercase alphanumeric, dash, underscore, or dot",
        ));
    }
    Ok(())
}

fn validate_capability_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_CAPABILITY_LEN {
        return Err(Error::invalid_card(format!(
            "capability name must be 1..={MAX_CAPABILITY_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::invalid_card(format!(
            "capability name `{name}` contains unsupported characters"
        )));
    }
    Ok(())
}

fn validate_semver(version: &str) -> Result<()> {
    let core = version.split(['-', '+']).next().unwrap_or_default();
    let mut parts = 0;
    for part in core.split('.') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(Error::invalid_card(format!(
                "version `{version}` is not a semantic version"
            )));
        }
        parts += 1;
    }
    if parts != 3 {
        return Err(Error::invalid_card(format!(
            "version `{version}` must have three numeric components"
        )));
    }
    Ok(())
}
