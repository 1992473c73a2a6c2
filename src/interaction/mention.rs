//! Decides whether a chat line addresses the bot.
//!
//! Explicit address forms (for the bot name and every alias):
//! - leading `@name`, `name:`, `name,` (or `!`, `?`, `.`), or `name` as a standalone first word;
//! - `name` as a standalone last word, optionally preceded by a comma and followed by `!?.`.
//!
//! Matching is case-insensitive and Unicode-aware. A name only matches as a
//! whole token, so `eugenics` never addresses `eugen`.
//!
//! Ambiguous greetings ("hi", "how are you", ...) at the start of a message are a
//! separate, lower-confidence path that is off unless the policy enables it.

use regex::Regex;

use crate::base::{config::Config, types::Res};

/// How a message addressed the bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MentionKind {
    /// The bot was named explicitly.
    Explicit,
    /// The message opened with a greeting and no name.
    Greeting,
}

/// Outcome of classifying a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// `None` when the message is not addressed to the bot.
    pub kind: Option<MentionKind>,
    /// The message with the address token removed and trimmed.
    pub residual_text: String,
}

impl Detection {
    fn not_addressed(text: &str) -> Self {
        Self {
            kind: None,
            residual_text: text.to_string(),
        }
    }

    pub fn addressed(&self) -> bool {
        self.kind.is_some()
    }
}

/// Which address forms beyond the bot name are accepted.
#[derive(Debug, Clone, Default)]
pub struct MentionPolicy {
    pub aliases: Vec<String>,
    pub derive_nicknames: bool,
    /// Greeting phrases; `None` disables the greeting heuristic.
    pub greetings: Option<Vec<String>>,
}

impl MentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            aliases: config.aliases.clone(),
            derive_nicknames: config.derive_nicknames,
            greetings: config.greetings_enabled.then(|| config.greetings.clone()),
        }
    }
}

/// Compiled matcher for one bot identity.
#[derive(Debug, Clone)]
pub struct MentionMatcher {
    leading: Regex,
    trailing: Regex,
    greeting: Option<Regex>,
}

impl MentionMatcher {
    pub fn new(bot_name: &str, policy: &MentionPolicy) -> Res<Self> {
        let names = address_names(bot_name, policy);

        if names.is_empty() {
            return Err(anyhow::anyhow!("At least one non-empty bot name is required."));
        }

        let alternation = names.iter().map(|name| regex::escape(name)).collect::<Vec<_>>().join("|");

        let leading = Regex::new(&format!(r"(?i)^\s*@?(?:{alternation})(?:[:,!?.]+(?:\s+|$)|[:,]\s*|\s+|$)"))?;
        let trailing = Regex::new(&format!(r"(?i)(?:^|[\s,]+)@?(?:{alternation})[!?.]*\s*$"))?;

        let greeting = match &policy.greetings {
            Some(phrases) if phrases.iter().any(|p| !p.trim().is_empty()) => {
                let alternation = phrases
                    .iter()
                    .map(|p| p.trim())
                    .filter(|p| !p.is_empty())
                    .map(|p| regex::escape(p).split_whitespace().collect::<Vec<_>>().join(r"\s+"))
                    .collect::<Vec<_>>()
                    .join("|");

                Some(Regex::new(&format!(r"(?i)^\s*(?:{alternation})(?:\W|$)"))?)
            }
            _ => None,
        };

        Ok(Self { leading, trailing, greeting })
    }

    pub fn from_config(config: &Config) -> Res<Self> {
        Self::new(&config.bot_name, &MentionPolicy::from_config(config))
    }

    /// Classify `text`. Pure; never fails.
    pub fn detect(&self, text: &str) -> Detection {
        if text.trim().is_empty() {
            return Detection::not_addressed(text);
        }

        if let Some(m) = self.leading.find(text) {
            return Detection {
                kind: Some(MentionKind::Explicit),
                residual_text: text[m.end()..].trim().to_string(),
            };
        }

        if let Some(m) = self.trailing.find(text) {
            let residual = text[..m.start()].trim_end_matches(|c: char| c == ',' || c.is_whitespace()).trim();

            return Detection {
                kind: Some(MentionKind::Explicit),
                residual_text: residual.to_string(),
            };
        }

        if let Some(greeting) = &self.greeting
            && greeting.is_match(text)
        {
            return Detection {
                kind: Some(MentionKind::Greeting),
                residual_text: text.to_string(),
            };
        }

        Detection::not_addressed(text)
    }
}

/// One-shot detection with the default policy (explicit forms only).
///
/// A name that cannot be compiled into a matcher classifies as "not addressed".
pub fn detect(text: &str, bot_name: &str) -> Detection {
    match MentionMatcher::new(bot_name, &MentionPolicy::default()) {
        Ok(matcher) => matcher.detect(text),
        Err(_) => Detection::not_addressed(text),
    }
}

/// The 4- and 8-character prefixes of a bot name, excluding the name itself.
pub fn derived_nicknames(bot_name: &str) -> Vec<String> {
    let chars: Vec<char> = bot_name.chars().collect();
    let mut nicknames = Vec::new();

    for len in [4, 8] {
        if chars.len() > len {
            nicknames.push(chars[..len].iter().collect());
        }
    }

    nicknames
}

/// All names the bot answers to, longest first, without case-insensitive duplicates.
fn address_names(bot_name: &str, policy: &MentionPolicy) -> Vec<String> {
    let mut candidates = vec![bot_name.trim().to_string()];
    candidates.extend(policy.aliases.iter().map(|a| a.trim().to_string()));

    if policy.derive_nicknames {
        candidates.extend(derived_nicknames(bot_name.trim()));
    }

    let mut names: Vec<String> = Vec::new();
    for candidate in candidates {
        if candidate.is_empty() || names.iter().any(|n| n.to_lowercase() == candidate.to_lowercase()) {
            continue;
        }
        names.push(candidate);
    }

    names.sort_by_key(|n| std::cmp::Reverse(n.chars().count()));
    names
}
