use crate::infractions::InfractionSystem;

#[derive(Debug, Clone)]
pub struct ChatVerdict {
    /// The message to broadcast, censored where the filter matched.
    pub message: String,
    /// Suppress the broadcast entirely (active mute).
    pub suppress: bool,
}

/// Chat moderation: a word filter plus the mute check.
pub struct ChatSystem {
    blocked_words: Vec<String>,
}

impl ChatSystem {
    pub fn new(blocked_words: Vec<String>) -> Self {
        Self {
            blocked_words: blocked_words
                .into_iter()
                .map(|w| w.trim().to_ascii_lowercase())
                .filter(|w| !w.is_empty())
                .collect(),
        }
    }

    pub fn process_message(
        &self,
        infractions: &InfractionSystem,
        user_name: &str,
        message: &str,
    ) -> ChatVerdict {
        if infractions.check_outstanding(user_name).prevent_chatting {
            return ChatVerdict {
                message: String::new(),
                suppress: true,
            };
        }

        ChatVerdict {
            message: self.censor(message),
            suppress: false,
        }
    }

    fn censor(&self, message: &str) -> String {
        let mut out = message.to_owned();
        let lower = message.to_ascii_lowercase();

        for word in &self.blocked_words {
            let mut from = 0;
            while let Some(at) = lower[from..].find(word.as_str()) {
                let start = from + at;
                let end = start + word.len();
                // The haystack is lowercased in place, so byte offsets line
                // up only for ASCII words; the filter list is ASCII.
                out.replace_range(start..end, &"*".repeat(word.chars().count()));
                from = end;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infractions::{Punishment, PunishmentKind};

    fn chat() -> ChatSystem {
        ChatSystem::new(vec!["darn".to_string(), "heck".to_string()])
    }

    #[test]
    fn passes_clean_messages() {
        let verdict = chat().process_message(&InfractionSystem::new(), "alice", "good race!");
        assert!(!verdict.suppress);
        assert_eq!(verdict.message, "good race!");
    }

    #[test]
    fn censors_blocked_words_case_insensitively() {
        let verdict = chat().process_message(&InfractionSystem::new(), "alice", "DARN it, heck");
        assert_eq!(verdict.message, "**** it, ****");
    }

    #[test]
    fn mute_suppresses_broadcast() {
        let infractions = InfractionSystem::new();
        infractions.add(Punishment {
            user_name: "alice".to_string(),
            kind: PunishmentKind::Mute,
            expires_at_unix: 0,
            reason: "spam".to_string(),
        });

        let verdict = chat().process_message(&infractions, "alice", "hello");
        assert!(verdict.suppress);
    }
}
