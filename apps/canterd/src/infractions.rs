use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentKind {
    Ban,
    Mute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Punishment {
    pub user_name: String,
    pub kind: PunishmentKind,
    /// Zero means indefinite.
    pub expires_at_unix: u64,
    pub reason: String,
}

impl Punishment {
    fn is_active(&self, now_unix: u64) -> bool {
        self.expires_at_unix == 0 || self.expires_at_unix > now_unix
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InfractionVerdict {
    pub prevent_server_joining: bool,
    pub prevent_chatting: bool,
    /// Unix expiry of the active mute, zero when indefinite.
    pub mute_expires_at_unix: u64,
}

/// Outstanding punishments, keyed by lowercased user name.
///
/// Loaded once at startup; operators edit the file and restart, or push
/// mutes at runtime through the lobby director.
#[derive(Debug, Default)]
pub struct InfractionSystem {
    by_user: Mutex<HashMap<String, Vec<Punishment>>>,
}

impl InfractionSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Self {
        let mut by_user: HashMap<String, Vec<Punishment>> = HashMap::new();
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<Vec<Punishment>>(&raw) {
                Ok(entries) => {
                    for entry in entries {
                        by_user
                            .entry(entry.user_name.trim().to_ascii_lowercase())
                            .or_default()
                            .push(entry);
                    }
                }
                Err(e) => warn!(path = %path.display(), err = %e, "bad punishments file"),
            },
            // A missing file just means a clean slate.
            Err(_) => {}
        }

        Self {
            by_user: Mutex::new(by_user),
        }
    }

    pub fn add(&self, punishment: Punishment) {
        self.by_user
            .lock()
            .unwrap()
            .entry(punishment.user_name.trim().to_ascii_lowercase())
            .or_default()
            .push(punishment);
    }

    pub fn check_outstanding(&self, user_name: &str) -> InfractionVerdict {
        let now_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.check_outstanding_at(user_name, now_unix)
    }

    pub fn check_outstanding_at(&self, user_name: &str, now_unix: u64) -> InfractionVerdict {
        let key = user_name.trim().to_ascii_lowercase();
        let by_user = self.by_user.lock().unwrap();

        let mut verdict = InfractionVerdict::default();
        let Some(entries) = by_user.get(&key) else {
            return verdict;
        };

        for entry in entries {
            if !entry.is_active(now_unix) {
                continue;
            }
            match entry.kind {
                PunishmentKind::Ban => verdict.prevent_server_joining = true,
                PunishmentKind::Mute => {
                    verdict.prevent_chatting = true;
                    verdict.mute_expires_at_unix =
                        verdict.mute_expires_at_unix.max(entry.expires_at_unix);
                }
            }
        }

        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn punishment(kind: PunishmentKind, expires_at_unix: u64) -> Punishment {
        Punishment {
            user_name: "Alice".to_string(),
            kind,
            expires_at_unix,
            reason: "test".to_string(),
        }
    }

    #[test]
    fn active_ban_prevents_joining() {
        let system = InfractionSystem::new();
        system.add(punishment(PunishmentKind::Ban, 1_000));

        let verdict = system.check_outstanding_at("alice", 500);
        assert!(verdict.prevent_server_joining);
        assert!(!verdict.prevent_chatting);
    }

    #[test]
    fn expired_punishments_are_ignored() {
        let system = InfractionSystem::new();
        system.add(punishment(PunishmentKind::Ban, 1_000));

        let verdict = system.check_outstanding_at("alice", 2_000);
        assert!(!verdict.prevent_server_joining);
    }

    #[test]
    fn indefinite_punishment_never_expires() {
        let system = InfractionSystem::new();
        system.add(punishment(PunishmentKind::Mute, 0));

        let verdict = system.check_outstanding_at("ALICE", u64::MAX - 1);
        assert!(verdict.prevent_chatting);
        assert_eq!(verdict.mute_expires_at_unix, 0);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let system = InfractionSystem::new();
        system.add(punishment(PunishmentKind::Ban, 0));
        assert!(
            system
                .check_outstanding_at("aLiCe", 1)
                .prevent_server_joining
        );
        assert!(!system.check_outstanding_at("bob", 1).prevent_server_joining);
    }
}
