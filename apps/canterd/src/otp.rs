use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

/// Single-use codes for cross-endpoint handoff.
///
/// The lobby grants a code keyed by an identity hash; the target endpoint
/// spends it by presenting the same hash. A spent or mismatched code never
/// authorizes again.
#[derive(Debug, Default)]
pub struct OtpSystem {
    codes: Mutex<HashMap<u64, u32>>,
}

impl OtpSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh non-zero code for the identity, replacing any code
    /// previously issued for it.
    pub fn grant_code(&self, identity: u64) -> u32 {
        let code = loop {
            let mut raw = [0u8; 4];
            getrandom::getrandom(&mut raw).expect("getrandom");
            let code = u32::from_le_bytes(raw);
            if code != 0 {
                break code;
            }
        };

        self.codes.lock().unwrap().insert(identity, code);
        code
    }

    /// Spends the code for the identity. Returns `true` exactly once per
    /// granted `(identity, code)` pair; a wrong code leaves the stored one
    /// intact.
    pub fn authorize_code(&self, identity: u64, code: u32) -> bool {
        let mut codes = self.codes.lock().unwrap();
        match codes.get(&identity) {
            Some(stored) if *stored == code => {
                codes.remove(&identity);
                true
            }
            _ => false,
        }
    }
}

/// Combines uids into the identity hash both sides of a handoff derive
/// independently.
pub fn identity_hash(parts: &[u32]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    for part in parts {
        part.hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_is_single_use() {
        let otp = OtpSystem::new();
        let identity = identity_hash(&[42, 1]);
        let code = otp.grant_code(identity);
        assert_ne!(code, 0);

        assert!(otp.authorize_code(identity, code));
        assert!(!otp.authorize_code(identity, code));
    }

    #[test]
    fn wrong_code_does_not_consume() {
        let otp = OtpSystem::new();
        let identity = identity_hash(&[42, 1]);
        let code = otp.grant_code(identity);

        assert!(!otp.authorize_code(identity, code.wrapping_add(1)));
        assert!(otp.authorize_code(identity, code));
    }

    #[test]
    fn regrant_replaces_old_code() {
        let otp = OtpSystem::new();
        let identity = identity_hash(&[7]);
        let first = otp.grant_code(identity);
        let second = otp.grant_code(identity);

        if first != second {
            assert!(!otp.authorize_code(identity, first));
        }
        assert!(otp.authorize_code(identity, second));
    }

    #[test]
    fn identity_hash_is_order_sensitive() {
        assert_ne!(identity_hash(&[1, 2]), identity_hash(&[2, 1]));
        assert_eq!(identity_hash(&[1, 2]), identity_hash(&[1, 2]));
    }
}
