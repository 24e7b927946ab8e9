// Credential pool - round-robin selection of upstream API keys with quarantine

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// An upstream bearer token. `Debug` and `Display` only show a fingerprint.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for the auth header only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Last four characters, safe for logs.
    pub fn fingerprint(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
        format!("…{}", tail)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.fingerprint())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint())
    }
}

#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub credential: Credential,
    pub quarantined_until: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no upstream credential available")]
pub struct NoCredentialAvailable;

#[derive(Debug)]
struct PoolState {
    entries: Vec<CredentialStatus>,
    cursor: usize,
}

/// Rotation cursor and quarantine map under one lock.
///
/// The lock is only held for an O(n) scan or update, never across an
/// upstream call.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
}

impl CredentialPool {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut entries: Vec<CredentialStatus> = Vec::new();
        for token in tokens {
            let token: String = token.into();
            let token = token.trim().to_string();
            if token.is_empty() || entries.iter().any(|e| e.credential.expose() == token) {
                continue;
            }
            entries.push(CredentialStatus {
                credential: Credential::new(token),
                quarantined_until: None,
            });
        }

        Self {
            state: Mutex::new(PoolState { entries, cursor: 0 }),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn acquire(&self) -> Result<Credential, NoCredentialAvailable> {
        self.acquire_at(Instant::now())
    }

    pub fn quarantine(&self, credential: &Credential, duration: Duration) {
        self.quarantine_at(credential, duration, Instant::now())
    }

    /// Current view of every credential, in rotation order.
    pub fn status(&self) -> Vec<CredentialStatus> {
        self.state.lock().entries.clone()
    }

    pub fn is_quarantined(&self, credential: &Credential) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .iter()
            .find(|e| &e.credential == credential)
            .and_then(|e| e.quarantined_until)
            .is_some_and(|until| until > now)
    }

    fn acquire_at(&self, now: Instant) -> Result<Credential, NoCredentialAvailable> {
        let mut state = self.state.lock();
        let len = state.entries.len();

        for offset in 0..len {
            let index = (state.cursor + offset) % len;
            let entry = &mut state.entries[index];
            let eligible = match entry.quarantined_until {
                None => true,
                Some(until) => now >= until,
            };
            if eligible {
                if entry.quarantined_until.take().is_some() {
                    tracing::info!("Credential {} back in rotation", entry.credential);
                }
                let credential = entry.credential.clone();
                state.cursor = (index + 1) % len;
                return Ok(credential);
            }
        }

        Err(NoCredentialAvailable)
    }

    fn quarantine_at(&self, credential: &Credential, duration: Duration, now: Instant) {
        let until = now + duration;
        let mut state = self.state.lock();

        let Some(entry) = state.entries.iter_mut().find(|e| &e.credential == credential) else {
            tracing::warn!("Attempted to quarantine unknown credential {}", credential);
            return;
        };

        match entry.quarantined_until {
            Some(existing) if existing >= until => {}
            _ => {
                entry.quarantined_until = Some(until);
                tracing::warn!(
                    "Credential {} quarantined for {}s",
                    credential,
                    duration.as_secs()
                );
            }
        }
    }
}
