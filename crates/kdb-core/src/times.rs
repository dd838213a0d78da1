//! Node timestamps

use chrono::{DateTime, SubsecRound, TimeZone, Utc};

/// Creation, modification, access and expiry times of a group or entry.
///
/// Both file formats store whole seconds, so every timestamp is truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Times {
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub expires: DateTime<Utc>,
    pub expires_enabled: bool,
    pub usage_count: u64,
    pub location_changed: DateTime<Utc>,
}

/// "Never expires" as written by KeePass 1.x: 2999-12-28 23:59:59
pub fn never() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2999, 12, 28, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

impl Times {
    pub fn new() -> Self {
        let now = now();
        Self {
            created: now,
            modified: now,
            accessed: now,
            expires: never(),
            expires_enabled: false,
            usage_count: 0,
            location_changed: now,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_enabled && self.expires < Utc::now()
    }

    /// Update the accessed timestamp
    pub fn touch(&mut self) {
        self.accessed = now();
        self.usage_count = self.usage_count.saturating_add(1);
    }

    pub fn mark_modified(&mut self) {
        let now = now();
        self.modified = now;
        self.accessed = now;
    }

    pub fn set_expiry(&mut self, expires: Option<DateTime<Utc>>) {
        match expires {
            Some(at) => {
                self.expires = at.trunc_subsecs(0);
                self.expires_enabled = true;
            }
            None => {
                self.expires = never();
                self.expires_enabled = false;
            }
        }
    }
}

impl Default for Times {
    fn default() -> Self {
        Self::new()
    }
}
