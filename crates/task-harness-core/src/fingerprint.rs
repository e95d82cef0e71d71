//! Content fingerprint used for change detection.
//!
//! A [`Fingerprint`] is a SHA-256 digest over the fields of a [`Task`] that
//! feed enrichment: content, description, priority, and the full due date
//! (date, datetime, and recurrence rule). Two tasks with equal fingerprints
//! produce the same embedding input and the same analysis prompt, so a task
//! whose fingerprint matches its stored enrichment is skipped.
//!
//! Each field is length-prefixed before hashing so that moving text between
//! adjacent fields changes the digest. Absent optional fields hash
//! differently from empty strings.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::models::Task;

const DOMAIN_TAG: &[u8] = b"task-harness/fingerprint/v1";

/// SHA-256 digest of a task's enrichment-relevant content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Compute the fingerprint of a task.
    pub fn of(task: &Task) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DOMAIN_TAG);
        write_field(&mut hasher, Some(task.content.as_str()));
        write_field(&mut hasher, Some(task.description.as_str()));
        hasher.update([task.priority.as_u8()]);

        match &task.due {
            None => hasher.update([0u8]),
            Some(due) => {
                hasher.update([1u8]);
                write_field(&mut hasher, Some(due.date.as_str()));
                write_field(&mut hasher, due.datetime.as_deref());
                write_field(&mut hasher, due.recurrence.as_deref());
            }
        }

        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

fn write_field(hasher: &mut Sha256, value: Option<&str>) {
    match value {
        None => hasher.update([0u8]),
        Some(s) => {
            hasher.update([1u8]);
            hasher.update((s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| format!("invalid fingerprint hex: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| format!("fingerprint must be 32 bytes, got {}", b.len()))?;
        Ok(Self(arr))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Due, Priority};

    fn task() -> Task {
        let mut t = Task::new("t1", "p1", "Buy milk");
        t.description = "2 litres".into();
        t.priority = Priority::Low;
        t
    }

    #[test]
    fn test_fingerprint_is_stable() {
        assert_eq!(Fingerprint::of(&task()), Fingerprint::of(&task()));
        assert_eq!(Fingerprint::of(&task()).to_hex().len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_enrichment_fields() {
        let base = Fingerprint::of(&task());

        let mut t = task();
        t.content = "Buy oat milk".into();
        assert_ne!(Fingerprint::of(&t), base);

        let mut t = task();
        t.description = "1 litre".into();
        assert_ne!(Fingerprint::of(&t), base);

        let mut t = task();
        t.priority = Priority::Urgent;
        assert_ne!(Fingerprint::of(&t), base);
    }

    #[test]
    fn test_fingerprint_ignores_non_content_fields() {
        let base = Fingerprint::of(&task());
        let mut t = task();
        t.is_completed = true;
        t.labels.insert("errand".into());
        t.order = 7;
        t.comment_count = 3;
        assert_eq!(Fingerprint::of(&t), base);
    }

    #[test]
    fn test_fingerprint_covers_full_due() {
        let mut a = task();
        a.due = Some(Due {
            date: "2024-05-06".into(),
            datetime: None,
            timezone: None,
            recurrence: None,
        });
        let mut b = a.clone();
        b.due.as_mut().unwrap().recurrence = Some("every monday".into());
        let mut c = a.clone();
        c.due.as_mut().unwrap().datetime = Some("2024-05-06T09:00:00Z".into());

        let fa = Fingerprint::of(&a);
        assert_ne!(fa, Fingerprint::of(&task()));
        assert_ne!(fa, Fingerprint::of(&b));
        assert_ne!(fa, Fingerprint::of(&c));
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let mut a = Task::new("t1", "p1", "ab");
        a.description = "c".into();
        let mut b = Task::new("t1", "p1", "a");
        b.description = "bc".into();
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_hex_parse_and_serde() {
        let fp = Fingerprint::of(&task());
        let parsed: Fingerprint = fp.to_hex().parse().unwrap();
        assert_eq!(parsed, fp);

        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{fp}\""));

        assert!("zz".parse::<Fingerprint>().is_err());
        assert!("abcd".parse::<Fingerprint>().is_err());
    }
}
