use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_derive::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Application lifecycle as reported by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Foreground,
    Background,
    Hidden,
    Terminated,
    Unknown,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Foreground => "foreground",
            LifecycleState::Background => "background",
            LifecycleState::Hidden => "hidden",
            LifecycleState::Terminated => "terminated",
            LifecycleState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleState {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "foreground" => Ok(LifecycleState::Foreground),
            "background" => Ok(LifecycleState::Background),
            "hidden" => Ok(LifecycleState::Hidden),
            "terminated" => Ok(LifecycleState::Terminated),
            "unknown" => Ok(LifecycleState::Unknown),
            other => Err(DispatchError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub address: String,
    pub title: String,
    pub body: String,
    pub metadata: BTreeMap<String, String>,
}

impl Notification {
    pub fn for_state(address: &str, state: LifecycleState) -> Option<Self> {
        let (title, body) = match state {
            LifecycleState::Terminated => (
                "We saved your place",
                "Open the app to pick up where you left off.",
            ),
            LifecycleState::Hidden => ("Still with us?", "Your session is paused. Tap to continue."),
            LifecycleState::Background => {
                ("Running in the background", "Tap to return to the app.")
            }
            LifecycleState::Foreground | LifecycleState::Unknown => return None,
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("kind".to_string(), "lifecycle".to_string());
        metadata.insert("state".to_string(), state.to_string());

        Some(Notification {
            address: address.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            metadata,
        })
    }

    /// Fixed-copy push used to check that an address is reachable.
    pub fn test(address: &str) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("kind".to_string(), "test".to_string());

        Notification {
            address: address.to_string(),
            title: "Push Notify".to_string(),
            body: "This is a Test Notification".to_string(),
            metadata,
        }
    }
}

/// Requests arriving from lifecycle reporters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Ingress {
    StateReport { address: String, state: String },
    StateQuery { address: String },
    CancelPending { address: String },
    TestPush { address: String },
    SnapshotRequest,
}

#[derive(Deserialize, Debug)]
struct StateReportPayload {
    state: String,
}

/// Extracts the reported state from either `{"state": "..."}` or a bare state name.
///
/// The state is not validated here; the dispatcher rejects unknown names.
pub fn parse_state_payload(payload: &[u8]) -> Option<String> {
    if let Ok(report) = serde_json::from_slice::<StateReportPayload>(payload) {
        return Some(report.state);
    }

    let text = std::str::from_utf8(payload).ok()?.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lifecycle_state() {
        assert_eq!(
            "hidden".parse::<LifecycleState>(),
            Ok(LifecycleState::Hidden)
        );
        assert_eq!(
            "Hidden".parse::<LifecycleState>(),
            Err(DispatchError::InvalidState("Hidden".to_string()))
        );
        assert_eq!(LifecycleState::Terminated.to_string(), "terminated");
    }

    #[test]
    fn test_state_payload_formats() {
        assert_eq!(
            parse_state_payload(br#"{"state":"background"}"#),
            Some("background".to_string())
        );
        assert_eq!(
            parse_state_payload(b"  terminated\n"),
            Some("terminated".to_string())
        );
        assert_eq!(parse_state_payload(b"   "), None);
        assert_eq!(parse_state_payload(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_notification_copy_per_state() {
        let titles: Vec<String> = [
            LifecycleState::Background,
            LifecycleState::Hidden,
            LifecycleState::Terminated,
        ]
        .iter()
        .map(|s| Notification::for_state("token", *s).unwrap().title)
        .collect();
        assert_eq!(titles.len(), 3);
        assert_ne!(titles[0], titles[1]);
        assert_ne!(titles[1], titles[2]);

        let n = Notification::for_state("token", LifecycleState::Hidden).unwrap();
        assert_eq!(n.metadata.get("state").map(String::as_str), Some("hidden"));

        assert!(Notification::for_state("token", LifecycleState::Foreground).is_none());
        assert!(Notification::for_state("token", LifecycleState::Unknown).is_none());

        let test = Notification::test("token");
        assert_eq!(test.metadata.get("kind").map(String::as_str), Some("test"));
        assert!(!titles.contains(&test.title));
    }
}
