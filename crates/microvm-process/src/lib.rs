/// Unique identifier of one microVM under test.
///
/// Every host path, jail path and screen session name of an instance is derived
/// from this value, so it must stay stable for the instance's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MicrovmId(pub String);

impl MicrovmId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MicrovmId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MicrovmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Instance state as reported by the describe-instance endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InstanceState {
    #[serde(rename = "Not started")]
    NotStarted,
    Running,
    Paused,
}

/// Body of `GET /`.
///
/// Older hypervisor builds (and snapshots taken by them) only report the
/// boolean `started` field instead of `state`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct InstanceInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub state: Option<InstanceState>,
    #[serde(default)]
    pub started: Option<bool>,
    #[serde(default)]
    pub vmm_version: Option<String>,
    #[serde(default)]
    pub app_name: Option<String>,
}

/// Start state, tagged with the representation it was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartState {
    State(InstanceState),
    LegacyStarted(bool),
}

impl StartState {
    pub fn is_not_started(self) -> bool {
        match self {
            StartState::State(s) => s == InstanceState::NotStarted,
            StartState::LegacyStarted(started) => !started,
        }
    }

    pub fn is_running(self) -> bool {
        match self {
            StartState::State(s) => s == InstanceState::Running,
            StartState::LegacyStarted(started) => started,
        }
    }
}

impl InstanceInfo {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }

    /// `state` wins whenever present; `started` is only consulted when it is absent.
    pub fn start_state(&self) -> Option<StartState> {
        if let Some(state) = self.state {
            return Some(StartState::State(state));
        }
        self.started.map(StartState::LegacyStarted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn microvm_id_is_non_empty() {
        let id = MicrovmId::new();
        assert!(!id.0.is_empty());
        assert_ne!(id, MicrovmId::new());
    }

    #[test]
    fn parses_primary_state_field() {
        let info = InstanceInfo::parse(r#"{"id":"vm0","state":"Not started","vmm_version":"1.4.0"}"#)
            .unwrap();
        let st = info.start_state().unwrap();
        assert_eq!(st, StartState::State(InstanceState::NotStarted));
        assert!(st.is_not_started());
        assert!(!st.is_running());
    }

    #[test]
    fn falls_back_to_legacy_started_flag() {
        let info = InstanceInfo::parse(r#"{"id":"vm0","started":true}"#).unwrap();
        let st = info.start_state().unwrap();
        assert_eq!(st, StartState::LegacyStarted(true));
        assert!(st.is_running());
    }

    #[test]
    fn primary_field_is_not_overridden_by_legacy_flag() {
        let info = InstanceInfo::parse(r#"{"state":"Paused","started":true}"#).unwrap();
        let st = info.start_state().unwrap();
        assert_eq!(st, StartState::State(InstanceState::Paused));
        assert!(!st.is_running());
        assert!(!st.is_not_started());
    }

    #[test]
    fn missing_both_fields_is_none() {
        let info = InstanceInfo::parse(r#"{"id":"vm0"}"#).unwrap();
        assert!(info.start_state().is_none());
    }
}
