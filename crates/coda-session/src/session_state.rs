//! State layer routing and merging.
use super::*;

/// Keys with this prefix live in the app-wide layer.
pub const APP_PREFIX: &str = "app:";
/// Keys with this prefix live in the per-user layer.
pub const USER_PREFIX: &str = "user:";
/// Keys with this prefix are scratch values and never persisted.
pub const TEMP_PREFIX: &str = "temp:";

#[derive(Debug, Clone, Default, PartialEq)]
/// A state delta routed to its three layers, prefixes stripped.
pub struct ScopedStateDelta {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl ScopedStateDelta {
    pub fn is_empty(&self) -> bool {
        self.app.is_empty() && self.user.is_empty() && self.session.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Public struct `StateLayers` used across coda components.
pub struct StateLayers {
    pub app: StateMap,
    pub user: StateMap,
    pub session: StateMap,
}

impl StateLayers {
    pub fn merged(&self) -> StateMap {
        merge_state_layers(&self.app, &self.user, &self.session)
    }
}

/// Splits a prefixed delta into app, user and session layers.
///
/// `temp:` keys are dropped.
pub fn split_state_delta(delta: &StateMap) -> ScopedStateDelta {
    let mut scoped = ScopedStateDelta::default();
    for (key, value) in delta {
        if let Some(stripped) = key.strip_prefix(APP_PREFIX) {
            scoped.app.insert(stripped.to_string(), value.clone());
        } else if let Some(stripped) = key.strip_prefix(USER_PREFIX) {
            scoped.user.insert(stripped.to_string(), value.clone());
        } else if key.starts_with(TEMP_PREFIX) {
            continue;
        } else {
            scoped.session.insert(key.clone(), value.clone());
        }
    }
    scoped
}

/// Removes transient `temp:` keys from a delta before it is persisted.
pub fn trim_temp_delta(delta: &mut StateMap) {
    delta.retain(|key, _| !key.starts_with(TEMP_PREFIX));
}

/// Overlays app, then user, then session state; later layers win.
pub fn merge_state_layers(app: &StateMap, user: &StateMap, session: &StateMap) -> StateMap {
    let mut merged = app.clone();
    for layer in [user, session] {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

pub(super) fn apply_layer_delta(target: &mut StateMap, delta: &StateMap) {
    for (key, value) in delta {
        target.insert(key.clone(), value.clone());
    }
}

pub(super) fn decode_state_map(raw: &str) -> CodaResult<StateMap> {
    if raw.trim().is_empty() {
        return Ok(StateMap::new());
    }
    serde_json::from_str(raw).with_code(ErrorCode::Internal, "failed to decode stored state")
}

pub(super) fn encode_state_map(state: &StateMap) -> CodaResult<String> {
    serde_json::to_string(state).with_code(ErrorCode::Internal, "failed to encode state")
}
