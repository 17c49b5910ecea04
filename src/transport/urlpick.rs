//! Rotation over a peer's advertised URLs.

use crate::types::Urls;
use std::sync::RwLock;
use url::Url;

struct PickState {
    urls: Urls,
    picked: usize,
}

/// Tracks which of a peer's URLs the pipeline currently posts to.
///
/// `unreachable` advances only when the reported URL is still the current
/// one: two workers racing to report the same dead URL must not rotate the
/// picker past a working one.
pub(crate) struct UrlPicker {
    state: RwLock<PickState>,
}

impl UrlPicker {
    pub fn new(urls: Urls) -> UrlPicker {
        assert!(!urls.is_empty(), "picker needs at least one URL");
        UrlPicker {
            state: RwLock::new(PickState { urls, picked: 0 }),
        }
    }

    /// The URL posts currently go to.
    pub fn pick(&self) -> Url {
        let state = self.state.read().expect("picker lock poisoned");
        state.urls.as_slice()[state.picked].clone()
    }

    /// Reports `u` as unreachable, advancing to the next URL if `u` is
    /// still the current pick.
    pub fn unreachable(&self, u: &Url) {
        let mut state = self.state.write().expect("picker lock poisoned");
        if &state.urls.as_slice()[state.picked] == u {
            state.picked = (state.picked + 1) % state.urls.len();
        }
    }

    /// Replaces the URL list and starts over from the first entry.
    pub fn update(&self, urls: Urls) {
        assert!(!urls.is_empty(), "picker needs at least one URL");
        let mut state = self.state.write().expect("picker lock poisoned");
        state.urls = urls;
        state.picked = 0;
    }
}
