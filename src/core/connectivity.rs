//! Pairwise connectivity view.
//!
//! An entry `(observer, subject)` means the observer reports it is connected
//! to the subject. The pair `(s, s)` means we are connected to `s` at all;
//! absence of it marks `s` as unreachable from the coordinator, which the
//! visibility logic treats optimistically.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::identity::ServerId;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityMap {
    pairs: BTreeSet<(ServerId, ServerId)>,
}

impl ConnectivityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// A view in which every listed server sees every other (and itself).
    pub fn fully_connected(servers: impl IntoIterator<Item = ServerId> + Clone) -> Self {
        let mut map = Self::new();
        for observer in servers.clone() {
            for subject in servers.clone() {
                map.insert(observer, subject);
            }
        }
        map
    }

    pub fn insert(&mut self, observer: ServerId, subject: ServerId) {
        self.pairs.insert((observer, subject));
    }

    pub fn remove(&mut self, observer: ServerId, subject: ServerId) {
        self.pairs.remove(&(observer, subject));
    }

    pub fn can_see(&self, observer: ServerId, subject: ServerId) -> bool {
        self.pairs.contains(&(observer, subject))
    }
}
