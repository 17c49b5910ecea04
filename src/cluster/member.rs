//! Cluster member model and identifier derivation.

use crate::types::{Id, Urls, UrlsError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::time::{SystemTime, UNIX_EPOCH};
use url::Url;

/// Member attributes that change only through Raft consensus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftAttributes {
    #[serde(rename = "peerURLs")]
    pub peer_urls: Vec<String>,
}

/// Attributes a member advertises about itself, applied outside consensus.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub name: String,
    #[serde(rename = "clientURLs", default)]
    pub client_urls: Vec<String>,
}

/// One participant in the cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct Member {
    id: Id,
    name: String,
    peer_urls: Urls,
    client_urls: Urls,
    created_at: Option<SystemTime>,
}

impl Member {
    /// Creates a member and derives its id.
    ///
    /// The id is a hash over the sorted peer URLs and the cluster name, so
    /// a member rebuilt with the same peer URLs (in any order) lands on the
    /// same id. A `created_at` folds the creation time in as well, which is
    /// how a member re-joining after destruction gets a distinct id. Names
    /// never participate.
    pub fn new(
        name: &str,
        peer_urls: Urls,
        cluster_name: &str,
        created_at: Option<SystemTime>,
    ) -> Member {
        assert!(!peer_urls.is_empty(), "member must have peer URLs");
        let id = derive_member_id(&peer_urls, cluster_name, created_at);
        Member {
            id,
            name: name.to_string(),
            peer_urls,
            client_urls: Urls::empty(),
            created_at,
        }
    }

    /// Rebuilds a member from its persisted attribute records.
    pub fn from_attributes(
        id: Id,
        raft_attrs: &RaftAttributes,
        attrs: &Attributes,
    ) -> Result<Member, UrlsError> {
        let peer_urls = Urls::parse(&raft_attrs.peer_urls)?;
        let client_urls = if attrs.client_urls.is_empty() {
            Urls::empty()
        } else {
            Urls::parse(&attrs.client_urls)?
        };
        Ok(Member {
            id,
            name: attrs.name.clone(),
            peer_urls,
            client_urls,
            created_at: None,
        })
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_urls(&self) -> &Urls {
        &self.peer_urls
    }

    pub fn client_urls(&self) -> &Urls {
        &self.client_urls
    }

    pub fn created_at(&self) -> Option<SystemTime> {
        self.created_at
    }

    /// A uniformly random peer URL, for join-time requests that have no
    /// failover state of their own.
    pub fn pick_peer_url(&self) -> &Url {
        self.peer_urls.pick_random()
    }

    pub fn raft_attributes(&self) -> RaftAttributes {
        RaftAttributes {
            peer_urls: self.peer_urls.string_slice(),
        }
    }

    pub fn attributes(&self) -> Attributes {
        Attributes {
            name: self.name.clone(),
            client_urls: self.client_urls.string_slice(),
        }
    }

    pub(crate) fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    pub(crate) fn set_client_urls(&mut self, urls: Urls) {
        self.client_urls = urls;
    }
}

fn derive_member_id(
    peer_urls: &Urls,
    cluster_name: &str,
    created_at: Option<SystemTime>,
) -> Id {
    let mut urls = peer_urls.string_slice();
    urls.sort();

    let mut b = Vec::new();
    for url in &urls {
        b.extend_from_slice(url.as_bytes());
    }
    b.extend_from_slice(cluster_name.as_bytes());
    if let Some(t) = created_at {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        b.extend_from_slice(secs.to_string().as_bytes());
    }

    let digest = Sha1::digest(&b);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    Id(u64::from_be_bytes(first))
}
