//! In-memory cluster model: members, removal tombstones, cluster identity.

use crate::cluster::member::{Attributes, Member, RaftAttributes};
use crate::cluster::store::Store;
use crate::types::{Id, Urls, UrlsError};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

const STORE_MEMBERS_PREFIX: &str = "/0/members";
const STORE_REMOVED_MEMBERS_PREFIX: &str = "/0/removed_members";
const RAFT_ATTRIBUTES_SUFFIX: &str = "raftAttributes";
const ATTRIBUTES_SUFFIX: &str = "attributes";

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid initial-cluster entry {entry:?} (want name=url)")]
    InvalidEntry { entry: String },

    #[error("empty URL given for member {name:?}")]
    EmptyUrl { name: String },

    #[error(transparent)]
    Urls(#[from] UrlsError),

    #[error("member {name:?} exists with identical id {id}")]
    DuplicateId { id: Id, name: String },

    #[error("cannot assign ids: member count is unequal (have {have}, given {given})")]
    MemberCountMismatch { have: usize, given: usize },

    #[error("unmatched peer URLs while assigning member ids")]
    PeerUrlsMismatch,
}

/// A set of members that belong to the same Raft cluster.
///
/// Created without a store by the bootstrap resolver; the owning server
/// binds a store once the Raft log is initialized, after which membership
/// mutations are persisted as well as applied in memory.
pub struct Cluster {
    id: Id,
    name: String,
    members: HashMap<Id, Member>,
    // Ids of members removed from the cluster. A removed id is never reused.
    removed: HashSet<Id>,
    store: Option<Arc<dyn Store>>,
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("members", &self.members)
            .field("removed", &self.removed)
            .field("store", &self.store.as_ref().map(|_| "<dyn Store>"))
            .finish()
    }
}

impl Cluster {
    fn new(name: &str) -> Cluster {
        Cluster {
            id: Id::none(),
            name: name.to_string(),
            members: HashMap::new(),
            removed: HashSet::new(),
            store: None,
        }
    }

    /// Builds a cluster from an initial-cluster string of the form
    /// `name=url,name=url,...`. A repeated name contributes additional peer
    /// URLs to the same member, in first-occurrence order.
    pub fn new_from_string(name: &str, cluster: &str) -> Result<Cluster, ClusterError> {
        let mut c = Cluster::new(name);

        let mut groups: Vec<(String, Vec<String>)> = Vec::new();
        for entry in cluster.split(',') {
            let (member_name, url) =
                entry
                    .split_once('=')
                    .ok_or_else(|| ClusterError::InvalidEntry {
                        entry: entry.to_string(),
                    })?;
            if url.is_empty() {
                return Err(ClusterError::EmptyUrl {
                    name: member_name.to_string(),
                });
            }
            match groups.iter_mut().find(|(n, _)| n == member_name) {
                Some((_, urls)) => urls.push(url.to_string()),
                None => groups.push((member_name.to_string(), vec![url.to_string()])),
            }
        }

        for (member_name, urls) in groups {
            let purls = Urls::parse(&urls)?;
            let m = Member::new(&member_name, purls, &c.name, None);
            if c.members.contains_key(&m.id()) {
                return Err(ClusterError::DuplicateId {
                    id: m.id(),
                    name: member_name,
                });
            }
            c.members.insert(m.id(), m);
        }
        c.gen_id();
        Ok(c)
    }

    /// Rebuilds the cluster from persisted membership records.
    ///
    /// Malformed store content is a programming error and panics: the
    /// membership subtree is only ever written by this module.
    pub fn new_from_store(name: &str, store: Arc<dyn Store>) -> Cluster {
        let mut c = Cluster::new(name);

        let mut raft_attrs: HashMap<Id, RaftAttributes> = HashMap::new();
        let mut attrs: HashMap<Id, Attributes> = HashMap::new();
        let entries = store.get_prefix(STORE_MEMBERS_PREFIX).unwrap_or_default();
        for (key, value) in entries {
            let (id, suffix) = parse_member_key(&key)
                .unwrap_or_else(|| panic!("unexpected member store key {:?}", key));
            match suffix {
                RAFT_ATTRIBUTES_SUFFIX => {
                    let ra: RaftAttributes = serde_json::from_str(&value)
                        .unwrap_or_else(|e| panic!("unmarshal raftAttributes should never fail: {}", e));
                    raft_attrs.insert(id, ra);
                }
                ATTRIBUTES_SUFFIX => {
                    let a: Attributes = serde_json::from_str(&value)
                        .unwrap_or_else(|e| panic!("unmarshal attributes should never fail: {}", e));
                    attrs.insert(id, a);
                }
                _ => panic!("unexpected member store key {:?}", key),
            }
        }
        for (id, ra) in &raft_attrs {
            let a = attrs
                .get(id)
                .unwrap_or_else(|| panic!("member {} has no attributes record", id));
            let m = Member::from_attributes(*id, ra, a)
                .unwrap_or_else(|e| panic!("stored member {} should never fail to parse: {}", id, e));
            c.members.insert(*id, m);
        }

        let tombstones = store
            .get_prefix(STORE_REMOVED_MEMBERS_PREFIX)
            .unwrap_or_default();
        for (key, _) in tombstones {
            let hex = key
                .strip_prefix(STORE_REMOVED_MEMBERS_PREFIX)
                .and_then(|s| s.strip_prefix('/'))
                .unwrap_or_else(|| panic!("unexpected tombstone key {:?}", key));
            let id: Id = hex
                .parse()
                .unwrap_or_else(|e| panic!("tombstone key {:?} should never fail to parse: {}", key, e));
            c.removed.insert(id);
        }

        c.store = Some(store);
        c.gen_id();
        c
    }

    /// Adopts a membership view received from elsewhere, typically an
    /// existing peer answering `GET /members` at join time.
    pub fn new_from_members(name: &str, id: Id, members: Vec<Member>) -> Cluster {
        let mut c = Cluster::new(name);
        c.id = id;
        for m in members {
            c.members.insert(m.id(), m);
        }
        c
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members sorted by id.
    pub fn members(&self) -> Vec<&Member> {
        let mut out: Vec<&Member> = self.members.values().collect();
        out.sort_by_key(|m| m.id());
        out
    }

    pub fn member(&self, id: Id) -> Option<&Member> {
        self.members.get(&id)
    }

    /// The member with the given name, if any. Two live members sharing a
    /// name violates a cluster invariant and panics.
    pub fn member_by_name(&self, name: &str) -> Option<&Member> {
        let mut found: Option<&Member> = None;
        for m in self.members.values() {
            if m.name() == name {
                if found.is_some() {
                    panic!("two members with name {:?} exist in the cluster", name);
                }
                found = Some(m);
            }
        }
        found
    }

    /// Member ids in ascending order.
    pub fn member_ids(&self) -> Vec<Id> {
        let mut ids: Vec<Id> = self.members.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_id_removed(&self, id: Id) -> bool {
        self.removed.contains(&id)
    }

    /// All peer addresses, sorted in ascending lexicographical order.
    pub fn peer_urls(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .members
            .values()
            .flat_map(|m| m.peer_urls().string_slice())
            .collect();
        out.sort();
        out
    }

    /// All client addresses, sorted in ascending lexicographical order.
    pub fn client_urls(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .members
            .values()
            .flat_map(|m| m.client_urls().string_slice())
            .collect();
        out.sort();
        out
    }

    pub fn set_id(&mut self, id: Id) {
        self.id = id;
    }

    pub fn set_store(&mut self, store: Arc<dyn Store>) {
        self.store = Some(store);
    }

    /// Adds a new member.
    ///
    /// The id must be previously unseen (neither live nor removed) and the
    /// name unique among live members; a violation is a programming error
    /// on the caller's side and panics.
    pub fn add_member(&mut self, m: Member) {
        if self.members.contains_key(&m.id()) {
            panic!("member {} exists with identical id {}", m.name(), m.id());
        }
        if self.removed.contains(&m.id()) {
            panic!("member id {} was removed and cannot be reused", m.id());
        }
        if self.member_by_name(m.name()).is_some() {
            panic!("member with name {:?} already exists", m.name());
        }

        if let Some(store) = &self.store {
            let raft_attrs = serde_json::to_string(&m.raft_attributes())
                .unwrap_or_else(|e| panic!("marshal raftAttributes should never fail: {}", e));
            store
                .create(
                    &format!("{}/{}", member_store_key(m.id()), RAFT_ATTRIBUTES_SUFFIX),
                    &raft_attrs,
                )
                .unwrap_or_else(|e| panic!("add raftAttributes should never fail: {}", e));
            let attrs = serde_json::to_string(&m.attributes())
                .unwrap_or_else(|e| panic!("marshal attributes should never fail: {}", e));
            store
                .create(
                    &format!("{}/{}", member_store_key(m.id()), ATTRIBUTES_SUFFIX),
                    &attrs,
                )
                .unwrap_or_else(|e| panic!("add attributes should never fail: {}", e));
        }

        self.members.insert(m.id(), m);
        self.gen_id();
    }

    /// Removes a member and tombstones its id. The id must name a live
    /// member, or the call panics. Not reversible.
    pub fn remove_member(&mut self, id: Id) {
        if self.members.remove(&id).is_none() {
            panic!("removal of unknown member {}", id);
        }
        if let Some(store) = &self.store {
            store
                .delete_prefix(&member_store_key(id))
                .unwrap_or_else(|e| panic!("delete member should never fail: {}", e));
            store
                .create(&removed_member_store_key(id), "")
                .unwrap_or_else(|e| panic!("creating tombstone should never fail: {}", e));
        }
        self.removed.insert(id);
        self.gen_id();
    }

    /// Replaces the client-URL list of a live member. Updating an unknown
    /// member is a programming error and panics.
    pub fn update_attributes(&mut self, id: Id, client_urls: Urls) {
        let m = self
            .members
            .get_mut(&id)
            .unwrap_or_else(|| panic!("update of unknown member {}", id));
        m.set_client_urls(client_urls);
        if let Some(store) = &self.store {
            let attrs = serde_json::to_string(&m.attributes())
                .unwrap_or_else(|e| panic!("marshal attributes should never fail: {}", e));
            store
                .set(
                    &format!("{}/{}", member_store_key(id), ATTRIBUTES_SUFFIX),
                    &attrs,
                )
                .unwrap_or_else(|e| panic!("update attributes should never fail: {}", e));
        }
    }

    /// Validates the given members against the existing ones by peer URLs
    /// and transplants their ids across. Used when bootstrapping from a
    /// snapshot whose ids differ from the locally derived ones.
    pub fn validate_and_assign_ids(&mut self, mut members: Vec<Member>) -> Result<(), ClusterError> {
        if self.members.len() != members.len() {
            return Err(ClusterError::MemberCountMismatch {
                have: self.members.len(),
                given: members.len(),
            });
        }
        let mut own: Vec<Member> = self.members.values().cloned().collect();
        own.sort_by_key(|m| m.peer_urls().string_slice());
        members.sort_by_key(|m| m.peer_urls().string_slice());

        for (o, n) in own.iter_mut().zip(&members) {
            if o.peer_urls().string_slice() != n.peer_urls().string_slice() {
                return Err(ClusterError::PeerUrlsMismatch);
            }
            o.set_id(n.id());
        }
        self.members = own.into_iter().map(|m| (m.id(), m)).collect();
        self.gen_id();
        Ok(())
    }

    /// Derives the cluster id from the sorted set of member ids.
    fn gen_id(&mut self) {
        let ids = self.member_ids();
        let mut b = Vec::with_capacity(ids.len() * 8);
        for id in ids {
            b.extend_from_slice(&id.0.to_be_bytes());
        }
        let digest = Sha1::digest(&b);
        let mut first = [0u8; 8];
        first.copy_from_slice(&digest[..8]);
        self.id = Id(u64::from_be_bytes(first));
    }
}

impl fmt::Display for Cluster {
    /// The canonical `name=url,...` form, sorted lexicographically.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut entries: Vec<String> = self
            .members
            .values()
            .flat_map(|m| {
                m.peer_urls()
                    .string_slice()
                    .into_iter()
                    .map(move |u| format!("{}={}", m.name(), u))
            })
            .collect();
        entries.sort();
        write!(f, "{}", entries.join(","))
    }
}

fn member_store_key(id: Id) -> String {
    format!("{}/{}", STORE_MEMBERS_PREFIX, id.padded_hex())
}

fn removed_member_store_key(id: Id) -> String {
    format!("{}/{}", STORE_REMOVED_MEMBERS_PREFIX, id.padded_hex())
}

fn parse_member_key(key: &str) -> Option<(Id, &str)> {
    let rest = key.strip_prefix(STORE_MEMBERS_PREFIX)?.strip_prefix('/')?;
    let (hex, suffix) = rest.split_once('/')?;
    Some((hex.parse().ok()?, suffix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::store::MemStore;

    fn urls(list: &[&str]) -> Urls {
        Urls::parse(list).unwrap()
    }

    #[test]
    fn test_static_bootstrap_groups_repeated_names() {
        let c = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n1=http://10.0.0.2:2380,n2=http://10.0.0.3:2380",
        )
        .unwrap();

        assert_eq!(c.name(), "etcd");
        assert_eq!(c.members().len(), 2);

        let n1 = c.member_by_name("n1").unwrap();
        assert_eq!(
            n1.peer_urls().string_slice(),
            vec!["http://10.0.0.1:2380", "http://10.0.0.2:2380"]
        );
        let n2 = c.member_by_name("n2").unwrap();
        assert_eq!(n2.peer_urls().string_slice(), vec!["http://10.0.0.3:2380"]);
        assert!(!c.id().is_none());
    }

    #[test]
    fn test_bootstrap_is_deterministic() {
        let s = "n1=http://10.0.0.1:2380,n1=http://10.0.0.2:2380,n2=http://10.0.0.3:2380";
        let a = Cluster::new_from_string("etcd", s).unwrap();
        let b = Cluster::new_from_string("etcd", s).unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(a.member_ids(), b.member_ids());
    }

    #[test]
    fn test_cluster_id_depends_only_on_member_id_set() {
        // Reordering whole entries (and URLs within a same-name group does
        // not change ids either) must leave the cluster id unchanged.
        let a = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.3:2380",
        )
        .unwrap();
        let b = Cluster::new_from_string(
            "etcd",
            "n2=http://10.0.0.3:2380,n1=http://10.0.0.1:2380",
        )
        .unwrap();
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        // Two names over the same URL derive the same id: names never
        // participate in the derivation.
        let err = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.1:2380",
        )
        .unwrap_err();
        assert!(matches!(err, ClusterError::DuplicateId { .. }));
    }

    #[test]
    fn test_empty_url_is_rejected() {
        let err = Cluster::new_from_string("etcd", "n1=").unwrap_err();
        assert!(matches!(err, ClusterError::EmptyUrl { .. }));

        let err = Cluster::new_from_string("etcd", "n1").unwrap_err();
        assert!(matches!(err, ClusterError::InvalidEntry { .. }));
    }

    #[test]
    #[should_panic(expected = "cannot be reused")]
    fn test_removed_id_is_never_reused() {
        let mut c =
            Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380")
                .unwrap();
        let doomed = c.member_by_name("n2").unwrap().clone();
        c.remove_member(doomed.id());
        // Same peer URLs, no creation time: identical id.
        let back = Member::new("n3", urls(&["http://10.0.0.2:2380"]), "etcd", None);
        c.add_member(back);
    }

    #[test]
    #[should_panic(expected = "identical id")]
    fn test_duplicate_add_panics() {
        let mut c = Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380").unwrap();
        let dup = Member::new("other", urls(&["http://10.0.0.1:2380"]), "etcd", None);
        c.add_member(dup);
    }

    #[test]
    #[should_panic(expected = "removal of unknown member")]
    fn test_remove_unknown_member_panics() {
        let mut c = Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380").unwrap();
        c.remove_member(Id(42));
    }

    #[test]
    fn test_add_member_regenerates_cluster_id() {
        let mut c = Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380").unwrap();
        let before = c.id();
        c.add_member(Member::new(
            "n2",
            urls(&["http://10.0.0.2:2380"]),
            "etcd",
            None,
        ));
        assert_ne!(c.id(), before);
    }

    #[test]
    fn test_string_form_is_sorted() {
        let c = Cluster::new_from_string(
            "etcd",
            "n2=http://10.0.0.3:2380,n1=http://10.0.0.1:2380",
        )
        .unwrap();
        assert_eq!(
            c.to_string(),
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.3:2380"
        );
    }

    #[test]
    fn test_store_roundtrip_preserves_member_set() {
        let parsed = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n1=http://10.0.0.2:2380,n2=http://10.0.0.3:2380",
        )
        .unwrap();
        let members: Vec<Member> = parsed.members().into_iter().cloned().collect();

        let store = Arc::new(MemStore::new());
        let mut bound = Cluster::new("etcd");
        bound.set_store(store.clone());
        for m in &members {
            bound.add_member(m.clone());
        }

        let rebuilt = Cluster::new_from_store("etcd", store);
        assert_eq!(rebuilt.member_ids(), parsed.member_ids());
        assert_eq!(rebuilt.id(), parsed.id());
        for m in &members {
            let got = rebuilt.member(m.id()).expect("member survives roundtrip");
            assert_eq!(got.name(), m.name());
            assert_eq!(
                got.peer_urls().string_slice(),
                m.peer_urls().string_slice()
            );
        }
    }

    #[test]
    fn test_store_records_tombstones() {
        let parsed = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380",
        )
        .unwrap();
        let members: Vec<Member> = parsed.members().into_iter().cloned().collect();

        let store = Arc::new(MemStore::new());
        let mut c = Cluster::new("etcd");
        c.set_store(store.clone());
        for m in members {
            c.add_member(m);
        }

        let doomed = c.member_by_name("n2").unwrap().id();
        c.remove_member(doomed);

        let rebuilt = Cluster::new_from_store("etcd", store);
        assert!(rebuilt.member(doomed).is_none());
        assert!(rebuilt.is_id_removed(doomed));
    }

    #[test]
    fn test_update_attributes_touches_only_client_urls() {
        let mut c = Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380").unwrap();
        let id = c.member_by_name("n1").unwrap().id();
        c.update_attributes(id, urls(&["http://10.0.0.1:2379"]));
        let m = c.member(id).unwrap();
        assert_eq!(m.client_urls().string_slice(), vec!["http://10.0.0.1:2379"]);
        assert_eq!(m.peer_urls().string_slice(), vec!["http://10.0.0.1:2380"]);
    }

    #[test]
    fn test_validate_and_assign_ids() {
        let mut c = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380",
        )
        .unwrap();

        let mut a = Member::new("n1", urls(&["http://10.0.0.1:2380"]), "other", None);
        let mut b = Member::new("n2", urls(&["http://10.0.0.2:2380"]), "other", None);
        a.set_id(Id(7));
        b.set_id(Id(8));
        c.validate_and_assign_ids(vec![a, b]).unwrap();

        assert_eq!(c.member_ids(), vec![Id(7), Id(8)]);
        assert_eq!(
            c.member(Id(7)).unwrap().peer_urls().string_slice(),
            vec!["http://10.0.0.1:2380"]
        );
    }

    #[test]
    fn test_validate_and_assign_ids_rejects_mismatch() {
        let mut c = Cluster::new_from_string("etcd", "n1=http://10.0.0.1:2380").unwrap();

        let err = c.validate_and_assign_ids(vec![]).unwrap_err();
        assert!(matches!(err, ClusterError::MemberCountMismatch { .. }));

        let other = Member::new("n1", urls(&["http://10.9.9.9:2380"]), "etcd", None);
        let err = c.validate_and_assign_ids(vec![other]).unwrap_err();
        assert!(matches!(err, ClusterError::PeerUrlsMismatch));
    }
}
