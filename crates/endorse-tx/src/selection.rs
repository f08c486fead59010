//! Endorser selection: combined-policy resolution plus randomized minimal-group choice.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use thiserror::Error;

use crate::{
    policy::{DEFAULT_MAX_ORG_GROUPS, Policy, PolicyError, missing_organizations},
    proposal::ChaincodeCall,
    providers::{Peer, PolicyLookupError, PolicyProvider},
};

/// Predicate applied to every live peer before group search.
pub trait PeerFilter: Send + Sync {
    /// Returns true when `peer` may be selected.
    fn accept(&self, peer: &Peer) -> bool;
}

impl<F> PeerFilter for F
where
    F: Fn(&Peer) -> bool + Send + Sync,
{
    fn accept(&self, peer: &Peer) -> bool {
        self(peer)
    }
}

/// Orders one organization's eligible peers; the first one is picked.
pub trait PeerSorter: Send + Sync {
    /// Compares two peers of the same organization.
    fn compare(&self, left: &Peer, right: &Peer) -> Ordering;
}

impl<F> PeerSorter for F
where
    F: Fn(&Peer, &Peer) -> Ordering + Send + Sync,
{
    fn compare(&self, left: &Peer, right: &Peer) -> Ordering {
        self(left, right)
    }
}

/// Rejects peers whose reported ledger height is below a floor.
///
/// Peers that report no height are accepted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct MinLedgerHeight(pub u64);

impl PeerFilter for MinLedgerHeight {
    fn accept(&self, peer: &Peer) -> bool {
        peer.ledger_height.is_none_or(|height| height >= self.0)
    }
}

/// Rejects peers by URL.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ExcludePeers {
    /// Excluded peer URLs.
    urls: HashSet<String>,
}

impl ExcludePeers {
    /// Creates an exclusion filter.
    #[must_use]
    pub fn new<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
        }
    }
}

impl PeerFilter for ExcludePeers {
    fn accept(&self, peer: &Peer) -> bool {
        !self.urls.contains(&peer.url)
    }
}

/// Sorter preferring the highest reported ledger height.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferHighestLedger;

impl PeerSorter for PreferHighestLedger {
    fn compare(&self, left: &Peer, right: &Peer) -> Ordering {
        right.ledger_height.cmp(&left.ledger_height)
    }
}

/// Per-call selection options.
#[derive(Clone, Default)]
pub struct SelectionOptions {
    /// Peer filter applied before group search.
    pub filter: Option<Arc<dyn PeerFilter>>,
    /// Sorter replacing random per-organization choice.
    pub sorter: Option<Arc<dyn PeerSorter>>,
}

impl SelectionOptions {
    /// Sets the peer filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Arc<dyn PeerFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Sets the peer sorter.
    #[must_use]
    pub fn with_sorter(mut self, sorter: Arc<dyn PeerSorter>) -> Self {
        self.sorter = Some(sorter);
        self
    }

    fn accepts(&self, peer: &Peer) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter.accept(peer))
    }
}

impl fmt::Debug for SelectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionOptions")
            .field("filter", &self.filter.is_some())
            .field("sorter", &self.sorter.is_some())
            .finish()
    }
}

/// Selection failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum SelectionError {
    /// No chaincode calls were supplied.
    #[error("no chaincode calls supplied for endorser selection")]
    NoCalls,
    /// A policy could not be fetched.
    #[error("failed to fetch endorsement policy: {source}")]
    Lookup {
        /// Provider error.
        source: PolicyLookupError,
    },
    /// A fetched policy could not be parsed.
    #[error(
        "invalid endorsement policy for chaincode `{chaincode_id}`{}: {source}",
        collection_suffix(.collection.as_deref())
    )]
    Policy {
        /// Chaincode whose policy failed.
        chaincode_id: String,
        /// Collection whose policy failed, if any.
        collection: Option<String>,
        /// Parser error.
        source: PolicyError,
    },
    /// Group expansion failed.
    #[error("failed to expand combined endorsement policy: {source}")]
    Expansion {
        /// Expansion error.
        source: PolicyError,
    },
    /// No candidate group has an eligible peer for every organization.
    #[error("no eligible peers for organizations {missing:?}")]
    NoEligiblePeers {
        /// Organizations lacking eligible peers.
        missing: BTreeSet<String>,
    },
}

fn collection_suffix(collection: Option<&str>) -> String {
    collection.map_or_else(String::new, |name| format!(" collection `{name}`"))
}

/// Selects endorsers for `policy` from the live organization-to-peers map.
///
/// Candidate organization groups are filtered to those whose every organization has an
/// eligible peer; among the smallest feasible groups one is picked uniformly at random,
/// then one peer per organization (random, or first after sorting when a sorter is set).
///
/// # Errors
///
/// Returns [`SelectionError::NoEligiblePeers`] when no group is feasible and
/// [`SelectionError::Expansion`] when the policy expands past `max_groups`.
pub fn select_for_policy<R>(
    policy: &Policy,
    live: &HashMap<String, Vec<Peer>>,
    options: &SelectionOptions,
    max_groups: usize,
    rng: &mut R,
) -> Result<Vec<Peer>, SelectionError>
where
    R: Rng + ?Sized,
{
    let eligible: HashMap<&str, Vec<&Peer>> = live
        .iter()
        .filter_map(|(org, peers)| {
            let accepted: Vec<&Peer> = peers.iter().filter(|peer| options.accepts(peer)).collect();
            (!accepted.is_empty()).then_some((org.as_str(), accepted))
        })
        .collect();

    let groups = policy
        .org_groups(max_groups)
        .map_err(|source| SelectionError::Expansion { source })?;
    let feasible: Vec<&BTreeSet<String>> = groups
        .iter()
        .filter(|group| group.iter().all(|org| eligible.contains_key(org.as_str())))
        .collect();
    let Some(smallest) = feasible.iter().map(|group| group.len()).min() else {
        let available: HashSet<String> = eligible.keys().map(|org| (*org).to_owned()).collect();
        let mut missing = missing_organizations(&groups, &available);
        if missing.is_empty() {
            missing = policy.organizations();
        }
        return Err(SelectionError::NoEligiblePeers { missing });
    };
    let candidates: Vec<&BTreeSet<String>> = feasible
        .into_iter()
        .filter(|group| group.len() == smallest)
        .collect();
    let Some(chosen) = candidates.choose(rng) else {
        return Err(SelectionError::NoEligiblePeers {
            missing: policy.organizations(),
        });
    };

    if chosen.is_empty() {
        // Trivially satisfied policy: one peer is still needed to simulate.
        let all: Vec<&Peer> = eligible.values().flatten().copied().collect();
        return pick_peer(all, options, rng).map_or_else(
            || {
                Err(SelectionError::NoEligiblePeers {
                    missing: BTreeSet::new(),
                })
            },
            |peer| Ok(vec![peer]),
        );
    }

    let mut selected = Vec::with_capacity(chosen.len());
    for org in chosen.iter() {
        let peers = eligible.get(org.as_str()).cloned().unwrap_or_default();
        match pick_peer(peers, options, rng) {
            Some(peer) => selected.push(peer),
            None => {
                return Err(SelectionError::NoEligiblePeers {
                    missing: BTreeSet::from([org.clone()]),
                });
            }
        }
    }
    Ok(selected)
}

fn pick_peer<R>(mut peers: Vec<&Peer>, options: &SelectionOptions, rng: &mut R) -> Option<Peer>
where
    R: Rng + ?Sized,
{
    if let Some(sorter) = &options.sorter {
        peers.sort_by(|left, right| sorter.compare(left, right));
        return peers.first().map(|peer| (*peer).clone());
    }
    peers.choose(rng).map(|peer| (*peer).clone())
}

/// Cache key for parsed policies.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct PolicyKey {
    /// Channel.
    channel_id: String,
    /// Chaincode.
    chaincode_id: String,
    /// Collection, `None` for the chaincode-level policy.
    collection: Option<String>,
}

/// Endorser selection engine with a read-mostly parsed-policy cache and injectable RNG.
pub struct SelectionEngine {
    /// Raw policy source.
    policies: Arc<dyn PolicyProvider>,
    /// Parsed policies; `None` marks a collection without its own policy.
    cache: RwLock<HashMap<PolicyKey, Option<Arc<Policy>>>>,
    /// Tie-break randomness.
    rng: Mutex<StdRng>,
    /// Group expansion cap.
    max_groups: usize,
}

impl fmt::Debug for SelectionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionEngine")
            .field("max_groups", &self.max_groups)
            .finish_non_exhaustive()
    }
}

impl SelectionEngine {
    /// Creates an engine seeded from OS entropy.
    #[must_use]
    pub fn new(policies: Arc<dyn PolicyProvider>) -> Self {
        Self {
            policies,
            cache: RwLock::new(HashMap::new()),
            rng: Mutex::new(StdRng::from_entropy()),
            max_groups: DEFAULT_MAX_ORG_GROUPS,
        }
    }

    /// Replaces the RNG with a deterministic seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Sets the group expansion cap (minimum 1).
    #[must_use]
    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups.max(1);
        self
    }

    /// Drops every cached policy.
    pub fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }

    /// Builds the AND of every chaincode and collection policy touched by `calls`.
    ///
    /// # Errors
    ///
    /// Any lookup or parse failure fails the whole combination.
    pub async fn combined_policy(
        &self,
        channel_id: &str,
        calls: &[ChaincodeCall],
    ) -> Result<Policy, SelectionError> {
        if calls.is_empty() {
            return Err(SelectionError::NoCalls);
        }
        let mut parts = Vec::new();
        for call in calls {
            if let Some(policy) = self.policy_for(channel_id, &call.chaincode_id, None).await? {
                parts.push(policy.as_ref().clone());
            }
            for collection in &call.collections {
                if let Some(policy) = self
                    .policy_for(channel_id, &call.chaincode_id, Some(collection))
                    .await?
                {
                    parts.push(policy.as_ref().clone());
                }
            }
        }
        Ok(Policy::all_of(parts))
    }

    /// Selects endorsers for `calls` from the live peer map.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError`] when policies cannot be resolved or no feasible group exists.
    pub async fn select_endorsers(
        &self,
        channel_id: &str,
        calls: &[ChaincodeCall],
        live: &HashMap<String, Vec<Peer>>,
        options: &SelectionOptions,
    ) -> Result<Vec<Peer>, SelectionError> {
        let policy = self.combined_policy(channel_id, calls).await?;
        let selected = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            select_for_policy(&policy, live, options, self.max_groups, &mut *rng)
        };
        match &selected {
            Ok(peers) => tracing::debug!(
                channel_id,
                policy = %policy,
                peers = ?peers.iter().map(|peer| peer.url.as_str()).collect::<Vec<_>>(),
                "selected endorsers"
            ),
            Err(error) => tracing::debug!(
                channel_id,
                policy = %policy,
                %error,
                "endorser selection failed"
            ),
        }
        selected
    }

    async fn policy_for(
        &self,
        channel_id: &str,
        chaincode_id: &str,
        collection: Option<&str>,
    ) -> Result<Option<Arc<Policy>>, SelectionError> {
        let key = PolicyKey {
            channel_id: channel_id.to_owned(),
            chaincode_id: chaincode_id.to_owned(),
            collection: collection.map(str::to_owned),
        };
        if let Ok(cache) = self.cache.read()
            && let Some(cached) = cache.get(&key)
        {
            return Ok(cached.clone());
        }

        let raw = match collection {
            None => Some(
                self.policies
                    .chaincode_policy(channel_id, chaincode_id)
                    .await
                    .map_err(|source| SelectionError::Lookup { source })?,
            ),
            Some(collection) => self
                .policies
                .collection_policy(channel_id, chaincode_id, collection)
                .await
                .map_err(|source| SelectionError::Lookup { source })?,
        };
        let parsed = raw
            .map(|text| {
                Policy::parse(&text).map_err(|source| SelectionError::Policy {
                    chaincode_id: chaincode_id.to_owned(),
                    collection: collection.map(str::to_owned),
                    source,
                })
            })
            .transpose()?
            .map(Arc::new);
        if let Ok(mut cache) = self.cache.write() {
            let _ = cache.insert(key, parsed.clone());
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{StaticPolicyProvider, peers_by_org};

    fn live(peers: &[Peer]) -> HashMap<String, Vec<Peer>> {
        peers_by_org(peers)
    }

    fn orgs_of(peers: &[Peer]) -> BTreeSet<String> {
        peers.iter().map(|peer| peer.msp_id.clone()).collect()
    }

    fn three_orgs() -> Vec<Peer> {
        vec![
            Peer::new("peer0.org1:7051", "Org1MSP"),
            Peer::new("peer0.org2:7051", "Org2MSP"),
            Peer::new("peer0.org3:7051", "Org3MSP"),
        ]
    }

    #[test]
    fn all_of_covers_exactly_required_orgs() {
        let policy = Policy::parse("AND('Org1MSP.member','Org2MSP.member')");
        assert!(policy.is_ok());
        let Ok(policy) = policy else {
            return;
        };
        let mut rng = StdRng::seed_from_u64(7);
        let peers = three_orgs();
        let selected = select_for_policy(
            &policy,
            &live(&peers),
            &SelectionOptions::default(),
            DEFAULT_MAX_ORG_GROUPS,
            &mut rng,
        );
        assert!(selected.is_ok());
        if let Ok(selected) = selected {
            assert_eq!(selected.len(), 2);
            assert_eq!(
                orgs_of(&selected),
                BTreeSet::from(["Org1MSP".to_owned(), "Org2MSP".to_owned()])
            );
        }
    }

    #[test]
    fn n_of_m_tie_break_uses_more_than_one_subset() {
        let policy =
            Policy::parse("OutOf(2, 'Org1MSP.member', 'Org2MSP.member', 'Org3MSP.member')");
        assert!(policy.is_ok());
        let Ok(policy) = policy else {
            return;
        };
        let peers = three_orgs();
        let live = live(&peers);
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let selected = select_for_policy(
                &policy,
                &live,
                &SelectionOptions::default(),
                DEFAULT_MAX_ORG_GROUPS,
                &mut rng,
            );
            assert!(selected.is_ok());
            if let Ok(selected) = selected {
                let orgs = orgs_of(&selected);
                assert_eq!(orgs.len(), 2);
                assert!(policy.satisfied_by(&orgs));
                let _ = seen.insert(orgs);
            }
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn filter_eliminating_required_org_fails_with_missing_org() {
        let policy = Policy::parse("AND('Org1MSP.member','Org2MSP.member')");
        assert!(policy.is_ok());
        let Ok(policy) = policy else {
            return;
        };
        let peers = three_orgs();
        let options = SelectionOptions::default()
            .with_filter(Arc::new(ExcludePeers::new(["peer0.org2:7051"])));
        let mut rng = StdRng::seed_from_u64(1);
        let selected =
            select_for_policy(&policy, &live(&peers), &options, DEFAULT_MAX_ORG_GROUPS, &mut rng);
        assert_eq!(
            selected,
            Err(SelectionError::NoEligiblePeers {
                missing: BTreeSet::from(["Org2MSP".to_owned()])
            })
        );
    }

    #[test]
    fn sorter_picks_first_peer_and_closure_filters_apply() {
        let policy = Policy::member("Org1MSP");
        let peers = vec![
            Peer::new("a", "Org1MSP").with_ledger_height(10),
            Peer::new("b", "Org1MSP").with_ledger_height(30),
            Peer::new("c", "Org1MSP").with_ledger_height(20),
            Peer::new("d", "Org1MSP").with_ledger_height(5),
        ];
        let options = SelectionOptions::default()
            .with_filter(Arc::new(|peer: &Peer| peer.url != "b"))
            .with_sorter(Arc::new(PreferHighestLedger));
        let mut rng = StdRng::seed_from_u64(3);
        let selected =
            select_for_policy(&policy, &live(&peers), &options, DEFAULT_MAX_ORG_GROUPS, &mut rng);
        assert!(selected.is_ok());
        if let Ok(selected) = selected {
            assert_eq!(
                selected.iter().map(|peer| peer.url.as_str()).collect::<Vec<_>>(),
                vec!["c"]
            );
        }

        let min_height = SelectionOptions::default().with_filter(Arc::new(MinLedgerHeight(25)));
        let selected = select_for_policy(
            &policy,
            &live(&peers),
            &min_height,
            DEFAULT_MAX_ORG_GROUPS,
            &mut rng,
        );
        assert!(matches!(selected, Ok(ref peers) if peers.len() == 1 && peers[0].url == "b"));
    }

    #[test]
    fn smallest_feasible_group_is_preferred() {
        let policy = Policy::parse("OR(AND('Org1MSP.member','Org2MSP.member'), 'Org3MSP.member')");
        assert!(policy.is_ok());
        let Ok(policy) = policy else {
            return;
        };
        let peers = three_orgs();
        let mut rng = StdRng::seed_from_u64(9);
        for _ in 0..16 {
            let selected = select_for_policy(
                &policy,
                &live(&peers),
                &SelectionOptions::default(),
                DEFAULT_MAX_ORG_GROUPS,
                &mut rng,
            );
            assert!(matches!(
                selected,
                Ok(ref peers) if peers.len() == 1 && peers[0].msp_id == "Org3MSP"
            ));
        }
    }

    #[tokio::test]
    async fn engine_combines_chaincode_and_collection_policies() {
        let provider = StaticPolicyProvider::new()
            .with_chaincode("cc1", "OR('Org1MSP.member','Org2MSP.member')")
            .with_chaincode("cc2", "'Org2MSP.peer'")
            .with_collection("cc1", "private", "'Org3MSP.member'");
        let engine = SelectionEngine::new(Arc::new(provider)).with_seed(11);
        let calls = vec![
            ChaincodeCall::new("cc1").with_collection("private"),
            ChaincodeCall::new("cc2").with_collection("no-override"),
        ];
        let peers = three_orgs();
        let selected = engine
            .select_endorsers("mychannel", &calls, &live(&peers), &SelectionOptions::default())
            .await;
        assert!(selected.is_ok());
        if let Ok(selected) = selected {
            assert_eq!(
                orgs_of(&selected),
                BTreeSet::from(["Org2MSP".to_owned(), "Org3MSP".to_owned()])
            );
        }
    }

    #[tokio::test]
    async fn any_unparsable_policy_fails_the_whole_selection() {
        let provider = StaticPolicyProvider::new()
            .with_chaincode("cc1", "'Org1MSP.member'")
            .with_chaincode("cc2", "AND('Org2MSP.member'");
        let engine = SelectionEngine::new(Arc::new(provider));
        let calls = vec![ChaincodeCall::new("cc1"), ChaincodeCall::new("cc2")];
        let peers = three_orgs();
        let selected = engine
            .select_endorsers("mychannel", &calls, &live(&peers), &SelectionOptions::default())
            .await;
        assert!(matches!(
            selected,
            Err(SelectionError::Policy { ref chaincode_id, .. }) if chaincode_id == "cc2"
        ));

        let unknown = engine
            .select_endorsers(
                "mychannel",
                &[ChaincodeCall::new("missing")],
                &live(&peers),
                &SelectionOptions::default(),
            )
            .await;
        assert!(matches!(unknown, Err(SelectionError::Lookup { .. })));
    }

    #[tokio::test]
    async fn admin_only_policy_has_no_eligible_peers() {
        let provider = StaticPolicyProvider::new().with_chaincode("cc1", "'Org1MSP.admin'");
        let engine = SelectionEngine::new(Arc::new(provider));
        let peers = three_orgs();
        let selected = engine
            .select_endorsers(
                "mychannel",
                &[ChaincodeCall::new("cc1")],
                &live(&peers),
                &SelectionOptions::default(),
            )
            .await;
        assert!(matches!(selected, Err(SelectionError::NoEligiblePeers { .. })));
    }
}
