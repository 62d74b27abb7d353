//! Raft-like leader election over the membership snapshot. Terms and the
//! lowest-id-wins preemption rule follow the familiar election-timeout-jitter
//! and term/vote bookkeeping shape, expressed here as a plain
//! `tokio::sync::RwLock` guarding one state struct rather than a tick-driven
//! side-effect collector, matching the async style already used by the
//! membership registry: no file-scope globals, election state is a field of
//! a per-node context.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::membership_client::{MemberInfo, MembershipClient};
use crate::protos::{
    Heartbeat, LeaderQueryResponse, PeerMessage, ServerId, Term, VoteRequest, VoteResponse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone)]
pub struct ElectionState {
    pub term: Term,
    pub last_known_leader: Option<ServerId>,
    pub self_is_leader: bool,
    pub active_nodes: BTreeSet<ServerId>,
    pub votes_this_term: HashSet<ServerId>,
    pub last_heartbeat: Instant,
    /// True only while this node is itself soliciting votes in
    /// `run_election`. Distinct from `votes_this_term`, which also holds the
    /// single vote this node grants to someone else's candidacy.
    pub is_candidate: bool,
}

impl ElectionState {
    pub fn role(&self) -> Role {
        if self.self_is_leader {
            Role::Leader
        } else if self.is_candidate {
            Role::Candidate
        } else {
            Role::Follower
        }
    }
}

pub struct Election {
    self_id: ServerId,
    self_address: String,
    config: Arc<Config>,
    membership: Arc<MembershipClient>,
    state: RwLock<ElectionState>,
    addresses: RwLock<HashMap<ServerId, String>>,
}

impl Election {
    pub fn new(self_id: ServerId, config: Arc<Config>, membership: Arc<MembershipClient>) -> Self {
        let self_address = config.advertise_addr.clone();
        Election {
            self_id,
            self_address,
            config,
            membership,
            state: RwLock::new(ElectionState {
                term: 0,
                last_known_leader: None,
                self_is_leader: false,
                active_nodes: BTreeSet::new(),
                votes_this_term: HashSet::new(),
                last_heartbeat: Instant::now(),
                is_candidate: false,
            }),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub async fn snapshot(&self) -> ElectionState {
        self.state.read().await.clone()
    }

    pub async fn is_leader(&self) -> bool {
        self.state.read().await.self_is_leader
    }

    pub async fn current_leader(&self) -> Option<ServerId> {
        self.state.read().await.last_known_leader
    }

    pub async fn current_term(&self) -> Term {
        self.state.read().await.term
    }

    async fn peer_addr(&self, id: ServerId) -> Option<String> {
        let host_port = self.addresses.read().await.get(&id).cloned()?;
        Some(peer_tcp_addr(&host_port, id, self.config.tcp_port_base))
    }

    /// Vote-granting rule: grant iff the candidate's term is strictly
    /// newer, or equal and the candidate has a lower id and no vote has been
    /// cast yet this term.
    #[instrument(skip(self), fields(node_id = self.self_id))]
    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut state = self.state.write().await;
        let grant = if req.term > state.term {
            true
        } else {
            req.term == state.term && req.candidate_id < self.self_id && state.votes_this_term.is_empty()
        };

        if grant {
            state.term = req.term;
            state.self_is_leader = false;
            state.is_candidate = false;
            state.last_known_leader = Some(req.candidate_id);
            state.last_heartbeat = Instant::now();
            state.votes_this_term.clear();
            state.votes_this_term.insert(req.candidate_id);
            info!(term = req.term, candidate = req.candidate_id, "granted vote");
        } else {
            debug!(term = req.term, candidate = req.candidate_id, "denied vote");
        }

        VoteResponse { term: state.term, vote_granted: grant }
    }

    #[instrument(skip(self), fields(node_id = self.self_id))]
    pub async fn handle_heartbeat(&self, hb: Heartbeat) {
        let mut state = self.state.write().await;
        if hb.term >= state.term {
            let became_follower = state.self_is_leader && hb.leader != self.self_id;
            state.term = hb.term;
            state.self_is_leader = hb.leader == self.self_id;
            state.is_candidate = false;
            state.last_known_leader = Some(hb.leader);
            state.last_heartbeat = Instant::now();
            if became_follower {
                info!(term = hb.term, leader = hb.leader, "stepped down to follower");
            }
        }
    }

    pub async fn handle_leader_query(&self) -> LeaderQueryResponse {
        let state = self.state.read().await;
        LeaderQueryResponse { term: state.term, leader: state.last_known_leader }
    }

    async fn refresh_active_nodes(&self, members: &HashMap<ServerId, MemberInfo>) {
        let ids: BTreeSet<ServerId> = members.keys().copied().collect();
        let addrs: HashMap<ServerId, String> =
            members.iter().map(|(id, m)| (*id, m.address.clone())).collect();
        *self.addresses.write().await = addrs;
        self.state.write().await.active_nodes = ids;
    }

    /// The combined election/heartbeat/membership-poll loop: every
    /// `heartbeatInterval`, refresh membership, then either emit heartbeats
    /// (as leader) or check for a timed-out leader (as follower/candidate).
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.cold_start_recovery().await;

        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        loop {
            ticker.tick().await;

            match self.membership.members().await {
                Ok(members) => self.refresh_active_nodes(&members).await,
                Err(e) => warn!(error = %e, "failed to refresh membership snapshot"),
            }

            let (is_leader, timed_out) = {
                let state = self.state.read().await;
                (
                    state.self_is_leader,
                    state.last_heartbeat.elapsed() >= self.config.leader_timeout(),
                )
            };

            if let Err(e) = self.membership.keepalive(self.self_id, &self.self_address, is_leader).await {
                warn!(error = %e, "failed to refresh own membership lease");
            }

            if is_leader {
                self.emit_heartbeats().await;
            } else if timed_out {
                self.run_election().await;
            }
        }
    }

    #[instrument(skip(self), fields(node_id = self.self_id))]
    async fn emit_heartbeats(&self) {
        let (term, peers) = {
            let state = self.state.read().await;
            (state.term, state.active_nodes.iter().copied().filter(|id| *id != self.self_id).collect::<Vec<_>>())
        };

        for peer in peers {
            if let Some(addr) = self.peer_addr(peer).await {
                let msg = PeerMessage::Heartbeat(Heartbeat { term, leader: self.self_id });
                let timeout = self.config.http_timeout();
                tokio::spawn(async move {
                    if let Err(e) = send_peer_message(&addr, &msg, timeout).await {
                        debug!(peer, error = %e, "heartbeat send failed");
                    }
                });
            }
        }
    }

    #[instrument(skip(self), fields(node_id = self.self_id))]
    async fn run_election(self: &Arc<Self>) {
        let (jitter_min, jitter_max) = self.config.election_jitter();
        let span_ms = jitter_max.saturating_sub(jitter_min).as_millis() as u64;
        let jitter = jitter_min + Duration::from_millis(rand_range(span_ms));
        tokio::time::sleep(jitter).await;

        let (lower_id_active, active_nodes) = {
            let state = self.state.read().await;
            (
                state.active_nodes.iter().any(|id| *id < self.self_id),
                state.active_nodes.clone(),
            )
        };
        if lower_id_active {
            debug!("aborting election: a lower-id node is active");
            return;
        }

        let term = {
            let mut state = self.state.write().await;
            state.term += 1;
            state.votes_this_term.clear();
            state.votes_this_term.insert(self.self_id);
            state.is_candidate = true;
            state.term
        };
        info!(term, "starting election");

        let peers: Vec<ServerId> = active_nodes.into_iter().filter(|id| *id != self.self_id).collect();
        let total_active = peers.len() + 1;
        let majority = total_active / 2 + 1;
        if peers.is_empty() {
            self.become_leader(term).await;
            return;
        }

        let mut handles = Vec::with_capacity(peers.len());
        for peer in peers {
            if let Some(addr) = self.peer_addr(peer).await {
                let msg = PeerMessage::VoteRequest(VoteRequest { term, candidate_id: self.self_id });
                let timeout = self.config.http_timeout();
                handles.push(tokio::spawn(async move { send_peer_message(&addr, &msg, timeout).await }));
            }
        }

        let deadline = tokio::time::sleep(self.config.election_window());
        tokio::pin!(deadline);

        let mut votes = 1; // self-vote
        for handle in handles {
            tokio::select! {
                _ = &mut deadline => break,
                res = handle => {
                    if let Ok(Ok(PeerMessage::VoteResponse(VoteResponse { vote_granted: true, .. }))) = res {
                        votes += 1;
                    }
                }
            }
        }

        let still_current_term = self.state.read().await.term == term;
        if still_current_term && votes >= majority {
            self.become_leader(term).await;
        } else {
            let mut state = self.state.write().await;
            if state.term == term {
                state.is_candidate = false;
            }
            debug!(term, votes, majority, "election abandoned");
        }
    }

    async fn become_leader(&self, term: Term) {
        let mut state = self.state.write().await;
        if state.term != term {
            return;
        }
        state.self_is_leader = true;
        state.is_candidate = false;
        state.last_known_leader = Some(self.self_id);
        state.last_heartbeat = Instant::now();
        info!(term, "became leader");
    }

    /// Cold-start recovery: ask every known peer who they think the
    /// leader is before starting our own election, to avoid an unnecessary
    /// term bump right after boot.
    async fn cold_start_recovery(&self) {
        let members = match self.membership.members().await {
            Ok(m) => m,
            Err(_) => return,
        };
        self.refresh_active_nodes(&members).await;

        for (id, member) in members.iter() {
            if *id == self.self_id {
                continue;
            }
            let addr = peer_tcp_addr(&member.address, *id, self.config.tcp_port_base);
            if let Ok(PeerMessage::LeaderQueryResponse(resp)) =
                send_peer_message(&addr, &PeerMessage::LeaderQuery, self.config.http_timeout()).await
            {
                if let Some(leader) = resp.leader {
                    let mut state = self.state.write().await;
                    state.term = resp.term;
                    state.last_known_leader = Some(leader);
                    state.self_is_leader = leader == self.self_id;
                    state.last_heartbeat = Instant::now();
                    info!(leader, term = resp.term, "adopted leader from cold-start query");
                    return;
                }
            }
        }
    }

    /// Handles one inbound peer TCP connection: read a single JSON-line
    /// message, dispatch, write a single JSON-line reply.
    pub async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, LinesCodec::new());

        let Some(line) = framed.next().await else {
            return Ok(());
        };
        let msg: PeerMessage = serde_json::from_str(&line.map_err(|e| Error::ProtocolViolation(e.to_string()))?)?;

        let reply = match msg {
            PeerMessage::VoteRequest(req) => PeerMessage::VoteResponse(self.handle_vote_request(req).await),
            PeerMessage::Heartbeat(hb) => {
                self.handle_heartbeat(hb).await;
                PeerMessage::Heartbeat(Heartbeat { term: self.current_term().await, leader: self.self_id })
            }
            PeerMessage::LeaderQuery => PeerMessage::LeaderQueryResponse(self.handle_leader_query().await),
            other => return Err(Error::ProtocolViolation(format!("unexpected peer message: {other:?}"))),
        };

        framed.send(serde_json::to_string(&reply)?).await.map_err(|e| Error::Transient(e.to_string()))?;
        Ok(())
    }
}

fn rand_range(span: u64) -> u64 {
    if span == 0 {
        0
    } else {
        rand::random::<u64>() % span
    }
}

/// Derives a peer's vote/heartbeat TCP address from its advertised host:port
/// by swapping in `tcp_port_base + id`.
fn peer_tcp_addr(advertise_addr: &str, id: ServerId, tcp_port_base: u16) -> String {
    let host = advertise_addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(advertise_addr);
    format!("{host}:{}", tcp_port_base + id as u16)
}

async fn send_peer_message(addr: &str, msg: &PeerMessage, timeout: Duration) -> Result<PeerMessage> {
    tokio::time::timeout(timeout, send_peer_message_inner(addr, msg))
        .await
        .map_err(|_| Error::Transient(format!("peer request to {addr} timed out")))?
}

async fn send_peer_message_inner(addr: &str, msg: &PeerMessage) -> Result<PeerMessage> {
    let stream = TcpStream::connect(addr).await.map_err(|e| Error::Transient(e.to_string()))?;
    let mut framed = Framed::new(stream, LinesCodec::new());

    framed
        .send(serde_json::to_string(msg)?)
        .await
        .map_err(|e| Error::Transient(e.to_string()))?;

    let reply = framed
        .next()
        .await
        .ok_or_else(|| Error::Transient(format!("no reply from {addr}")))?
        .map_err(|e| Error::Transient(e.to_string()))?;
    Ok(serde_json::from_str(&reply)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn election(self_id: ServerId) -> Election {
        let config = Arc::new(Config::for_test(self_id));
        let membership = Arc::new(MembershipClient::new(&config.membership_host, config.http_timeout()));
        Election::new(self_id, config, membership)
    }

    #[tokio::test]
    async fn grants_vote_for_higher_term() {
        let e = election(2);
        let resp = e.handle_vote_request(VoteRequest { term: 1, candidate_id: 1 }).await;
        assert!(resp.vote_granted);
        assert_eq!(e.current_term().await, 1);
    }

    #[tokio::test]
    async fn denies_second_vote_same_term() {
        let e = election(3);
        let first = e.handle_vote_request(VoteRequest { term: 5, candidate_id: 1 }).await;
        assert!(first.vote_granted);
        let second = e.handle_vote_request(VoteRequest { term: 5, candidate_id: 2 }).await;
        assert!(!second.vote_granted);
    }

    #[tokio::test]
    async fn denies_vote_for_higher_id_same_term() {
        let e = election(1);
        {
            let mut state = e.state.write().await;
            state.term = 5;
        }
        let resp = e.handle_vote_request(VoteRequest { term: 5, candidate_id: 9 }).await;
        assert!(!resp.vote_granted);
    }

    #[tokio::test]
    async fn granting_a_vote_does_not_make_us_a_candidate() {
        let e = election(2);
        let resp = e.handle_vote_request(VoteRequest { term: 1, candidate_id: 1 }).await;
        assert!(resp.vote_granted);
        assert_eq!(e.snapshot().await.role(), Role::Follower);
    }

    #[tokio::test]
    async fn soliciting_votes_reports_candidate_until_resolved() {
        let e = election(1);
        {
            let mut state = e.state.write().await;
            state.term += 1;
            state.votes_this_term.clear();
            state.votes_this_term.insert(1);
            state.is_candidate = true;
        }
        assert_eq!(e.snapshot().await.role(), Role::Candidate);

        e.become_leader(e.current_term().await).await;
        assert_eq!(e.snapshot().await.role(), Role::Leader);
    }

    #[tokio::test]
    async fn heartbeat_from_higher_term_demotes_leader() {
        let e = election(1);
        {
            let mut state = e.state.write().await;
            state.self_is_leader = true;
            state.term = 3;
        }
        e.handle_heartbeat(Heartbeat { term: 4, leader: 2 }).await;
        assert!(!e.is_leader().await);
        assert_eq!(e.current_leader().await, Some(2));
        assert_eq!(e.current_term().await, 4);
    }

    #[test]
    fn peer_tcp_addr_swaps_port() {
        assert_eq!(peer_tcp_addr("10.0.0.1:8080", 3, 8000), "10.0.0.1:8003");
    }
}
