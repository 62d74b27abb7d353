//! Wire types shared by the multicast protocol, the recovery protocol, and
//! the vote/heartbeat TCP messaging. Kept in one module, separate from the
//! state machines that interpret it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ServerId = u64;
pub type Term = u64;
pub type Pid = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QueryType {
    Select,
    Insert,
    Update,
    Delete,
}

/// Body a gateway (out of scope) posts to the current leader's `/write`.
#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub query_type: QueryType,
    pub table: String,
    pub query: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    pub pid: Pid,
}

/// {query, args, originating PID, query_type, table, source_node, message_id}.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MulticastMessage {
    pub query: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub pid: Pid,
    #[serde(rename = "queryType")]
    pub query_type: QueryType,
    pub table: String,
    #[serde(rename = "sourceNode")]
    pub source_node: String,
    #[serde(rename = "messageId")]
    pub message_id: String,
}

/// A single entry in the append-only transaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: Pid,
    #[serde(rename = "type")]
    pub entry_type: QueryType,
    pub table: String,
    pub query: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct LogStatus {
    #[serde(rename = "nodeId")]
    pub node_id: ServerId,
    #[serde(rename = "lastLogId")]
    pub last_log_id: Pid,
    #[serde(rename = "lastLogTimestamp")]
    pub last_log_timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub last_id: Option<Pid>,
}

/// Vote/heartbeat TCP messages, JSON-framed on port (8000+nodeId).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum PeerMessage {
    VoteRequest(VoteRequest),
    VoteResponse(VoteResponse),
    Heartbeat(Heartbeat),
    LeaderQuery,
    LeaderQueryResponse(LeaderQueryResponse),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: ServerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: Term,
    pub leader: ServerId,
}

/// Answer to a cold-starting node asking peers "who do you think is leader?"
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderQueryResponse {
    pub term: Term,
    pub leader: Option<ServerId>,
}
