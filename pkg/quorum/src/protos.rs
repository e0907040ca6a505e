use std::cmp;

/// Type used to uniquely identify each server in the cluster. Ids are
/// assigned 1..=num_servers; 0 is reserved as "no id".
pub type ServerId = u64;

pub type Term = u64;

/// 1-based position in the replicated log. 0 denotes "before the first
/// entry" and has an implicit term of 0.
pub type LogIndex = u64;

/// Opaque correlation id chosen by the client for a submission.
pub type MsgTag = u64;

/// Largest cluster we will track with flat per-server tables.
pub const MAX_SERVERS: u64 = 101;

/// Fixed size of every submission payload. Shorter client data is
/// zero-padded up to this.
pub const PAYLOAD_SIZE: usize = 200;

/// Upper bound on the number of entries carried by a single TryAppend.
pub const MAX_APPEND_ENTRIES: u64 = 10;

pub type Payload = [u8; PAYLOAD_SIZE];

/// Copies client data into a fixed payload, zero-padding or truncating.
pub fn payload_from(bytes: &[u8]) -> Payload {
	let mut payload = [0u8; PAYLOAD_SIZE];
	let n = cmp::min(bytes.len(), PAYLOAD_SIZE);
	payload[..n].copy_from_slice(&bytes[..n]);
	payload
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
	/// Does nothing but occupy a single log index. A new leader appends one
	/// of these at the start of its term so that the commit rule can reach
	/// entries left over from previous terms.
	Nop,

	/// Carries a client submission.
	Normal,
}

/// The format of a single entry in every server's log. Each entry occupies
/// exactly one log index.
#[derive(Clone, PartialEq, Debug)]
pub struct LogEntry {
	pub term_added: Term,
	pub tag: MsgTag,
	pub kind: EntryKind,
	pub payload: Payload,
}

impl LogEntry {
	pub fn nop(term_added: Term) -> LogEntry {
		LogEntry {
			term_added,
			tag: 0,
			kind: EntryKind::Nop,
			payload: [0u8; PAYLOAD_SIZE],
		}
	}

	pub fn normal(term_added: Term, tag: MsgTag, payload: Payload) -> LogEntry {
		LogEntry {
			term_added,
			tag,
			kind: EntryKind::Normal,
			payload,
		}
	}
}

/// Symbolic message kinds as handed to the environment's send operation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MsgKind {
	WantVote,
	GrantVote,
	DenyVote,

	TryAppend,
	AcceptAppend,
	RefuseAppend,
}

/// A message received from another server. The sender's current term rides
/// on every message; the remaining fields depend on the kind.
#[derive(Clone, Debug)]
pub struct PeerMessage {
	pub sender_id: ServerId,
	pub sender_term: Term,
	pub body: PeerMessageBody,
}

#[derive(Clone, Debug)]
pub enum PeerMessageBody {
	/// The sender is a candidate asking for our vote. Carries the position
	/// of the last entry in the sender's log for the up-to-date comparison.
	WantVote { last_index: LogIndex, last_term: Term },

	GrantVote,
	DenyVote,

	/// Replicate `entries` directly after the entry at `prev_index`, which
	/// the sender believes has term `prev_term`. `commit` is the sender's
	/// commit index. An empty `entries` is a heartbeat.
	TryAppend {
		prev_index: LogIndex,
		prev_term: Term,
		commit: LogIndex,
		entries: Vec<LogEntry>,
	},

	/// Both replies echo the request's `prev_index` and entry count so the
	/// leader can update its bookkeeping without retaining the request.
	AcceptAppend { index: LogIndex, num_entries: u64 },
	RefuseAppend { index: LogIndex, num_entries: u64 },
}

/// Reports sent back to the client surface.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReportKind {
	NotLeader,
	BecameLeader,
}

/// A client submission: an opaque tagged payload to be ordered by the
/// cluster.
#[derive(Clone, Debug)]
pub struct Submission {
	pub tag: MsgTag,
	pub payload: Payload,
}

/// One receive's worth of input. A single receive may deliver a client
/// message, a server message, or both.
#[derive(Default, Debug)]
pub struct Inbox {
	pub from_client: Option<Submission>,
	pub from_server: Option<PeerMessage>,
}
