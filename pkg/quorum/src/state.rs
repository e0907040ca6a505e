use super::protos::{LogIndex, ServerId};

/// The three roles of the automaton, plus the terminal state entered when
/// the environment shuts down.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
	Follower,
	Candidate,
	Leader,
	Stopped,
}

/// A candidate's record of the election in progress. `heard_from` doubles
/// as the retransmission filter: servers that answered (either way) are
/// not solicited again.
pub struct VoteTally {
	num_votes: u64,
	heard_from: Vec<bool>,
}

impl VoteTally {
	/// Starts a tally with our own vote already counted.
	pub fn new(num_servers: u64, my_id: ServerId) -> VoteTally {
		let mut heard_from = vec![false; (num_servers + 1) as usize];
		heard_from[my_id as usize] = true;
		VoteTally {
			num_votes: 1,
			heard_from,
		}
	}

	pub fn heard(&self, id: ServerId) -> bool {
		self.heard_from[id as usize]
	}

	pub fn mark_heard(&mut self, id: ServerId) {
		self.heard_from[id as usize] = true;
	}

	/// Counts a granted vote. Returns false if this server was already
	/// counted (duplicate grants must not inflate the tally).
	pub fn record_grant(&mut self, id: ServerId) -> bool {
		if self.heard_from[id as usize] {
			return false;
		}
		self.heard_from[id as usize] = true;
		self.num_votes += 1;
		true
	}

	pub fn has_majority(&self, num_servers: u64) -> bool {
		2 * self.num_votes > num_servers
	}
}

/// Leader-side replication progress for a single server.
#[derive(Clone, Copy, Debug)]
pub struct ServerProgress {
	/// Highest index known to be replicated on that server.
	pub matched: LogIndex,

	/// Next index we will try to send it.
	pub next: LogIndex,
}

impl ServerProgress {
	pub fn new(last_log_index: LogIndex) -> ServerProgress {
		ServerProgress {
			matched: 0,
			next: last_log_index + 1,
		}
	}
}

/// One slot per server id, slot 0 unused, for O(1) lookup by id.
pub fn new_progress_table(num_servers: u64, last_log_index: LogIndex) -> Vec<ServerProgress> {
	vec![ServerProgress::new(last_log_index); (num_servers + 1) as usize]
}
