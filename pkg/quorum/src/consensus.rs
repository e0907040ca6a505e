use super::env::*;
use super::protos::*;
use super::state::*;

use std::cmp::{self, Ordering};

/*
	The server is a single-threaded cooperative automaton with three roles.
	Each role is a loop blocked on the environment's receive; the election
	timer is only observable inside a receive, so every handler body runs
	to completion against a quiescent timer. A role function returns the
	next role and the dispatcher re-enters it fresh.

	Role-local state (the candidate's tally, the leader's progress table)
	lives on the stack of the role function and dies with the role.
*/

pub struct Server<E> {
	env: E,
	state: State,
}

impl<E: ServerEnv> Server<E> {
	pub fn new(env: E) -> Server<E> {
		Server {
			env,
			state: State::Follower,
		}
	}

	pub fn state(&self) -> State {
		self.state
	}

	pub fn env(&self) -> &E {
		&self.env
	}

	pub fn into_env(self) -> E {
		self.env
	}

	/// Runs the automaton until the environment shuts down.
	pub fn run(&mut self) {
		while self.state != State::Stopped {
			self.step();
		}
	}

	/// Runs the current role until its next transition.
	pub fn step(&mut self) {
		self.state = match self.state {
			State::Follower => self.follower(),
			State::Candidate => self.candidate(),
			State::Leader => self.leader(),
			State::Stopped => State::Stopped,
		};
	}

	fn follower(&mut self) -> State {
		self.env.restart_timer();
		loop {
			let mut inbox = Inbox::default();
			match self.env.receive_messages(&mut inbox, TimeoutKind::None) {
				Receive::ElectionTimeout => return State::Candidate,
				Receive::Shutdown => return State::Stopped,
				Receive::Delivered | Receive::TickExpired => {}
			}

			if let Some(submission) = inbox.from_client.take() {
				self.env.send_to_client(ReportKind::NotLeader, submission.tag, None);
			}

			if let Some(msg) = inbox.from_server.take() {
				// A legitimate append (or heartbeat) and a granted vote
				// both push the next election further out.
				if self.follower_handle_msg(msg) {
					self.env.restart_timer();
				}
			}
		}
	}

	fn follower_handle_msg(&mut self, msg: PeerMessage) -> bool {
		let update = self.env.update_term(msg.sender_term);
		match msg.body {
			PeerMessageBody::WantVote { last_index, last_term } => {
				self.follower_handle_want_vote(update, msg.sender_id, last_index, last_term)
			}
			PeerMessageBody::TryAppend { prev_index, prev_term, commit, entries } => {
				self.follower_handle_try_append(
					update, msg.sender_id, prev_index, prev_term, commit, entries,
				)
			}
			// Vote and append replies can only be stragglers from a
			// previous role.
			PeerMessageBody::GrantVote
			| PeerMessageBody::DenyVote
			| PeerMessageBody::AcceptAppend { .. }
			| PeerMessageBody::RefuseAppend { .. } => false,
		}
	}

	fn follower_handle_want_vote(
		&mut self,
		update: Ordering,
		sender: ServerId,
		their_last_index: LogIndex,
		their_last_term: Term,
	) -> bool {
		let my_last_index = self.env.last_log_index();
		let my_last_term = self.env.log_entry(my_last_index).term_added;
		let up_to_date = their_last_term > my_last_term
			|| (their_last_term == my_last_term && their_last_index >= my_last_index);

		if update != Ordering::Less && self.env.can_vote_for(sender) && up_to_date {
			self.env.record_vote(sender);
			debug!("casting vote for server {}", sender);
			self.env.send_to_server(sender, MsgKind::GrantVote, 0, 0);
			true
		} else {
			self.env.send_to_server(sender, MsgKind::DenyVote, 0, 0);
			false
		}
	}

	fn follower_handle_try_append(
		&mut self,
		update: Ordering,
		sender: ServerId,
		prev_index: LogIndex,
		prev_term: Term,
		commit: LogIndex,
		entries: Vec<LogEntry>,
	) -> bool {
		let num_entries = entries.len() as u64;
		if update != Ordering::Less
			&& prev_index <= self.env.last_log_index()
			&& self.env.log_entry(prev_index).term_added == prev_term
		{
			self.env.truncate_and_append_to_log(prev_index, &entries);
			self.env.commit_log_entries(commit);
			self.env.send_to_server(sender, MsgKind::AcceptAppend, prev_index, num_entries);
			true
		} else {
			self.env.send_to_server(sender, MsgKind::RefuseAppend, prev_index, num_entries);
			// A same-term leader we refused is still the leader; only a
			// stale sender fails to defer the election.
			update != Ordering::Less
		}
	}

	fn candidate(&mut self) -> State {
		self.env.restart_timer();
		self.env.advance_term_and_vote_for_self();
		info!(
			"server {}: starting election for term {}",
			self.env.my_id(),
			self.env.current_term()
		);

		let num_servers = self.env.num_servers();
		let mut tally = VoteTally::new(num_servers, self.env.my_id());
		if tally.has_majority(num_servers) {
			return State::Leader;
		}

		self.solicit_votes(&tally);
		loop {
			let mut inbox = Inbox::default();
			loop {
				match self.env.receive_messages(&mut inbox, TimeoutKind::Votes) {
					Receive::TickExpired => self.solicit_votes(&tally),
					Receive::ElectionTimeout => return State::Candidate,
					Receive::Shutdown => return State::Stopped,
					Receive::Delivered => break,
				}
			}

			if let Some(submission) = inbox.from_client.take() {
				self.env.send_to_client(ReportKind::NotLeader, submission.tag, None);
			}

			if let Some(msg) = inbox.from_server.take() {
				let next = self.candidate_handle_msg(&mut tally, msg);
				if next != State::Candidate {
					return next;
				}
			}
		}
	}

	fn solicit_votes(&mut self, tally: &VoteTally) {
		for id in 1..=self.env.num_servers() {
			if !tally.heard(id) {
				self.env.send_to_server(id, MsgKind::WantVote, 0, 0);
			}
		}
	}

	fn candidate_handle_msg(&mut self, tally: &mut VoteTally, msg: PeerMessage) -> State {
		let update = self.env.update_term(msg.sender_term);
		if update == Ordering::Greater {
			return State::Follower;
		}
		let num_servers = self.env.num_servers();

		match msg.body {
			PeerMessageBody::WantVote { .. } => {
				// We already voted for ourselves this term.
				self.env.send_to_server(msg.sender_id, MsgKind::DenyVote, 0, 0);
			}
			PeerMessageBody::DenyVote => {
				if update == Ordering::Equal {
					tally.mark_heard(msg.sender_id);
				}
			}
			PeerMessageBody::GrantVote => {
				if update == Ordering::Equal
					&& tally.record_grant(msg.sender_id)
					&& tally.has_majority(num_servers)
				{
					return State::Leader;
				}
			}
			PeerMessageBody::TryAppend { prev_index, entries, .. } => {
				if update == Ordering::Equal {
					// A leader already exists in this term; yield and let
					// it resend.
					return State::Follower;
				}
				self.env.send_to_server(
					msg.sender_id,
					MsgKind::RefuseAppend,
					prev_index,
					entries.len() as u64,
				);
			}
			PeerMessageBody::AcceptAppend { .. } | PeerMessageBody::RefuseAppend { .. } => {}
		}

		State::Candidate
	}

	fn leader(&mut self) -> State {
		let my_id = self.env.my_id();
		let num_servers = self.env.num_servers();
		info!(
			"server {}: became leader in term {}",
			my_id,
			self.env.current_term()
		);

		self.env.send_to_client(ReportKind::BecameLeader, 0, None);

		// The commitment probe for this term: committing it drags every
		// earlier-term entry along with it.
		self.env.append_entry_to_log(EntryKind::Nop, 0, None);

		let top = self.env.last_log_index();
		let mut progress = new_progress_table(num_servers, top);
		progress[my_id as usize].matched = top;
		self.advance_commit(&progress, top);

		loop {
			let mut inbox = Inbox::default();
			loop {
				match self.env.receive_messages(&mut inbox, TimeoutKind::Heartbeats) {
					Receive::TickExpired => self.send_appends_to_all(&progress),
					Receive::Delivered => break,
					Receive::ElectionTimeout => {}
					Receive::Shutdown => return State::Stopped,
				}
			}

			if let Some(submission) = inbox.from_client.take() {
				self.leader_handle_client(&mut progress, submission);
			}

			if let Some(msg) = inbox.from_server.take() {
				let next = self.leader_handle_msg(&mut progress, msg);
				if next != State::Leader {
					return next;
				}
			}
		}
	}

	fn leader_handle_client(&mut self, progress: &mut [ServerProgress], submission: Submission) {
		self.env.append_entry_to_log(
			EntryKind::Normal,
			submission.tag,
			Some(&submission.payload),
		);
		let top = self.env.last_log_index();
		progress[self.env.my_id() as usize].matched = top;
		self.advance_commit(progress, top);
		self.send_appends_to_all(progress);
	}

	fn send_appends_to_all(&mut self, progress: &[ServerProgress]) {
		let my_id = self.env.my_id();
		let my_last_index = self.env.last_log_index();
		for id in 1..=self.env.num_servers() {
			if id == my_id {
				continue;
			}
			let p = &progress[id as usize];
			if p.next == 0 {
				panic!("leader: next index for server {} hit zero", id);
			}
			if p.next > my_last_index + 1 {
				panic!("leader: next index for server {} ran past the end of the log", id);
			}
			let num_send = cmp::min(my_last_index + 1 - p.next, MAX_APPEND_ENTRIES);
			self.env.send_to_server(id, MsgKind::TryAppend, p.next - 1, num_send);
		}
	}

	fn leader_handle_msg(&mut self, progress: &mut [ServerProgress], msg: PeerMessage) -> State {
		let update = self.env.update_term(msg.sender_term);
		if update == Ordering::Greater {
			info!("server {}: deposed by a newer term", self.env.my_id());
			return State::Follower;
		}

		match msg.body {
			PeerMessageBody::WantVote { .. } => {
				self.env.send_to_server(msg.sender_id, MsgKind::DenyVote, 0, 0);
			}
			PeerMessageBody::TryAppend { prev_index, entries, .. } => {
				self.env.send_to_server(
					msg.sender_id,
					MsgKind::RefuseAppend,
					prev_index,
					entries.len() as u64,
				);
			}
			PeerMessageBody::RefuseAppend { index, .. } => {
				if update == Ordering::Equal {
					// The refuse echoes the prev index we tried; retry
					// from there on the next heartbeat.
					let p = &mut progress[msg.sender_id as usize];
					if index < p.next {
						p.next = index;
					}
				}
			}
			PeerMessageBody::AcceptAppend { index, num_entries } => {
				if update == Ordering::Equal {
					let implied_matched = index + num_entries;
					let p = &mut progress[msg.sender_id as usize];
					if implied_matched > p.matched {
						p.matched = implied_matched;
					}
					if implied_matched + 1 > p.next {
						p.next = implied_matched + 1;
					}
					let start = progress[msg.sender_id as usize].matched;
					self.advance_commit(progress, start);
				}
			}
			PeerMessageBody::GrantVote | PeerMessageBody::DenyVote => {}
		}

		State::Leader
	}

	/// Walks down from `start` looking for the highest index that a
	/// majority has replicated, and commits it. Only entries added in the
	/// current term count directly; older ones commit by falling below a
	/// committed current-term entry.
	fn advance_commit(&mut self, progress: &[ServerProgress], start: LogIndex) {
		let current_term = self.env.current_term();
		let base = self.env.committed_index();
		let num_servers = self.env.num_servers();

		let mut j = start;
		while j > base && self.env.log_entry(j).term_added == current_term {
			let num_replicas = (1..=num_servers)
				.filter(|&id| progress[id as usize].matched >= j)
				.count() as u64;
			if 2 * num_replicas > num_servers {
				self.env.commit_log_entries(j);
				break;
			}
			j -= 1;
		}
	}
}
