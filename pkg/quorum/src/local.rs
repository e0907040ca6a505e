use super::config::NodeConfig;
use super::consensus::Server;
use super::env::{Receive, ServerEnv, TimeoutKind};
use super::errors::*;
use super::protos::*;
use super::storage::Log;

use rand::Rng;
use std::cmp::{self, Ordering};
use std::fs;
use std::path::Path;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

/*
	An in-process cluster: one OS thread per server, mpsc channels as the
	network, receive deadlines as the timer source. This is the reference
	environment behind the demo binary and the integration tests; a real
	deployment would put a transport and timer of its own behind the same
	trait.
*/

enum Envelope {
	Peer(PeerMessage),
	Client(Submission),
	Shutdown,
}

/// A report emitted to the client surface by some server.
#[derive(Clone, Debug)]
pub struct Report {
	pub from: ServerId,
	pub kind: ReportKind,
	pub tag: MsgTag,
}

/// A committed entry as handed to the state machine of one server.
#[derive(Clone, Debug)]
pub struct Applied {
	pub from: ServerId,
	pub index: LogIndex,
	pub entry: LogEntry,
}

pub struct LocalEnv {
	id: ServerId,
	num_servers: u64,
	config: NodeConfig,
	log: Log,
	rx: Receiver<Envelope>,
	net: Vec<Sender<Envelope>>,
	reports: Sender<Report>,
	applied: Sender<Applied>,
	election_deadline: Option<Instant>,
	last_applied: LogIndex,
}

impl LocalEnv {
	/// A log failure leaves the node in an unknown half-persisted state;
	/// retrying could split what must be atomic, so the node dies here.
	fn fault(&self, error: &Error) -> ! {
		panic!("server {}: log failure: {}", self.id, error);
	}
}

impl ServerEnv for LocalEnv {
	fn num_servers(&self) -> u64 {
		self.num_servers
	}

	fn my_id(&self) -> ServerId {
		self.id
	}

	fn receive_messages(&mut self, inbox: &mut Inbox, kind: TimeoutKind) -> Receive {
		let (tick, observe_election) = match kind {
			TimeoutKind::None => (None, true),
			TimeoutKind::Votes => {
				(Some(Duration::from_millis(self.config.vote_retry_ms)), true)
			}
			TimeoutKind::Heartbeats => {
				(Some(Duration::from_millis(self.config.heartbeat_ms)), false)
			}
		};

		let election_deadline = if observe_election {
			self.election_deadline
		} else {
			None
		};
		let now = Instant::now();
		let tick_deadline = tick.map(|period| now + period);
		let wait_until = match (tick_deadline, election_deadline) {
			(Some(a), Some(b)) => Some(cmp::min(a, b)),
			(Some(a), None) => Some(a),
			(None, b) => b,
		};

		let received = match wait_until {
			Some(deadline) => {
				let now = Instant::now();
				if deadline <= now {
					Err(RecvTimeoutError::Timeout)
				} else {
					self.rx.recv_timeout(deadline - now)
				}
			}
			None => self.rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
		};

		match received {
			Ok(Envelope::Peer(msg)) => {
				inbox.from_server = Some(msg);
				Receive::Delivered
			}
			Ok(Envelope::Client(submission)) => {
				inbox.from_client = Some(submission);
				Receive::Delivered
			}
			Ok(Envelope::Shutdown) | Err(RecvTimeoutError::Disconnected) => Receive::Shutdown,
			Err(RecvTimeoutError::Timeout) => {
				if let Some(deadline) = election_deadline {
					if Instant::now() >= deadline {
						return Receive::ElectionTimeout;
					}
				}
				Receive::TickExpired
			}
		}
	}

	fn send_to_client(&mut self, kind: ReportKind, tag: MsgTag, _payload: Option<&Payload>) {
		let _ = self.reports.send(Report { from: self.id, kind, tag });
	}

	fn send_to_server(&mut self, dest: ServerId, kind: MsgKind, index: LogIndex, num_entries: u64) {
		let body = match kind {
			MsgKind::WantVote => {
				let last_index = self.log.last_index();
				PeerMessageBody::WantVote {
					last_index,
					last_term: self.log.entry(last_index).term_added,
				}
			}
			MsgKind::GrantVote => PeerMessageBody::GrantVote,
			MsgKind::DenyVote => PeerMessageBody::DenyVote,
			MsgKind::TryAppend => {
				let mut entries = Vec::with_capacity(num_entries as usize);
				for i in 0..num_entries {
					entries.push(self.log.entry(index + 1 + i));
				}
				PeerMessageBody::TryAppend {
					prev_index: index,
					prev_term: self.log.entry(index).term_added,
					commit: self.log.committed_index(),
					entries,
				}
			}
			MsgKind::AcceptAppend => PeerMessageBody::AcceptAppend { index, num_entries },
			MsgKind::RefuseAppend => PeerMessageBody::RefuseAppend { index, num_entries },
		};
		let msg = PeerMessage {
			sender_id: self.id,
			sender_term: self.log.current_term(),
			body,
		};
		// A send to a dead server is a message lost on the wire.
		let _ = self.net[dest as usize].send(Envelope::Peer(msg));
	}

	fn current_term(&self) -> Term {
		self.log.current_term()
	}

	fn update_term(&mut self, new_term: Term) -> Ordering {
		match self.log.update_term(new_term) {
			Ok(ordering) => ordering,
			Err(e) => self.fault(&e),
		}
	}

	fn can_vote_for(&self, candidate: ServerId) -> bool {
		self.log.can_vote_for(candidate)
	}

	fn record_vote(&mut self, candidate: ServerId) {
		if let Err(e) = self.log.record_vote(candidate) {
			self.fault(&e);
		}
	}

	fn advance_term_and_vote_for_self(&mut self) {
		if let Err(e) = self.log.advance_term_and_vote(self.id) {
			self.fault(&e);
		}
	}

	fn last_log_index(&self) -> LogIndex {
		self.log.last_index()
	}

	fn committed_index(&self) -> LogIndex {
		self.log.committed_index()
	}

	fn log_entry(&self, index: LogIndex) -> LogEntry {
		self.log.entry(index)
	}

	fn truncate_and_append_to_log(&mut self, at: LogIndex, entries: &[LogEntry]) {
		if let Err(e) = self.log.truncate_and_append(at, entries) {
			self.fault(&e);
		}
	}

	fn append_entry_to_log(&mut self, kind: EntryKind, tag: MsgTag, payload: Option<&Payload>) {
		let payload = match payload {
			Some(p) => *p,
			None => [0u8; PAYLOAD_SIZE],
		};
		let entry = LogEntry {
			term_added: self.log.current_term(),
			tag,
			kind,
			payload,
		};
		if let Err(e) = self.log.append(entry) {
			self.fault(&e);
		}
	}

	fn commit_log_entries(&mut self, up_to: LogIndex) {
		let committed = self.log.commit(up_to);
		while self.last_applied < committed {
			self.last_applied += 1;
			let _ = self.applied.send(Applied {
				from: self.id,
				index: self.last_applied,
				entry: self.log.entry(self.last_applied),
			});
		}
	}

	fn restart_timer(&mut self) {
		let ms = rand::thread_rng().gen_range(
			self.config.election_timeout_min_ms,
			self.config.election_timeout_max_ms + 1,
		);
		self.election_deadline = Some(Instant::now() + Duration::from_millis(ms));
	}
}

/// A running cluster of local servers.
pub struct LocalCluster {
	net: Vec<Sender<Envelope>>,
	pub reports: Receiver<Report>,
	pub applied: Receiver<Applied>,
	handles: Vec<thread::JoinHandle<()>>,
}

impl LocalCluster {
	/// Starts `servers` nodes, each with its own log under
	/// `base/<id>`. `template` supplies the timing parameters.
	pub fn start(base: &Path, servers: u64, template: &NodeConfig) -> Result<LocalCluster> {
		let (report_tx, report_rx) = channel();
		let (applied_tx, applied_rx) = channel();

		let mut net = Vec::with_capacity((servers + 1) as usize);
		let mut inboxes = Vec::with_capacity(servers as usize);
		{
			// Slot 0 is never sent to; park a closed channel there.
			let (unused, _) = channel();
			net.push(unused);
		}
		for _ in 1..=servers {
			let (tx, rx) = channel();
			net.push(tx);
			inboxes.push(rx);
		}

		let mut handles = Vec::with_capacity(servers as usize);
		for id in 1..=servers {
			let dir = base.join(id.to_string());
			fs::create_dir_all(&dir)?;
			let mut config = template.clone();
			config.id = id;
			config.dir = dir.clone();
			let env = LocalEnv {
				id,
				num_servers: servers,
				config,
				log: Log::open(&dir)?,
				rx: inboxes.remove(0),
				net: net.clone(),
				reports: report_tx.clone(),
				applied: applied_tx.clone(),
				election_deadline: None,
				last_applied: 0,
			};
			let handle = thread::Builder::new()
				.name(format!("server-{}", id))
				.spawn(move || {
					debug!("server {}: started", env.my_id());
					let mut server = Server::new(env);
					server.run();
				})
				.chain_err(|| "failed to spawn a server thread")?;
			handles.push(handle);
		}

		Ok(LocalCluster {
			net,
			reports: report_rx,
			applied: applied_rx,
			handles,
		})
	}

	/// Hands a client submission to the given server.
	pub fn submit(&self, to: ServerId, tag: MsgTag, payload: &[u8]) {
		let _ = self.net[to as usize].send(Envelope::Client(Submission {
			tag,
			payload: payload_from(payload),
		}));
	}

	/// Stops every server and waits for the threads to unwind.
	pub fn shutdown(self) {
		for tx in &self.net[1..] {
			let _ = tx.send(Envelope::Shutdown);
		}
		for handle in self.handles {
			let _ = handle.join();
		}
	}
}
