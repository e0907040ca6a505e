use super::protos::*;
use std::cmp::Ordering;

/// Which tick, if any, bounds a receive, and whether the election timer is
/// observable while blocked.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimeoutKind {
	/// Block until a message arrives or the election timer fires.
	None,

	/// Bound the wait by the vote-retransmission tick. The election timer
	/// is still observable.
	Votes,

	/// Bound the wait by the heartbeat tick. The election timer is masked
	/// for the whole time a receive runs in this mode.
	Heartbeats,
}

/// Outcome of a single receive.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Receive {
	/// At least one message was placed into the inbox.
	Delivered,

	/// The mode's tick elapsed without anything to deliver.
	TickExpired,

	/// The election timer fired while blocked. Only possible for the
	/// `None` and `Votes` modes.
	ElectionTimeout,

	/// The environment is going away and the server loop must unwind.
	Shutdown,
}

/// Everything the server automaton needs from the outside world: cluster
/// topology, message I/O, the persistent term/vote/log state, and the
/// election timer. The automaton is written entirely against this trait so
/// that the transport and timer source stay out of the core.
///
/// Handler code between receives runs to completion; the election timer is
/// only ever observed inside `receive_messages`, so implementations never
/// interrupt a handler mid-mutation.
///
/// All persistence operations must make the change durable before
/// returning: the automaton sends messages exposing a state change only
/// after the call that persisted it has returned. A log I/O failure is not
/// recoverable; implementations must halt the node with a diagnostic
/// rather than retry.
pub trait ServerEnv {
	fn num_servers(&self) -> u64;
	fn my_id(&self) -> ServerId;

	/// Waits for input according to `kind` and fills `inbox` on delivery.
	fn receive_messages(&mut self, inbox: &mut Inbox, kind: TimeoutKind) -> Receive;

	fn send_to_client(&mut self, kind: ReportKind, tag: MsgTag, payload: Option<&Payload>);

	/// Sends one message to `dest`. The environment owns the wire format:
	/// it attaches our id and current term, and for `TryAppend` it reads
	/// the `num_entries` entries following `index` (and the term of the
	/// entry at `index`, and the commit index) directly from the log. For
	/// `AcceptAppend`/`RefuseAppend` the `index`/`num_entries` pair echoes
	/// the request being answered; other kinds ignore both.
	fn send_to_server(&mut self, dest: ServerId, kind: MsgKind, index: LogIndex, num_entries: u64);

	fn current_term(&self) -> Term;

	/// Compares `new_term` against the persistent current term. If it is
	/// newer, persists it, clears the vote, and returns `Greater`; returns
	/// `Equal` or `Less` without any mutation otherwise. A `Greater`
	/// result seen by a candidate or leader means it must step down.
	fn update_term(&mut self, new_term: Term) -> Ordering;

	/// Whether a vote for `candidate` is allowed in the current term: no
	/// vote cast yet, or the same candidate asking again.
	fn can_vote_for(&self, candidate: ServerId) -> bool;

	/// Persists a vote for `candidate` in the current term.
	fn record_vote(&mut self, candidate: ServerId);

	/// Atomically persists `current_term + 1` with a vote for ourselves.
	fn advance_term_and_vote_for_self(&mut self);

	fn last_log_index(&self) -> LogIndex;
	fn committed_index(&self) -> LogIndex;

	/// Returns the entry at `index`. Index 0 yields a synthetic entry with
	/// term 0. Asking for an index past the end of the log is a contract
	/// violation and may abort the node.
	fn log_entry(&self, index: LogIndex) -> LogEntry;

	/// Discards every entry after `at` and appends `entries` in their
	/// place, durably.
	fn truncate_and_append_to_log(&mut self, at: LogIndex, entries: &[LogEntry]);

	/// Appends one entry carrying the current term, durably. A `None`
	/// payload means all zeroes.
	fn append_entry_to_log(&mut self, kind: EntryKind, tag: MsgTag, payload: Option<&Payload>);

	/// Advances the commit index toward `up_to`, clamped to the end of the
	/// log and never backwards, and feeds newly committed entries to the
	/// state machine.
	fn commit_log_entries(&mut self, up_to: LogIndex);

	/// Re-arms the election timer with a fresh timeout and discards any
	/// expiry that fired but has not yet been observed.
	fn restart_timer(&mut self);
}
