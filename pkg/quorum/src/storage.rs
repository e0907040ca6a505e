use super::errors::*;
use super::protos::*;

use byteorder::{BigEndian, ByteOrder};
use fs2::FileExt;
use std::cmp;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

/*
	The persistent state of one server lives in two files under its node
	directory:

	- `primary`: a 24 byte header followed by fixed-stride entry records.
	  The header is three big-endian words: the vote word (high bit set
	  while a vote is recorded, low bits the voted-for id), the current
	  term, and the number of entries.

	- `undo`: empty whenever no mutation is in flight. Before any change
	  that would leave `primary` transiently inconsistent, the bytes about
	  to be overwritten are recorded here and flushed. Only then is
	  `primary` touched; once it is flushed, `undo` is truncated again. A
	  crash at any point leaves an `undo` that either fully describes the
	  rollback or is discardably incomplete.

	The undo file comes in two shapes, distinguished by the high bit of its
	first word: exactly 24 bytes (header rollback only), or 24 + 16 bytes
	of secondary header (entries_start, entries_len) followed by exactly
	entries_len saved records.
*/

pub const LOG_HEADER_SIZE: usize = 24;
const UNDO_SECONDARY_SIZE: usize = 16;

/// On-disk and in-memory stride of one entry record: term (8), tag (8),
/// kind (1), payload (200), zero padding (7).
pub const ENTRY_SIZE: usize = 224;
const ENTRY_PAD: usize = ENTRY_SIZE - (8 + 8 + 1 + PAYLOAD_SIZE);

/// High bit of the first header word. In `primary` it marks a recorded
/// vote; in `undo` it marks that saved entry records follow the header.
const HIGH_BIT: u64 = 1 << 63;

const FILE_MODE: u32 = 0o644;

/// Handle on one server's persistent log. Owns the exclusive lock on the
/// node directory's primary file for as long as it lives; dropping it
/// closes both descriptors and releases the lock.
pub struct Log {
	primary: File,
	undo: File,

	// In-memory mirror of the persistent state. Between mutations this is
	// byte-for-byte what a fresh load of `primary` would produce.
	term: Term,
	voted_for: Option<ServerId>,
	entries: Vec<LogEntry>,

	// Volatile; resets to 0 on every open.
	commit_index: LogIndex,
}

impl Log {
	/// Opens (or creates) the log under `dir`, recovers from any
	/// interrupted mutation, and loads the entries. Fails with
	/// `ErrorKind::LogLocked` if another instance holds the lock.
	pub fn open(dir: &Path) -> Result<Log> {
		let primary = open_log_file(&dir.join("primary"))?;
		if primary.try_lock_exclusive().is_err() {
			return Err(ErrorKind::LogLocked(dir.to_owned()).into());
		}
		let undo = open_log_file(&dir.join("undo"))?;

		let mut log = Log {
			primary,
			undo,
			term: 0,
			voted_for: None,
			entries: Vec::new(),
			commit_index: 0,
		};
		log.recover()?;
		log.load()?;
		Ok(log)
	}

	pub fn current_term(&self) -> Term {
		self.term
	}

	pub fn voted_for(&self) -> Option<ServerId> {
		self.voted_for
	}

	pub fn can_vote_for(&self, candidate: ServerId) -> bool {
		match self.voted_for {
			Some(id) => id == candidate,
			None => true,
		}
	}

	pub fn last_index(&self) -> LogIndex {
		self.entries.len() as LogIndex
	}

	pub fn committed_index(&self) -> LogIndex {
		self.commit_index
	}

	/// Entry at a 1-based index. Index 0 yields a synthetic term-0 entry.
	pub fn entry(&self, index: LogIndex) -> LogEntry {
		if index == 0 {
			return LogEntry::nop(0);
		}
		self.entries[(index - 1) as usize].clone()
	}

	/// Compares and possibly adopts a term seen on the wire. Adopting a
	/// newer term clears the vote; both are persisted in one step.
	pub fn update_term(&mut self, new_term: Term) -> Result<cmp::Ordering> {
		if new_term > self.term {
			self.set_term_and_vote(new_term, None)?;
			Ok(cmp::Ordering::Greater)
		} else if new_term == self.term {
			Ok(cmp::Ordering::Equal)
		} else {
			Ok(cmp::Ordering::Less)
		}
	}

	pub fn record_vote(&mut self, candidate: ServerId) -> Result<()> {
		self.set_term_and_vote(self.term, Some(candidate))
	}

	pub fn advance_term_and_vote(&mut self, my_id: ServerId) -> Result<()> {
		self.set_term_and_vote(self.term + 1, Some(my_id))
	}

	/// Appends a single entry at the end of the log. Only the header needs
	/// undo protection: record bytes past the logical end are dead until
	/// the new header lands.
	pub fn append(&mut self, entry: LogEntry) -> Result<LogIndex> {
		self.begin_undo_header_only()?;

		let offset = entry_offset(self.entries.len() as LogIndex);
		let mut record = [0u8; ENTRY_SIZE];
		encode_entry(&entry, &mut record);
		self.primary.seek(SeekFrom::Start(offset))?;
		self.primary.write_all(&record)?;
		self.entries.push(entry);
		self.write_header()?;

		self.discard_undo()?;
		Ok(self.entries.len() as LogIndex)
	}

	/// Discards every entry after `at` and appends `entries` in their
	/// place. The records being destroyed are saved to the undo file
	/// first, so a crash anywhere in here rolls back to the old log.
	pub fn truncate_and_append(&mut self, at: LogIndex, entries: &[LogEntry]) -> Result<()> {
		if at > self.entries.len() as LogIndex {
			bail!("truncation point {} is past the end of the log ({})", at, self.entries.len());
		}
		self.begin_undo_with_entries(at)?;

		let mut records = Vec::with_capacity(entries.len() * ENTRY_SIZE);
		for entry in entries {
			let mut record = [0u8; ENTRY_SIZE];
			encode_entry(entry, &mut record);
			records.extend_from_slice(&record);
		}
		self.primary.seek(SeekFrom::Start(entry_offset(at)))?;
		self.primary.write_all(&records)?;

		self.entries.truncate(at as usize);
		self.entries.extend_from_slice(entries);
		self.primary.set_len(entry_offset(self.entries.len() as LogIndex))?;
		self.write_header()?;

		self.discard_undo()
	}

	/// Advances the volatile commit index toward `up_to`, clamped to the
	/// end of the log and never backwards. Returns the new value.
	pub fn commit(&mut self, up_to: LogIndex) -> LogIndex {
		let capped = cmp::min(up_to, self.entries.len() as LogIndex);
		if capped > self.commit_index {
			self.commit_index = capped;
		}
		self.commit_index
	}

	fn set_term_and_vote(&mut self, term: Term, voted_for: Option<ServerId>) -> Result<()> {
		self.begin_undo_header_only()?;
		self.term = term;
		self.voted_for = voted_for;
		self.write_header()?;
		self.discard_undo()
	}

	/// Makes `primary` coherent after a possibly interrupted mutation. If
	/// the undo file holds a fully recorded intention, the saved bytes are
	/// written back; anything short of that means the mutation never
	/// touched `primary` and the undo content is discarded.
	fn recover(&mut self) -> Result<()> {
		let undo_len = self.undo.seek(SeekFrom::End(0))?;
		if undo_len < LOG_HEADER_SIZE as u64 {
			return self.discard_undo();
		}

		let mut header = [0u8; LOG_HEADER_SIZE];
		self.undo.seek(SeekFrom::Start(0))?;
		self.undo.read_exact(&mut header)?;
		let word0 = BigEndian::read_u64(&header[0..8]);
		let saved_last_index = BigEndian::read_u64(&header[16..24]);
		let has_entries = word0 & HIGH_BIT != 0;

		let mut entries_start = 0u64;
		let mut entries_len = 0u64;
		if has_entries {
			if undo_len < (LOG_HEADER_SIZE + UNDO_SECONDARY_SIZE) as u64 {
				return self.discard_undo();
			}
			let mut secondary = [0u8; UNDO_SECONDARY_SIZE];
			self.undo.read_exact(&mut secondary)?;
			entries_start = BigEndian::read_u64(&secondary[0..8]);
			entries_len = BigEndian::read_u64(&secondary[8..16]);

			let expected = (LOG_HEADER_SIZE + UNDO_SECONDARY_SIZE) as u64
				+ entries_len * ENTRY_SIZE as u64;
			if undo_len != expected {
				return self.discard_undo();
			}
			if entries_start < LOG_HEADER_SIZE as u64
				|| (entries_start - LOG_HEADER_SIZE as u64) % ENTRY_SIZE as u64 != 0
			{
				return self.discard_undo();
			}
		} else if undo_len != LOG_HEADER_SIZE as u64 {
			return self.discard_undo();
		}

		warn!("log: rolling back an interrupted mutation");

		// The high bit in the saved word is the undo shape flag, not part
		// of the persistent header.
		BigEndian::write_u64(&mut header[0..8], word0 & !HIGH_BIT);
		self.primary.seek(SeekFrom::Start(0))?;
		self.primary.write_all(&header)?;

		if has_entries {
			let mut saved = vec![0u8; (entries_len as usize) * ENTRY_SIZE];
			self.undo.read_exact(&mut saved)?;
			self.primary.seek(SeekFrom::Start(entries_start))?;
			self.primary.write_all(&saved)?;
			self.primary.set_len(entry_offset(saved_last_index))?;
		}

		self.primary.sync_all()?;
		self.discard_undo()
	}

	/// Loads the in-memory mirror from `primary`, initializing a brand new
	/// file to the empty state first.
	fn load(&mut self) -> Result<()> {
		let primary_len = self.primary.seek(SeekFrom::End(0))?;
		if primary_len < LOG_HEADER_SIZE as u64 {
			// Either a fresh file or a create that died before the first
			// header landed; nothing the header ever described exists yet.
			self.term = 0;
			self.voted_for = None;
			self.entries.clear();
			self.write_header()?;
			self.primary.set_len(LOG_HEADER_SIZE as u64)?;
			self.primary.sync_all()?;
			return Ok(());
		}

		let mut header = [0u8; LOG_HEADER_SIZE];
		self.primary.seek(SeekFrom::Start(0))?;
		self.primary.read_exact(&mut header)?;
		let word0 = BigEndian::read_u64(&header[0..8]);
		self.term = BigEndian::read_u64(&header[8..16]);
		let last_index = BigEndian::read_u64(&header[16..24]);

		// Id 0 is reserved, so a non-zero low word is what actually means
		// "voted"; the high bit is advisory (recovery clears it).
		let voted = word0 & !HIGH_BIT;
		self.voted_for = if voted != 0 { Some(voted) } else { None };

		let logical_len = entry_offset(last_index);
		if primary_len < logical_len {
			bail!(
				"primary is shorter than its header claims ({} < {})",
				primary_len, logical_len
			);
		}
		if primary_len > logical_len {
			// Dead bytes past the logical end, left by a rolled-back
			// append.
			self.primary.set_len(logical_len)?;
			self.primary.sync_all()?;
		}

		self.entries.clear();
		self.entries.reserve(last_index as usize);
		let mut record = [0u8; ENTRY_SIZE];
		for _ in 0..last_index {
			self.primary.read_exact(&mut record)?;
			self.entries.push(decode_entry(&record)?);
		}
		self.commit_index = 0;
		Ok(())
	}

	/// Records a header-only intention: the 24 bytes a rollback would put
	/// back, with the shape bit clear.
	fn begin_undo_header_only(&mut self) -> Result<()> {
		let mut header = [0u8; LOG_HEADER_SIZE];
		self.encode_header(&mut header);
		let word0 = BigEndian::read_u64(&header[0..8]);
		BigEndian::write_u64(&mut header[0..8], word0 & !HIGH_BIT);

		self.undo.seek(SeekFrom::Start(0))?;
		self.undo.write_all(&header)?;
		self.undo.sync_all()?;
		Ok(())
	}

	/// Records a header+entries intention covering every record from `at`
	/// (exclusive) to the current end of the log, read back from `primary`
	/// itself.
	fn begin_undo_with_entries(&mut self, at: LogIndex) -> Result<()> {
		let entries_start = entry_offset(at);
		let entries_len = self.entries.len() as u64 - at;

		let mut header = [0u8; LOG_HEADER_SIZE];
		self.encode_header(&mut header);
		let word0 = BigEndian::read_u64(&header[0..8]);
		BigEndian::write_u64(&mut header[0..8], word0 | HIGH_BIT);

		let mut buf =
			Vec::with_capacity(LOG_HEADER_SIZE + UNDO_SECONDARY_SIZE + entries_len as usize * ENTRY_SIZE);
		buf.extend_from_slice(&header);
		let mut secondary = [0u8; UNDO_SECONDARY_SIZE];
		BigEndian::write_u64(&mut secondary[0..8], entries_start);
		BigEndian::write_u64(&mut secondary[8..16], entries_len);
		buf.extend_from_slice(&secondary);

		let mut saved = vec![0u8; entries_len as usize * ENTRY_SIZE];
		self.primary.seek(SeekFrom::Start(entries_start))?;
		self.primary.read_exact(&mut saved)?;
		buf.extend_from_slice(&saved);

		self.undo.seek(SeekFrom::Start(0))?;
		self.undo.write_all(&buf)?;
		self.undo.sync_all()?;
		Ok(())
	}

	fn discard_undo(&mut self) -> Result<()> {
		self.undo.set_len(0)?;
		self.undo.sync_all()?;
		Ok(())
	}

	fn encode_header(&self, out: &mut [u8; LOG_HEADER_SIZE]) {
		let word0 = match self.voted_for {
			Some(id) => HIGH_BIT | id,
			None => 0,
		};
		BigEndian::write_u64(&mut out[0..8], word0);
		BigEndian::write_u64(&mut out[8..16], self.term);
		BigEndian::write_u64(&mut out[16..24], self.entries.len() as u64);
	}

	fn write_header(&mut self) -> Result<()> {
		let mut header = [0u8; LOG_HEADER_SIZE];
		self.encode_header(&mut header);
		self.primary.seek(SeekFrom::Start(0))?;
		self.primary.write_all(&header)?;
		self.primary.sync_all()?;
		Ok(())
	}
}

fn entry_offset(index: LogIndex) -> u64 {
	LOG_HEADER_SIZE as u64 + index * ENTRY_SIZE as u64
}

fn open_log_file(path: &Path) -> Result<File> {
	let mut opts = OpenOptions::new();
	opts.read(true)
		.write(true)
		.create(true)
		.mode(FILE_MODE)
		.custom_flags(libc::O_NOFOLLOW);
	Ok(opts.open(path)?)
}

pub fn encode_entry(entry: &LogEntry, out: &mut [u8; ENTRY_SIZE]) {
	BigEndian::write_u64(&mut out[0..8], entry.term_added);
	BigEndian::write_u64(&mut out[8..16], entry.tag);
	out[16] = match entry.kind {
		EntryKind::Nop => 0,
		EntryKind::Normal => 1,
	};
	out[17..17 + PAYLOAD_SIZE].copy_from_slice(&entry.payload);
	out[17 + PAYLOAD_SIZE..].copy_from_slice(&[0u8; ENTRY_PAD]);
}

pub fn decode_entry(record: &[u8; ENTRY_SIZE]) -> Result<LogEntry> {
	let kind = match record[16] {
		0 => EntryKind::Nop,
		1 => EntryKind::Normal,
		k => bail!("unknown entry kind {} in log record", k),
	};
	let mut payload = [0u8; PAYLOAD_SIZE];
	payload.copy_from_slice(&record[17..17 + PAYLOAD_SIZE]);
	Ok(LogEntry {
		term_added: BigEndian::read_u64(&record[0..8]),
		tag: BigEndian::read_u64(&record[8..16]),
		kind,
		payload,
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::fs;
	use tempfile::TempDir;

	fn entry(term: Term, tag: MsgTag, fill: u8) -> LogEntry {
		LogEntry::normal(term, tag, [fill; PAYLOAD_SIZE])
	}

	#[test]
	fn fresh_open_is_empty() {
		let dir = TempDir::new().unwrap();
		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.current_term(), 0);
		assert_eq!(log.voted_for(), None);
		assert_eq!(log.last_index(), 0);
		assert_eq!(log.committed_index(), 0);
		assert_eq!(log.entry(0).term_added, 0);
	}

	#[test]
	fn second_open_fails_while_locked() {
		let dir = TempDir::new().unwrap();
		let _log = Log::open(dir.path()).unwrap();
		match Log::open(dir.path()) {
			Err(Error(ErrorKind::LogLocked(_), _)) => {}
			other => panic!("expected LogLocked, got {:?}", other.map(|_| ())),
		}
	}

	#[test]
	fn lock_released_on_drop() {
		let dir = TempDir::new().unwrap();
		{
			let _log = Log::open(dir.path()).unwrap();
		}
		Log::open(dir.path()).unwrap();
	}

	#[test]
	fn term_and_vote_survive_reopen() {
		let dir = TempDir::new().unwrap();
		{
			let mut log = Log::open(dir.path()).unwrap();
			assert_eq!(log.update_term(7).unwrap(), cmp::Ordering::Greater);
			log.record_vote(3).unwrap();
			assert!(log.can_vote_for(3));
			assert!(!log.can_vote_for(4));
		}
		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.current_term(), 7);
		assert_eq!(log.voted_for(), Some(3));
	}

	#[test]
	fn newer_term_clears_vote() {
		let dir = TempDir::new().unwrap();
		let mut log = Log::open(dir.path()).unwrap();
		log.advance_term_and_vote(1).unwrap();
		assert_eq!(log.current_term(), 1);
		assert_eq!(log.voted_for(), Some(1));

		assert_eq!(log.update_term(2).unwrap(), cmp::Ordering::Greater);
		assert_eq!(log.voted_for(), None);
		assert_eq!(log.update_term(2).unwrap(), cmp::Ordering::Equal);
		assert_eq!(log.update_term(1).unwrap(), cmp::Ordering::Less);
		assert_eq!(log.current_term(), 2);
	}

	#[test]
	fn entries_survive_reopen() {
		let dir = TempDir::new().unwrap();
		{
			let mut log = Log::open(dir.path()).unwrap();
			assert_eq!(log.append(entry(1, 10, 0xaa)).unwrap(), 1);
			assert_eq!(log.append(entry(1, 11, 0xbb)).unwrap(), 2);
			assert_eq!(log.append(LogEntry::nop(2)).unwrap(), 3);
		}
		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(1), entry(1, 10, 0xaa));
		assert_eq!(log.entry(2), entry(1, 11, 0xbb));
		assert_eq!(log.entry(3), LogEntry::nop(2));
	}

	#[test]
	fn truncate_and_append_overwrites_suffix() {
		let dir = TempDir::new().unwrap();
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.append(entry(1, 1, 1)).unwrap();
			log.append(entry(1, 2, 2)).unwrap();
			log.append(entry(2, 3, 3)).unwrap();

			log.truncate_and_append(1, &[entry(3, 7, 7), entry(3, 8, 8)]).unwrap();
			assert_eq!(log.last_index(), 3);
		}
		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(1), entry(1, 1, 1));
		assert_eq!(log.entry(2), entry(3, 7, 7));
		assert_eq!(log.entry(3), entry(3, 8, 8));
	}

	#[test]
	fn truncate_past_end_is_rejected() {
		let dir = TempDir::new().unwrap();
		let mut log = Log::open(dir.path()).unwrap();
		log.append(entry(1, 1, 1)).unwrap();
		assert!(log.truncate_and_append(2, &[]).is_err());
	}

	#[test]
	fn entry_codec_round_trip() {
		let original = LogEntry::normal(0x0102030405060708, 0xABCD, [0x5a; PAYLOAD_SIZE]);
		let mut record = [0u8; ENTRY_SIZE];
		encode_entry(&original, &mut record);
		assert_eq!(decode_entry(&record).unwrap(), original);

		let nop = LogEntry::nop(9);
		encode_entry(&nop, &mut record);
		assert_eq!(decode_entry(&record).unwrap(), nop);
	}

	#[test]
	fn commit_clamps_and_never_decreases() {
		let dir = TempDir::new().unwrap();
		let mut log = Log::open(dir.path()).unwrap();
		log.append(entry(1, 1, 1)).unwrap();
		log.append(entry(1, 2, 2)).unwrap();

		assert_eq!(log.commit(10), 2);
		assert_eq!(log.commit(1), 2);
		assert_eq!(log.committed_index(), 2);
	}

	// Builds the undo bytes a header+entries mutation would have recorded,
	// for crash simulations.
	fn build_entries_undo(term: Term, voted_for: u64, entries: &[LogEntry], at: LogIndex) -> Vec<u8> {
		let entries_start = entry_offset(at);
		let saved = &entries[at as usize..];

		let mut buf = Vec::new();
		let mut header = [0u8; LOG_HEADER_SIZE];
		let word0 = if voted_for != 0 { HIGH_BIT | voted_for } else { 0 };
		BigEndian::write_u64(&mut header[0..8], word0 | HIGH_BIT);
		BigEndian::write_u64(&mut header[8..16], term);
		BigEndian::write_u64(&mut header[16..24], entries.len() as u64);
		buf.extend_from_slice(&header);

		let mut secondary = [0u8; UNDO_SECONDARY_SIZE];
		BigEndian::write_u64(&mut secondary[0..8], entries_start);
		BigEndian::write_u64(&mut secondary[8..16], saved.len() as u64);
		buf.extend_from_slice(&secondary);

		for e in saved {
			let mut record = [0u8; ENTRY_SIZE];
			encode_entry(e, &mut record);
			buf.extend_from_slice(&record);
		}
		buf
	}

	#[test]
	fn recovery_restores_header_only_rollback() {
		let dir = TempDir::new().unwrap();
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.update_term(5).unwrap();
			log.record_vote(2).unwrap();
		}

		// Simulate a crash between "undo written" and "primary written"
		// for a term advance: the undo holds the old header, the primary
		// already carries the would-be new term.
		{
			let mut undo = [0u8; LOG_HEADER_SIZE];
			BigEndian::write_u64(&mut undo[0..8], 2); // voted_for=2, shape bit clear
			BigEndian::write_u64(&mut undo[8..16], 5);
			BigEndian::write_u64(&mut undo[16..24], 0);
			fs::write(dir.path().join("undo"), &undo[..]).unwrap();

			let mut primary = fs::read(dir.path().join("primary")).unwrap();
			BigEndian::write_u64(&mut primary[0..8], 0);
			BigEndian::write_u64(&mut primary[8..16], 6);
			fs::write(dir.path().join("primary"), &primary).unwrap();
		}

		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.current_term(), 5);
		assert_eq!(log.voted_for(), Some(2));
		assert_eq!(fs::metadata(dir.path().join("undo")).unwrap().len(), 0);
	}

	#[test]
	fn recovery_restores_entries_rollback() {
		let dir = TempDir::new().unwrap();
		let old = vec![entry(1, 1, 1), entry(1, 2, 2), entry(1, 3, 3)];
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.update_term(1).unwrap();
			for e in &old {
				log.append(e.clone()).unwrap();
			}
		}

		// Simulate a crash in the middle of truncate_and_append(1, ..):
		// the undo fully records the intention, the primary is part-way
		// through being overwritten.
		{
			fs::write(dir.path().join("undo"), build_entries_undo(1, 0, &old, 1)).unwrap();

			let mut primary = fs::read(dir.path().join("primary")).unwrap();
			let off = entry_offset(1) as usize;
			let mut record = [0u8; ENTRY_SIZE];
			encode_entry(&entry(2, 99, 9), &mut record);
			primary[off..off + ENTRY_SIZE].copy_from_slice(&record);
			fs::write(dir.path().join("primary"), &primary).unwrap();
		}

		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), 3);
		assert_eq!(log.entry(2), old[1]);
		assert_eq!(log.entry(3), old[2]);
		assert_eq!(fs::metadata(dir.path().join("undo")).unwrap().len(), 0);
	}

	#[test]
	fn recovery_discards_malformed_undo() {
		let dir = TempDir::new().unwrap();
		let old = vec![entry(1, 1, 1), entry(1, 2, 2)];
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.update_term(1).unwrap();
			for e in &old {
				log.append(e.clone()).unwrap();
			}
		}
		let pristine = fs::read(dir.path().join("primary")).unwrap();

		// A truncated intention: too short to mean anything.
		fs::write(dir.path().join("undo"), &[0u8; 10][..]).unwrap();
		{
			let log = Log::open(dir.path()).unwrap();
			assert_eq!(log.last_index(), 2);
			assert_eq!(log.entry(1), old[0]);
		}
		assert_eq!(fs::read(dir.path().join("primary")).unwrap(), pristine);

		// Shape bit set but the secondary header never made it.
		let mut undo = [0u8; LOG_HEADER_SIZE];
		BigEndian::write_u64(&mut undo[0..8], HIGH_BIT);
		BigEndian::write_u64(&mut undo[8..16], 1);
		BigEndian::write_u64(&mut undo[16..24], 2);
		fs::write(dir.path().join("undo"), &undo[..]).unwrap();
		{
			Log::open(dir.path()).unwrap();
		}
		assert_eq!(fs::read(dir.path().join("primary")).unwrap(), pristine);

		// Secondary header present but the record bytes are short.
		let mut bad = build_entries_undo(1, 0, &old, 0);
		bad.truncate(bad.len() - 1);
		fs::write(dir.path().join("undo"), &bad).unwrap();
		{
			Log::open(dir.path()).unwrap();
		}
		assert_eq!(fs::read(dir.path().join("primary")).unwrap(), pristine);
		assert_eq!(fs::metadata(dir.path().join("undo")).unwrap().len(), 0);
	}

	#[test]
	fn recovery_is_idempotent() {
		let dir = TempDir::new().unwrap();
		let old = vec![entry(1, 1, 1), entry(1, 2, 2)];
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.update_term(1).unwrap();
			for e in &old {
				log.append(e.clone()).unwrap();
			}
		}
		fs::write(dir.path().join("undo"), build_entries_undo(1, 0, &old, 0)).unwrap();

		for _ in 0..2 {
			let log = Log::open(dir.path()).unwrap();
			assert_eq!(log.last_index(), 2);
			assert_eq!(log.entry(1), old[0]);
			assert_eq!(log.entry(2), old[1]);
		}
	}

	#[test]
	fn rolled_back_append_leaves_no_trailing_bytes() {
		let dir = TempDir::new().unwrap();
		{
			let mut log = Log::open(dir.path()).unwrap();
			log.update_term(1).unwrap();
			log.append(entry(1, 1, 1)).unwrap();
		}

		// A crash after an append wrote its record but before the header:
		// header-only undo present, dead record past the logical end.
		{
			let mut undo = [0u8; LOG_HEADER_SIZE];
			BigEndian::write_u64(&mut undo[8..16], 1);
			BigEndian::write_u64(&mut undo[16..24], 1);
			fs::write(dir.path().join("undo"), &undo[..]).unwrap();

			let mut primary = fs::read(dir.path().join("primary")).unwrap();
			let mut record = [0u8; ENTRY_SIZE];
			encode_entry(&entry(1, 2, 2), &mut record);
			primary.extend_from_slice(&record);
			fs::write(dir.path().join("primary"), &primary).unwrap();
		}

		let log = Log::open(dir.path()).unwrap();
		assert_eq!(log.last_index(), 1);
		assert_eq!(
			fs::metadata(dir.path().join("primary")).unwrap().len(),
			entry_offset(1)
		);
	}
}
