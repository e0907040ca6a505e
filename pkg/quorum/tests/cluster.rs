extern crate quorum;
extern crate tempfile;

use quorum::config::NodeConfig;
use quorum::local::{Applied, LocalCluster};
use quorum::protos::*;
use std::collections::HashMap;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const DEADLINE: Duration = Duration::from_secs(30);

fn fast_config(servers: u64) -> NodeConfig {
	let mut config = NodeConfig::default();
	config.servers = servers;
	config.election_timeout_min_ms = 150;
	config.election_timeout_max_ms = 300;
	config.heartbeat_ms = 40;
	config.vote_retry_ms = 60;
	config
}

fn wait_for_leader(cluster: &LocalCluster, deadline: Instant) -> ServerId {
	loop {
		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("timed out waiting for a leader");
		match cluster.reports.recv_timeout(left) {
			Ok(report) => {
				if report.kind == ReportKind::BecameLeader {
					return report.from;
				}
			}
			Err(RecvTimeoutError::Timeout) => panic!("no leader emerged"),
			Err(RecvTimeoutError::Disconnected) => panic!("cluster died"),
		}
	}
}

#[test]
fn single_server_elects_itself_and_commits() {
	let dir = TempDir::new().unwrap();
	let cluster = LocalCluster::start(dir.path(), 1, &fast_config(1)).unwrap();
	let deadline = Instant::now() + DEADLINE;

	let leader = wait_for_leader(&cluster, deadline);
	assert_eq!(leader, 1);

	cluster.submit(1, 0xABCD, b"solo");

	// The nop commits first, then the submission right behind it.
	let mut saw_nop = false;
	loop {
		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("entry never committed");
		let notice = cluster.applied.recv_timeout(left).expect("cluster died");
		match notice.entry.kind {
			EntryKind::Nop => saw_nop = true,
			EntryKind::Normal => {
				assert!(saw_nop);
				assert_eq!(notice.from, 1);
				assert_eq!(notice.entry.tag, 0xABCD);
				assert_eq!(&notice.entry.payload[..4], b"solo");
				break;
			}
		}
	}

	cluster.shutdown();
}

#[test]
fn three_servers_replicate_a_submission_everywhere() {
	let dir = TempDir::new().unwrap();
	let cluster = LocalCluster::start(dir.path(), 3, &fast_config(3)).unwrap();
	let deadline = Instant::now() + DEADLINE;

	let mut leader = wait_for_leader(&cluster, deadline);
	let tag: MsgTag = 0xBEEF;
	cluster.submit(leader, tag, b"replicated");

	// Per-server view of what got applied, keyed by log index.
	let mut views: HashMap<ServerId, HashMap<LogIndex, LogEntry>> = HashMap::new();
	let mut done = 0u32;
	while done < 3 {
		// Leadership may move mid-run; chase it and resubmit bounces.
		while let Ok(report) = cluster.reports.try_recv() {
			match report.kind {
				ReportKind::BecameLeader => leader = report.from,
				ReportKind::NotLeader => {
					if report.tag == tag {
						cluster.submit(leader, tag, b"replicated");
					}
				}
			}
		}

		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("submission never replicated everywhere");
		let notice: Applied = match cluster.applied.recv_timeout(left) {
			Ok(notice) => notice,
			Err(RecvTimeoutError::Timeout) => continue,
			Err(RecvTimeoutError::Disconnected) => panic!("cluster died"),
		};

		let view = views.entry(notice.from).or_insert_with(HashMap::new);
		let first = view.insert(notice.index, notice.entry.clone()).is_none();
		if first && notice.entry.kind == EntryKind::Normal && notice.entry.tag == tag {
			done += 1;
		}
	}

	// Committed entries must agree across servers index by index.
	for (server_a, view_a) in &views {
		for (server_b, view_b) in &views {
			if server_a >= server_b {
				continue;
			}
			for (index, entry) in view_a {
				if let Some(other) = view_b.get(index) {
					assert_eq!(entry, other, "index {} differs between servers", index);
				}
			}
		}
	}

	cluster.shutdown();
}

#[test]
fn non_leader_bounces_submissions_back() {
	let dir = TempDir::new().unwrap();
	let cluster = LocalCluster::start(dir.path(), 3, &fast_config(3)).unwrap();
	let deadline = Instant::now() + DEADLINE;

	let mut leader = wait_for_leader(&cluster, deadline);
	let tag: MsgTag = 0xF00D;

	loop {
		let follower = (1..=3).find(|&id| id != leader).unwrap();
		cluster.submit(follower, tag, b"misdirected");

		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("never saw a NotLeader report");
		match cluster.reports.recv_timeout(left) {
			Ok(report) => match report.kind {
				ReportKind::NotLeader if report.from == follower && report.tag == tag => break,
				// The follower we picked may have been elected in the
				// meantime; note the new leader and try another server.
				ReportKind::BecameLeader => leader = report.from,
				_ => {}
			},
			Err(_) => panic!("cluster died"),
		}
	}

	cluster.shutdown();
}

#[test]
fn logs_survive_a_full_cluster_restart() {
	let dir = TempDir::new().unwrap();
	let tag: MsgTag = 0xCAFE;
	{
		let cluster = LocalCluster::start(dir.path(), 1, &fast_config(1)).unwrap();
		let deadline = Instant::now() + DEADLINE;
		wait_for_leader(&cluster, deadline);
		cluster.submit(1, tag, b"durable");
		loop {
			let left = deadline
				.checked_duration_since(Instant::now())
				.expect("entry never committed");
			let notice = cluster.applied.recv_timeout(left).expect("cluster died");
			if notice.entry.kind == EntryKind::Normal && notice.entry.tag == tag {
				break;
			}
		}
		cluster.shutdown();
	}

	// A fresh instance over the same directory must recommit the same
	// entry from its persistent log.
	let cluster = LocalCluster::start(dir.path(), 1, &fast_config(1)).unwrap();
	let deadline = Instant::now() + DEADLINE;
	wait_for_leader(&cluster, deadline);
	loop {
		let left = deadline
			.checked_duration_since(Instant::now())
			.expect("persisted entry never recommitted");
		let notice = cluster.applied.recv_timeout(left).expect("cluster died");
		if notice.entry.kind == EntryKind::Normal {
			assert_eq!(notice.entry.tag, tag);
			assert_eq!(&notice.entry.payload[..7], b"durable");
			break;
		}
	}
	cluster.shutdown();
}
