#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate log;

extern crate clap;
extern crate env_logger;
extern crate quorum;

use clap::{App, Arg};
use quorum::config::NodeConfig;
use quorum::errors::*;
use quorum::local::LocalCluster;
use quorum::protos::*;
use std::path::Path;
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

const CONVERGE_TIMEOUT: Duration = Duration::from_secs(30);

fn run() -> Result<()> {
	let matches = App::new("quorumd")
		.about("Runs a small replicated-consensus cluster in one process")
		.arg(
			Arg::with_name("dir")
				.long("dir")
				.short("d")
				.value_name("DIRECTORY_PATH")
				.help("An existing directory to hold each server's log files")
				.required(true)
				.takes_value(true),
		)
		.arg(
			Arg::with_name("servers")
				.long("servers")
				.short("n")
				.value_name("COUNT")
				.help("Number of servers to run (default 3)")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("entries")
				.long("entries")
				.short("e")
				.value_name("COUNT")
				.help("Number of entries to submit once a leader emerges (default 5)")
				.takes_value(true),
		)
		.get_matches();

	let dir = Path::new(matches.value_of("dir").unwrap()).to_owned();
	let servers: u64 = matches
		.value_of("servers")
		.unwrap_or("3")
		.parse()
		.map_err(|_| "servers must be a number")?;
	let entries: u64 = matches
		.value_of("entries")
		.unwrap_or("5")
		.parse()
		.map_err(|_| "entries must be a number")?;

	let mut config = NodeConfig::default();
	config.servers = servers;
	config.dir = dir.clone();
	config.validate()?;

	let cluster = LocalCluster::start(&dir, servers, &config)?;
	let deadline = Instant::now() + CONVERGE_TIMEOUT;

	// Wait for some server to win an election.
	let mut leader = loop {
		match cluster.reports.recv_timeout(remaining(deadline)?) {
			Ok(report) => {
				if report.kind == ReportKind::BecameLeader {
					break report.from;
				}
			}
			Err(RecvTimeoutError::Timeout) => bail!("no leader emerged"),
			Err(RecvTimeoutError::Disconnected) => bail!("cluster died"),
		}
	};
	info!("server {} is the leader", leader);

	for i in 0..entries {
		cluster.submit(leader, i, format!("entry {}", i).as_bytes());
	}

	// Every server must apply every submitted entry. Leadership can still
	// move mid-run; chase it and resubmit anything bounced.
	let mut applied = vec![0u64; (servers + 1) as usize];
	while applied[1..].iter().any(|&n| n < entries) {
		match cluster.reports.try_recv() {
			Ok(report) if report.kind == ReportKind::BecameLeader => leader = report.from,
			Ok(report) if report.kind == ReportKind::NotLeader => {
				cluster.submit(leader, report.tag, format!("entry {}", report.tag).as_bytes());
			}
			_ => {}
		}
		match cluster.applied.recv_timeout(remaining(deadline)?) {
			Ok(notice) => {
				if notice.entry.kind == EntryKind::Normal {
					applied[notice.from as usize] += 1;
					debug!(
						"server {} applied tag {} at index {}",
						notice.from, notice.entry.tag, notice.index
					);
				}
			}
			Err(RecvTimeoutError::Timeout) => bail!("entries did not replicate everywhere"),
			Err(RecvTimeoutError::Disconnected) => bail!("cluster died"),
		}
	}

	info!("all {} entries applied on every server", entries);
	cluster.shutdown();
	Ok(())
}

fn remaining(deadline: Instant) -> Result<Duration> {
	let now = Instant::now();
	if now >= deadline {
		bail!("timed out waiting for the cluster to converge");
	}
	Ok(deadline - now)
}

fn main() {
	env_logger::init();
	if let Err(e) = run() {
		eprintln!("quorumd: {}", e);
		std::process::exit(1);
	}
}
