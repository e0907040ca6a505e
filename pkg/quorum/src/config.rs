use super::errors::*;
use super::protos::MAX_SERVERS;

use std::path::PathBuf;

/// Static configuration for one server instance.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
	/// This server's id, 1..=servers.
	pub id: u64,

	/// Total number of servers in the cluster.
	pub servers: u64,

	/// Directory holding this server's log files.
	pub dir: PathBuf,

	/// Election timeout bounds; each arming picks uniformly in between.
	pub election_timeout_min_ms: u64,
	pub election_timeout_max_ms: u64,

	/// Leader heartbeat period.
	pub heartbeat_ms: u64,

	/// How long a candidate waits before re-soliciting silent servers.
	pub vote_retry_ms: u64,
}

impl Default for NodeConfig {
	fn default() -> Self {
		NodeConfig {
			id: 1,
			servers: 1,
			dir: PathBuf::from("."),
			election_timeout_min_ms: 150,
			election_timeout_max_ms: 300,
			heartbeat_ms: 50,
			vote_retry_ms: 75,
		}
	}
}

impl NodeConfig {
	pub fn from_toml(text: &str) -> Result<NodeConfig> {
		let config: NodeConfig =
			toml::from_str(text).map_err(|e| format!("bad config: {}", e))?;
		config.validate()?;
		Ok(config)
	}

	pub fn validate(&self) -> Result<()> {
		if self.servers == 0 || self.servers > MAX_SERVERS {
			bail!("cluster size {} is out of range (1..={})", self.servers, MAX_SERVERS);
		}
		if self.id == 0 || self.id > self.servers {
			bail!("server id {} is not in 1..={}", self.id, self.servers);
		}
		if self.election_timeout_min_ms == 0
			|| self.election_timeout_min_ms > self.election_timeout_max_ms
		{
			bail!(
				"election timeout range {}..{} is empty",
				self.election_timeout_min_ms, self.election_timeout_max_ms
			);
		}
		if self.heartbeat_ms == 0 || self.vote_retry_ms == 0 {
			bail!("heartbeat and vote retry periods must be non-zero");
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_a_full_config() {
		let config = NodeConfig::from_toml(
			r#"
			id = 2
			servers = 5
			dir = "/var/lib/quorum/2"
			election_timeout_min_ms = 200
			election_timeout_max_ms = 400
			heartbeat_ms = 60
			vote_retry_ms = 90
			"#,
		)
		.unwrap();
		assert_eq!(config.id, 2);
		assert_eq!(config.servers, 5);
		assert_eq!(config.dir, PathBuf::from("/var/lib/quorum/2"));
		assert_eq!(config.election_timeout_max_ms, 400);
	}

	#[test]
	fn missing_fields_use_defaults() {
		let config = NodeConfig::from_toml("id = 1\nservers = 3\n").unwrap();
		assert_eq!(config.heartbeat_ms, 50);
		assert_eq!(config.election_timeout_min_ms, 150);
	}

	#[test]
	fn rejects_out_of_range_ids() {
		assert!(NodeConfig::from_toml("id = 4\nservers = 3\n").is_err());
		assert!(NodeConfig::from_toml("id = 0\nservers = 3\n").is_err());
		assert!(NodeConfig::from_toml("id = 1\nservers = 500\n").is_err());
	}

	#[test]
	fn rejects_empty_timeout_range() {
		let err = NodeConfig::from_toml(
			"id = 1\nservers = 1\nelection_timeout_min_ms = 500\nelection_timeout_max_ms = 100\n",
		);
		assert!(err.is_err());
	}
}
