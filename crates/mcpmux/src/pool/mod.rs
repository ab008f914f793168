//! Managed upstream instances: local subprocesses and remote pods.
//!
//! Both pools share the same contract: `acquire` returns the live client for
//! (target, subject key), creating it on first use; concurrent acquisitions
//! for one key collapse to a single creation; background GC enforces idle
//! TTL, max lifetime, and the population cap.

pub mod pod;
pub mod process;

use std::time::Duration;

use thiserror::Error;

use crate::types::{SubjectKey, TargetId};
use crate::upstream::UpstreamError;

pub type PoolKey = (TargetId, SubjectKey);

#[derive(Error, Debug)]
pub enum PoolError {
	#[error("capacity exhausted: {0}")]
	CapacityExhausted(String),
	#[error("spawn failed: {0}")]
	Spawn(String),
	#[error("instance not ready: {0}")]
	NotReady(String),
	#[error("instance driver: {0}")]
	Driver(String),
	#[error(transparent)]
	Upstream(#[from] UpstreamError),
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
	pub idle_ttl: Duration,
	pub max_lifetime: Duration,
	pub gc_interval: Duration,
	pub max_instances: usize,
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			idle_ttl: Duration::from_secs(300),
			max_lifetime: Duration::from_secs(3600),
			gc_interval: Duration::from_secs(30),
			max_instances: 64,
		}
	}
}
