//! Bounded TCP port allocator.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

use silo_core::Error;
use tracing::warn;

pub struct PortPool {
	start: u16,
	end: u16,
	free: Mutex<VecDeque<u16>>,
	allocations: RwLock<HashMap<u16, String>>,
}

impl PortPool {
	pub fn new(start: u16, end: u16) -> Result<Self, Error> {
		if start < 1 || start > end {
			return Err(Error::InvalidConfig(format!(
				"invalid port range {start}..={end}"
			)));
		}
		let free = (start..=end).collect();
		Ok(PortPool {
			start,
			end,
			free: Mutex::new(free),
			allocations: RwLock::new(HashMap::new()),
		})
	}

	pub fn range(&self) -> (u16, u16) {
		(self.start, self.end)
	}

	/// Removes one port from the free queue non-blockingly. Never blocks;
	/// fails with `PortExhausted` if the pool is empty.
	pub fn allocate(&self, agent_id: &str) -> Result<u16, Error> {
		let port = {
			let mut free = self.free.lock().unwrap();
			free.pop_front().ok_or(Error::PortExhausted)?
		};
		self
			.allocations
			.write()
			.unwrap()
			.insert(port, agent_id.to_string());
		Ok(port)
	}

	/// Idempotent: releasing a port that isn't allocated logs a warning and
	/// returns without error.
	pub fn release(&self, port: u16) {
		let removed = self.allocations.write().unwrap().remove(&port);
		match removed {
			Some(_) => self.free.lock().unwrap().push_back(port),
			None => warn!(port, "release called on an unallocated port"),
		}
	}

	pub fn snapshot(&self) -> HashMap<u16, String> {
		self.allocations.read().unwrap().clone()
	}

	pub fn free_count(&self) -> usize {
		self.free.lock().unwrap().len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rejects_inverted_range() {
		assert!(PortPool::new(200, 100).is_err());
	}

	#[test]
	fn allocate_and_release_round_trip() {
		let pool = PortPool::new(8100, 8101).unwrap();
		let p1 = pool.allocate("a").unwrap();
		let p2 = pool.allocate("b").unwrap();
		assert_ne!(p1, p2);
		assert!(matches!(pool.allocate("c"), Err(Error::PortExhausted)));

		pool.release(p1);
		assert_eq!(pool.free_count(), 1);
		let p3 = pool.allocate("c").unwrap();
		assert_eq!(p3, p1);
	}

	#[test]
	fn release_is_idempotent() {
		let pool = PortPool::new(8100, 8100).unwrap();
		let p = pool.allocate("a").unwrap();
		pool.release(p);
		pool.release(p);
		assert_eq!(pool.free_count(), 1);
		assert_eq!(pool.snapshot().len(), 0);
	}

	#[test]
	fn snapshot_is_defensive_copy() {
		let pool = PortPool::new(8100, 8100).unwrap();
		pool.allocate("a").unwrap();
		let mut snap = pool.snapshot();
		snap.insert(9999, "x".into());
		assert_eq!(pool.snapshot().len(), 1);
	}

	#[test]
	fn concurrent_allocation_never_double_issues_a_port() {
		use std::sync::Arc;
		use std::thread;

		let pool = Arc::new(PortPool::new(8100, 8200).unwrap());
		let mut handles = Vec::new();
		for i in 0..50 {
			let pool = pool.clone();
			handles.push(thread::spawn(move || pool.allocate(&format!("agent-{i}"))));
		}
		let mut ports: Vec<u16> = handles
			.into_iter()
			.map(|h| h.join().unwrap().unwrap())
			.collect();
		ports.sort_unstable();
		let before_dedup = ports.len();
		ports.dedup();
		assert_eq!(before_dedup, ports.len());
	}
}
