//! Durability strategies for duraconn
//!
//! A host selector yields candidate hosts in an algorithm-defined order
//! during connection establishment. One selector instance serves exactly
//! one connection-attempt loop and is discarded after a successful
//! connect; an exhausted selector fails with [`Error::NoHostsRemain`].

use rand::Rng;

use crate::config::{DurabilityKind, GroupConfig, HostEntry};
use crate::error::{Error, Result};

/// A durability strategy: yields candidate hosts until none remain
pub trait HostSelector: Send {
    /// Return the next candidate host
    fn next(&mut self) -> Result<HostEntry>;

    /// Number of candidates not yet returned
    fn remaining(&self) -> usize;
}

/// Build the selector configured for a connection group
pub fn selector_for(group: &GroupConfig) -> Result<Box<dyn HostSelector>> {
    match group.durability {
        DurabilityKind::Randomizer => Ok(Box::new(Randomizer::new(&group.hosts))),
        DurabilityKind::FallBack => Ok(Box::new(FallBack::new(&group.hosts)?)),
    }
}

/// Uniformly random candidate order
///
/// Each call removes the selected host from the remaining set, so for N
/// configured hosts at most N calls succeed.
pub struct Randomizer {
    remaining: Vec<HostEntry>,
}

impl Randomizer {
    /// Create a randomizer over a defensive copy of the host list
    pub fn new(hosts: &[HostEntry]) -> Self {
        Self {
            remaining: hosts.to_vec(),
        }
    }
}

impl HostSelector for Randomizer {
    fn next(&mut self) -> Result<HostEntry> {
        if self.remaining.is_empty() {
            return Err(Error::NoHostsRemain);
        }

        let index = if self.remaining.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.remaining.len())
        };
        Ok(self.remaining.remove(index))
    }

    fn remaining(&self) -> usize {
        self.remaining.len()
    }
}

/// Fixed primary/secondary order over exactly two hosts
pub struct FallBack {
    hosts: Vec<HostEntry>,
    position: usize,
}

impl FallBack {
    /// Create a fall-back selector; any host count other than 2 is a
    /// configuration error.
    pub fn new(hosts: &[HostEntry]) -> Result<Self> {
        if hosts.len() != 2 {
            return Err(Error::configuration("exactly 2 hosts must be configured"));
        }

        Ok(Self {
            hosts: hosts.to_vec(),
            position: 0,
        })
    }
}

impl HostSelector for FallBack {
    fn next(&mut self) -> Result<HostEntry> {
        if self.position >= self.hosts.len() {
            return Err(Error::NoHostsRemain);
        }

        let host = self.hosts[self.position].clone();
        self.position += 1;
        Ok(host)
    }

    fn remaining(&self) -> usize {
        self.hosts.len() - self.position
    }
}
