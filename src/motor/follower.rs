// Leader/follower output replication
//
// Followers are not slaved in hardware. A periodic task reads each leader's
// applied output and sends it to its followers as a percent-output command,
// so a follower trails its leader by at most one replication period.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use super::driver::{Motor, MotorError, Result};

/// Default replication period
pub const DEFAULT_REPLICATION_PERIOD: Duration = Duration::from_millis(100);

struct Link {
    leader: Motor,
    followers: Vec<Motor>,
}

/// Registry of leader -> followers relations
///
/// Cloning gives another handle to the same registry. Relations are only ever
/// added.
#[derive(Clone, Default)]
pub struct FollowerRegistry {
    links: Arc<Mutex<Vec<Link>>>,
}

impl FollowerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `follower` track `leader`; returns false if it already did
    pub fn follow(&self, leader: &Motor, follower: &Motor) -> Result<bool> {
        if leader.same_motor(follower) {
            return Err(MotorError::SelfFollow {
                name: leader.name(),
            });
        }

        let mut links = self.links.lock();
        let index = match links.iter().position(|l| l.leader.same_motor(leader)) {
            Some(index) => index,
            None => {
                links.push(Link {
                    leader: leader.clone(),
                    followers: Vec::new(),
                });
                links.len() - 1
            }
        };

        let link = &mut links[index];
        if link.followers.iter().any(|f| f.same_motor(follower)) {
            return Ok(false);
        }
        link.followers.push(follower.clone());
        info!("{} now follows {}", follower.name(), leader.name());
        Ok(true)
    }

    /// Number of followers registered on `leader`
    pub fn follower_count(&self, leader: &Motor) -> usize {
        self.links
            .lock()
            .iter()
            .find(|l| l.leader.same_motor(leader))
            .map_or(0, |l| l.followers.len())
    }

    pub fn leader_count(&self) -> usize {
        self.links.lock().len()
    }

    /// Copy every leader's applied output to its followers once
    ///
    /// Works on a snapshot of the registry, so registrations made meanwhile
    /// take effect on the next pass. Returns the number of hardware writes;
    /// failures are logged and do not stop the other followers.
    pub fn replicate_once(&self) -> usize {
        let snapshot: Vec<(Motor, Vec<Motor>)> = self
            .links
            .lock()
            .iter()
            .map(|l| (l.leader.clone(), l.followers.clone()))
            .collect();

        let mut writes = 0;
        for (leader, followers) in snapshot {
            let output = match leader.applied_output() {
                Ok(output) => output,
                Err(e) => {
                    warn!("Skipping followers of {}: {}", leader.name(), e);
                    continue;
                }
            };
            for follower in followers {
                match follower.set_output(output) {
                    Ok(true) => writes += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to replicate to {}: {}", follower.name(), e),
                }
            }
        }
        writes
    }

    /// Run replication every `period` on the given runtime
    pub fn spawn(&self, runtime: &Handle, period: Duration) -> ReplicationTask {
        let registry = self.clone();
        info!("Follower replication every {}ms", period.as_millis());

        let handle = runtime.spawn(async move {
            let mut tick = interval(period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let writes = registry.replicate_once();
                if writes > 0 {
                    debug!("Replicated output to {} followers", writes);
                }
            }
        });

        ReplicationTask { handle }
    }
}

/// Running replication task; stopped on `shutdown` or drop
pub struct ReplicationTask {
    handle: JoinHandle<()>,
}

impl ReplicationTask {
    pub fn shutdown(self) {
        info!("Stopping follower replication");
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ReplicationTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
