//! Regional failover: pick one endpoint out of a pool, mark it down when it
//! misbehaves, move to the next candidate, and periodically try to come
//! back to the primary.
//!
//! Policies decide the scan order; availability is decided per selection by
//! checking whether each region's cool-down has elapsed, so no timer is
//! needed to bring a region back.

use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use snafu::Snafu;
use tracing::{info, warn};

#[derive(Debug, Snafu)]
pub enum FailoverError {
    #[snafu(display("no endpoint is currently available"))]
    AllRegionsDown,
    #[snafu(display("failed to build client for {endpoint}: {message}"))]
    ClientBuild { endpoint: String, message: String },
}

/// One candidate service endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: String,
    pub url: String,
    /// Relative weight for the weighted load-balance policy.
    pub weight: f64,
}

impl Endpoint {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Endpoint {
            id: id.into(),
            url: url.into(),
            weight: 1.0,
        }
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }
}

/// How the controller orders candidates on each selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Configured order, first available wins.
    Priority,
    /// Deterministic host-seeded shuffle, so a fleet spreads its load but
    /// each host is stable across restarts.
    LoadBalance,
    /// Weighted sampling without replacement, same seeding.
    WeightedLoadBalance,
    /// Probe every region and prefer the lowest round-trip time.
    RoundTripTime,
}

/// Builds clients for endpoints and answers health probes. The remote
/// protocol behind it is opaque to the controller.
#[async_trait]
pub trait ClientFactory<C>: Send + Sync {
    async fn build(&self, endpoint: &Endpoint) -> Result<C, FailoverError>;

    /// `None` when the endpoint is unreachable.
    async fn probe(&self, endpoint: &Endpoint) -> Option<Duration>;
}

#[derive(Debug)]
struct RegionState {
    endpoint: Endpoint,
    available: bool,
    marked_down_at: Option<Instant>,
}

impl RegionState {
    fn usable(&self, cooldown: Duration) -> bool {
        if self.available {
            return true;
        }
        // A region marked down comes back implicitly once its cool-down
        // has elapsed; there is no explicit recovery timer.
        self.marked_down_at
            .map(|at| at.elapsed() >= cooldown)
            .unwrap_or(true)
    }
}

/// Endpoint selector for one sink. The first configured endpoint is the
/// primary; everything else is a secondary in the order given.
pub struct FailoverController<C> {
    regions: Vec<RegionState>,
    policy: SelectionPolicy,
    cooldown: Duration,
    factory: Box<dyn ClientFactory<C>>,
    current: Option<usize>,
    seed: u64,
}

impl<C> FailoverController<C> {
    pub fn new(
        endpoints: Vec<Endpoint>,
        policy: SelectionPolicy,
        cooldown: Duration,
        factory: Box<dyn ClientFactory<C>>,
    ) -> Self {
        let seed = host_seed();
        FailoverController {
            regions: endpoints
                .into_iter()
                .map(|endpoint| RegionState {
                    endpoint,
                    available: true,
                    marked_down_at: None,
                })
                .collect(),
            policy,
            cooldown,
            factory,
            current: None,
            seed,
        }
    }

    #[cfg(test)]
    fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn current_endpoint(&self) -> Option<&Endpoint> {
        self.current.map(|index| &self.regions[index].endpoint)
    }

    pub fn is_on_primary(&self) -> bool {
        self.current == Some(0)
    }

    /// Mark a region unusable until its cool-down elapses.
    pub fn mark_down(&mut self, index: usize) {
        if let Some(region) = self.regions.get_mut(index) {
            warn!(message = "Marking region down.", endpoint = %region.endpoint.id);
            region.available = false;
            region.marked_down_at = Some(Instant::now());
        }
    }

    /// Clear a region's state entirely (available and idle).
    pub fn reset(&mut self, index: usize) {
        if let Some(region) = self.regions.get_mut(index) {
            region.available = true;
            region.marked_down_at = None;
        }
        if self.current == Some(index) {
            self.current = None;
        }
    }

    /// Pick a region by policy and build its client. Regions whose client
    /// cannot be built are marked down and skipped.
    pub async fn select(&mut self) -> Result<C, FailoverError> {
        let order = self.scan_order().await;
        for index in order {
            if !self.regions[index].usable(self.cooldown) {
                continue;
            }
            let endpoint = self.regions[index].endpoint.clone();
            match self.factory.build(&endpoint).await {
                Ok(client) => {
                    self.regions[index].available = true;
                    self.regions[index].marked_down_at = None;
                    self.current = Some(index);
                    info!(message = "Selected endpoint.", endpoint = %endpoint.id);
                    return Ok(client);
                }
                Err(error) => {
                    warn!(message = "Could not build client for endpoint.", endpoint = %endpoint.id, %error);
                    self.mark_down(index);
                }
            }
        }
        AllRegionsDownSnafu.fail()
    }

    /// The sink saw a recoverable failure on the current region: mark it
    /// down and move to the next candidate.
    pub async fn fail_over_to_secondary(&mut self) -> Result<C, FailoverError> {
        if let Some(current) = self.current {
            self.mark_down(current);
        }
        self.select().await
    }

    /// Try to return to the primary region. Returns the fresh primary
    /// client when the primary is reachable again and we are not already
    /// on it. The caller applies its own jittered switchback delay.
    pub async fn try_failback(&mut self) -> Option<C> {
        if self.is_on_primary() {
            return None;
        }
        let endpoint = self.regions.first()?.endpoint.clone();
        match self.factory.build(&endpoint).await {
            Ok(client) => {
                info!(message = "Primary endpoint is reachable again; failing back.", endpoint = %endpoint.id);
                self.regions[0].available = true;
                self.regions[0].marked_down_at = None;
                self.current = Some(0);
                Some(client)
            }
            Err(_) => None,
        }
    }

    async fn scan_order(&self) -> Vec<usize> {
        let count = self.regions.len();
        match self.policy {
            SelectionPolicy::Priority => (0..count).collect(),
            SelectionPolicy::LoadBalance => {
                let mut order: Vec<usize> = (0..count).collect();
                let mut rng = SmallRng::seed_from_u64(self.seed);
                // Fisher-Yates with the host-stable seed.
                for i in (1..count).rev() {
                    let j = rng.random_range(0..=i);
                    order.swap(i, j);
                }
                order
            }
            SelectionPolicy::WeightedLoadBalance => {
                let mut rng = SmallRng::seed_from_u64(self.seed);
                let mut remaining: Vec<usize> = (0..count).collect();
                let mut order = Vec::with_capacity(count);
                while !remaining.is_empty() {
                    let total: f64 = remaining
                        .iter()
                        .map(|&i| self.regions[i].endpoint.weight.max(0.0))
                        .sum();
                    let picked = if total <= 0.0 {
                        0
                    } else {
                        let mut roll = rng.random_range(0.0..total);
                        let mut picked = remaining.len() - 1;
                        for (slot, &i) in remaining.iter().enumerate() {
                            let weight = self.regions[i].endpoint.weight.max(0.0);
                            if roll < weight {
                                picked = slot;
                                break;
                            }
                            roll -= weight;
                        }
                        picked
                    };
                    order.push(remaining.remove(picked));
                }
                order
            }
            SelectionPolicy::RoundTripTime => {
                let mut measured = Vec::with_capacity(count);
                for (index, region) in self.regions.iter().enumerate() {
                    let rtt = self.factory.probe(&region.endpoint).await;
                    measured.push((index, rtt));
                }
                // Reachable regions first, fastest first; unreachable ones
                // stay in the scan as a last resort.
                measured.sort_by_key(|&(_, rtt)| rtt.unwrap_or(Duration::MAX));
                measured.into_iter().map(|(index, _)| index).collect()
            }
        }
    }
}

fn host_seed() -> u64 {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_owned());
    let mut hasher = DefaultHasher::new();
    host.hash(&mut hasher);
    hasher.finish()
}
