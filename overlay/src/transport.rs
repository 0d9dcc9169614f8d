//! Delivery of messages between peers.

use crate::{identity::PeerId, Error};
use rand::{rngs::StdRng, Rng};
use rand_distr::{Distribution, Normal};
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tracing::trace;

/// What happens to a transmitted message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fate {
    /// Deliver after the given latency.
    Deliver(Duration),
    /// Silently lost in transit.
    Lose,
}

/// Decides whether and when a message from one peer reaches another.
///
/// Returning an error reports the transmission as failed to the sender (for requests, the
/// failure callback receives [Error::NetworkError]). Returning [Fate::Lose] drops the
/// message without telling anyone.
pub trait Transport: Send + 'static {
    fn transmit(&mut self, from: PeerId, to: PeerId, rng: &mut StdRng) -> Result<Fate, Error>;
}

/// Describes a connection between two peers.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Link {
    /// Mean latency for the delivery of a message.
    pub latency: Duration,

    /// Standard deviation of the latency for the delivery of a message.
    pub jitter: Duration,

    /// Probability of a message being delivered successfully (in range [0,1]).
    pub success_rate: f64,
}

impl Link {
    fn validate(&self) -> Result<(), Error> {
        if !(0.0..=1.0).contains(&self.success_rate) {
            return Err(Error::InvalidSuccessRate(self.success_rate));
        }
        Ok(())
    }

    fn sample(&self, rng: &mut StdRng) -> Fate {
        if !rng.gen_bool(self.success_rate) {
            return Fate::Lose;
        }
        let mean = self.latency.as_micros() as f64 / 1000.0;
        let stddev = self.jitter.as_micros() as f64 / 1000.0;
        let ms = match Normal::new(mean, stddev) {
            Ok(normal) => normal.sample(rng).max(0.0),
            Err(_) => mean,
        };
        Fate::Deliver(Duration::from_micros((ms * 1000.0) as u64))
    }
}

/// Per-link simulated network.
///
/// Deliveries between nodes hosted by the same peer are immediate. Other deliveries use the
/// link configured for the pair, falling back to a default link.
#[derive(Default)]
pub struct Simulated {
    default: Option<Link>,
    links: HashMap<(PeerId, PeerId), Link>,
    down: HashSet<PeerId>,
}

impl Simulated {
    /// Create a network where unlisted pairs use `default` (or cannot communicate at all).
    pub fn new(default: Option<Link>) -> Result<Self, Error> {
        if let Some(link) = &default {
            link.validate()?;
        }
        Ok(Self {
            default,
            ..Default::default()
        })
    }

    /// Create a unidirectional link between two peers.
    ///
    /// Link can be called multiple times for the same sender/receiver. The latest
    /// setting will be used.
    pub fn link(&mut self, sender: PeerId, receiver: PeerId, link: Link) -> Result<(), Error> {
        if sender == receiver {
            return Err(Error::LinkingSelf);
        }
        link.validate()?;
        self.links.insert((sender, receiver), link);
        Ok(())
    }

    pub fn unlink(&mut self, sender: PeerId, receiver: PeerId) -> bool {
        self.links.remove(&(sender, receiver)).is_some()
    }

    /// Mark a peer unreachable (or reachable again).
    pub fn set_down(&mut self, peer: PeerId, down: bool) {
        if down {
            self.down.insert(peer);
        } else {
            self.down.remove(&peer);
        }
    }
}

impl Transport for Simulated {
    fn transmit(&mut self, from: PeerId, to: PeerId, rng: &mut StdRng) -> Result<Fate, Error> {
        if from == to {
            return Ok(Fate::Deliver(Duration::ZERO));
        }
        if self.down.contains(&from) || self.down.contains(&to) {
            return Err(Error::NetworkError(format!("{to} unreachable")));
        }
        let Some(link) = self.links.get(&(from, to)).or(self.default.as_ref()) else {
            trace!(%from, %to, reason = "no link", "failing transmission");
            return Err(Error::NetworkError(format!("no link from {from} to {to}")));
        };
        Ok(link.sample(rng))
    }
}

/// Star topology: every peer hangs off a hub with its own one-way delay, and a message
/// between two peers takes the sum of both delays. Nothing is lost.
#[derive(Clone, Debug, Default)]
pub struct Star {
    default: Duration,
    delays: HashMap<PeerId, Duration>,
}

impl Star {
    pub fn new(default: Duration) -> Self {
        Self {
            default,
            delays: HashMap::new(),
        }
    }

    pub fn set(&mut self, peer: PeerId, delay: Duration) {
        self.delays.insert(peer, delay);
    }

    fn delay(&self, peer: PeerId) -> Duration {
        self.delays.get(&peer).copied().unwrap_or(self.default)
    }
}

impl Transport for Star {
    fn transmit(&mut self, from: PeerId, to: PeerId, _rng: &mut StdRng) -> Result<Fate, Error> {
        if from == to {
            return Ok(Fate::Deliver(Duration::ZERO));
        }
        Ok(Fate::Deliver(self.delay(from) + self.delay(to)))
    }
}
