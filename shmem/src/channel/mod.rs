//! Typed access to the shared segment.
//!
//! Each process holds an [`Endpoint`] tagged with its side of the conversation.
//! Writing the message field requires a [`Turn`], which can only be obtained
//! while the ownership flag says this side may write. Publishing consumes the
//! turn and hands the buffer to the peer, so a second write before the peer
//! answers does not type-check.

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::core::{OwnershipFlag, Segment, ShmemConfig, SpinPolicy};
use crate::errors::{Result, ShmemLibError};

mod private {
    pub trait Sealed {}
}

/// One of the two roles sharing a segment.
pub trait Side: private::Sealed {
    /// Flag value that grants this side write ownership.
    const TURN: OwnershipFlag;
    /// Flag value published when handing the buffer to the peer.
    const HANDOFF: OwnershipFlag;
    const NAME: &'static str;
}

/// The process that creates the segment and issues requests.
pub enum DriverSide {}

/// The process that attaches to the segment and answers requests.
pub enum ResponderSide {}

impl private::Sealed for DriverSide {}
impl private::Sealed for ResponderSide {}

impl Side for DriverSide {
    const TURN: OwnershipFlag = OwnershipFlag::ResponderOwnsBuffer;
    const HANDOFF: OwnershipFlag = OwnershipFlag::RequestPending;
    const NAME: &'static str = "driver";
}

impl Side for ResponderSide {
    const TURN: OwnershipFlag = OwnershipFlag::RequestPending;
    const HANDOFF: OwnershipFlag = OwnershipFlag::ResponderOwnsBuffer;
    const NAME: &'static str = "responder";
}

pub struct Endpoint<S: Side> {
    segment: Segment,
    _side: PhantomData<S>,
}

/// Write ownership of the message field.
pub struct Turn<'a, S: Side> {
    endpoint: &'a mut Endpoint<S>,
}

impl<'a, S: Side> Turn<'a, S> {
    /// The message the peer published before handing over the buffer.
    pub fn message(&self) -> String {
        self.endpoint.segment.read_message()
    }

    /// Writes `message` and passes ownership to the peer.
    pub fn publish(self, message: &str) {
        let limit = self.endpoint.config().max_message_len();
        let written = self.endpoint.segment.publish(message, S::HANDOFF);
        if message.len() > limit {
            debug!(
                side = S::NAME,
                length = message.len(),
                written,
                "message truncated to fit the segment"
            );
        }
    }
}

impl<S: Side> Endpoint<S> {
    fn from_segment(segment: Segment) -> Endpoint<S> {
        Endpoint {
            segment,
            _side: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn config(&self) -> &ShmemConfig {
        self.segment.config()
    }

    pub fn spin_policy(&self) -> SpinPolicy {
        self.config().spin
    }

    /// Current ownership flag, `None` if the word holds an unknown value.
    pub fn flag(&self) -> Option<OwnershipFlag> {
        OwnershipFlag::from_raw(self.segment.load_flag())
    }

    /// Spins until the ownership flag equals `expected`, without an internal deadline.
    pub fn wait_for(&self, expected: OwnershipFlag) {
        self.segment.wait_for(expected)
    }

    /// Blocks (spinning) until the peer hands the buffer to this side.
    pub fn wait_turn(&mut self) -> Turn<'_, S> {
        self.segment.wait_for(S::TURN);
        Turn { endpoint: self }
    }

    /// Like [`wait_turn`](Self::wait_turn) but gives up once `stop` is raised.
    pub fn wait_turn_until(&mut self, stop: &AtomicBool) -> Option<Turn<'_, S>> {
        self.wait_turn_while(1, || !stop.load(Ordering::Relaxed))
    }

    /// Spins for the turn, asking `peer_alive` after every `check_every` polls
    /// whether the wait can still succeed.
    ///
    /// Returns `None` once `peer_alive` says no and the flag still does not
    /// grant the turn.
    pub fn wait_turn_while<F>(&mut self, check_every: u32, mut peer_alive: F) -> Option<Turn<'_, S>>
    where
        F: FnMut() -> bool,
    {
        let spin = self.spin_policy();
        let check_every = check_every.max(1);
        let mut round = 0;
        let mut polls = 0u32;
        while self.segment.load_flag() != S::TURN as u32 {
            polls += 1;
            if polls == check_every {
                polls = 0;
                // The peer may have handed over the buffer right before leaving.
                if !peer_alive() && self.segment.load_flag() != S::TURN as u32 {
                    return None;
                }
            }
            spin.idle(&mut round);
        }
        Some(Turn { endpoint: self })
    }

    /// Takes the turn only if the flag already grants it.
    pub fn try_turn(&mut self) -> Option<Turn<'_, S>> {
        if self.segment.load_flag() == S::TURN as u32 {
            Some(Turn { endpoint: self })
        } else {
            None
        }
    }
}

impl Endpoint<DriverSide> {
    /// Creates a zero-filled, page-sized segment at `path` and maps it.
    pub fn create(path: &Path, cfg: &ShmemConfig) -> Result<Endpoint<DriverSide>> {
        let segment = Segment::create(path, cfg)?;
        debug!(path = %path.display(), "segment created");
        Ok(Endpoint::from_segment(segment))
    }
}

impl Endpoint<ResponderSide> {
    /// Maps a segment the driver already created.
    pub fn attach(path: &Path, cfg: &ShmemConfig) -> Result<Endpoint<ResponderSide>> {
        let segment = Segment::open(path, cfg)?;
        debug!(path = %path.display(), "segment attached");
        Ok(Endpoint::from_segment(segment))
    }

    /// The responder owns a freshly created segment until it first publishes.
    pub fn first_turn(&mut self) -> Result<Turn<'_, ResponderSide>> {
        match self.segment.load_flag() {
            raw if raw == OwnershipFlag::Uninitialized as u32 => Ok(Turn { endpoint: self }),
            raw => Err(ShmemLibError::SegmentInUse(raw)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::Arc;
    use std::thread;

    use tempfile::tempdir;

    use super::*;

    type TestResult = std::result::Result<(), Box<dyn Error>>;

    #[test]
    fn turns_alternate_between_sides() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig::default();
        let mut driver = Endpoint::<DriverSide>::create(&path, &cfg)?;
        let mut responder = Endpoint::<ResponderSide>::attach(&path, &cfg)?;

        assert!(driver.try_turn().is_none());
        responder.first_turn()?.publish("ready");
        assert!(responder.try_turn().is_none());

        let turn = driver.try_turn().expect("driver should own the buffer");
        assert_eq!(turn.message(), "ready");
        turn.publish("ping");
        assert_eq!(driver.flag(), Some(OwnershipFlag::RequestPending));

        let turn = responder.wait_turn();
        assert_eq!(turn.message(), "ping");
        turn.publish("pong");

        assert_eq!(driver.wait_turn().message(), "pong");
        Ok(())
    }

    #[test]
    fn wait_for_sees_the_peer_publish() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig::default();
        let driver = Endpoint::<DriverSide>::create(&path, &cfg)?;
        let mut responder = Endpoint::<ResponderSide>::attach(&path, &cfg)?;
        assert_eq!(responder.config(), &cfg);

        driver.wait_for(OwnershipFlag::Uninitialized);
        let handle = thread::spawn(move || {
            responder.first_turn().expect("fresh segment").publish("ready");
        });
        driver.wait_for(OwnershipFlag::ResponderOwnsBuffer);
        assert_eq!(driver.flag(), Some(OwnershipFlag::ResponderOwnsBuffer));
        handle.join().expect("responder thread");
        Ok(())
    }

    #[test]
    fn wait_turn_while_gives_up_on_a_dead_peer() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig::default();
        let mut driver = Endpoint::<DriverSide>::create(&path, &cfg)?;
        let mut responder = Endpoint::<ResponderSide>::attach(&path, &cfg)?;

        let mut checks = 0;
        assert!(driver
            .wait_turn_while(4, || {
                checks += 1;
                checks < 3
            })
            .is_none());
        assert_eq!(checks, 3);

        // A turn handed over before the peer left is still taken.
        responder.first_turn()?.publish("ready");
        let turn = driver.wait_turn_while(1, || false).expect("buffer already handed over");
        assert_eq!(turn.message(), "ready");
        Ok(())
    }

    #[test]
    fn first_turn_requires_fresh_segment() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig::default();
        let _driver = Endpoint::<DriverSide>::create(&path, &cfg)?;

        let mut first = Endpoint::<ResponderSide>::attach(&path, &cfg)?;
        first.first_turn()?.publish("ready");

        let mut second = Endpoint::<ResponderSide>::attach(&path, &cfg)?;
        assert!(matches!(second.first_turn(), Err(ShmemLibError::SegmentInUse(1))));
        Ok(())
    }

    #[test]
    fn wait_turn_until_observes_stop() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig::default();
        let _driver = Endpoint::<DriverSide>::create(&path, &cfg)?;
        let mut responder = Endpoint::<ResponderSide>::attach(&path, &cfg)?;

        let stop = AtomicBool::new(true);
        assert!(responder.wait_turn_until(&stop).is_none());
        Ok(())
    }

    #[test]
    fn ping_pong_across_threads() -> TestResult {
        let dir = tempdir()?;
        let path = dir.path().join("segment.mem");
        let cfg = ShmemConfig {
            spin: SpinPolicy::busy(),
            ..Default::default()
        };
        let mut driver = Endpoint::<DriverSide>::create(&path, &cfg)?;
        let mut responder = Endpoint::<ResponderSide>::attach(&path, &cfg)?;
        let rounds = 1_000;

        let stop = Arc::new(AtomicBool::new(false));
        let responder_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            responder
                .first_turn()
                .expect("fresh segment")
                .publish("ready");
            let mut answered = 0;
            while let Some(turn) = responder.wait_turn_until(&responder_stop) {
                let request = turn.message();
                turn.publish(&request.replace("ping", "pong"));
                answered += 1;
            }
            answered
        });

        assert_eq!(driver.wait_turn().message(), "ready");
        for i in 0..rounds {
            driver.wait_turn().publish(&format!("ping {}", i));
            let reply = driver.wait_turn().message();
            assert_eq!(reply, format!("pong {}", i));
        }
        stop.store(true, Ordering::Relaxed);
        assert_eq!(handle.join().expect("responder thread"), rounds);
        Ok(())
    }
}
