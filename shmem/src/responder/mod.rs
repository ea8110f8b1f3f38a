use std::path::Path;
use std::sync::atomic::AtomicBool;

use tracing::{debug, info};

use crate::channel::{Endpoint, ResponderSide};
use crate::core::ShmemConfig;
use crate::errors::Result;
use crate::protocol::{self, Shutdown};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResponderState {
    Starting,
    Ready,
    AwaitingRequest,
    Processing,
    Terminated,
}

/// Answers requests published into a shared segment until told to quit.
pub struct Responder {
    endpoint: Endpoint<ResponderSide>,
    state: ResponderState,
    handled: u64,
}

impl Responder {
    pub fn new(endpoint: Endpoint<ResponderSide>) -> Responder {
        Responder {
            endpoint,
            state: ResponderState::Starting,
            handled: 0,
        }
    }

    pub fn attach(path: &Path, cfg: &ShmemConfig) -> Result<Responder> {
        Ok(Responder::new(Endpoint::attach(path, cfg)?))
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    /// Requests answered so far, unknown commands included.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Announces readiness, then serves requests until `quit` or until `stop` is raised.
    ///
    /// `quit` is not acknowledged: the flag is left at "request pending".
    pub fn run(&mut self, stop: &AtomicBool) -> Result<Shutdown> {
        self.endpoint.first_turn()?.publish(protocol::READY);
        self.state = ResponderState::Ready;
        info!(path = %self.endpoint.path().display(), "responder ready");

        loop {
            self.state = ResponderState::AwaitingRequest;
            let turn = match self.endpoint.wait_turn_until(stop) {
                Some(turn) => turn,
                None => {
                    self.state = ResponderState::Terminated;
                    info!(handled = self.handled, "stop requested");
                    return Ok(Shutdown::Signalled);
                }
            };
            self.state = ResponderState::Processing;
            let request = turn.message();
            match protocol::reply_to(&request) {
                Some(reply) => {
                    turn.publish(reply);
                    self.handled += 1;
                }
                None => {
                    self.state = ResponderState::Terminated;
                    debug!(handled = self.handled, "quit received");
                    return Ok(Shutdown::Quit);
                }
            }
        }
    }
}
