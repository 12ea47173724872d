//! Scripted in-memory transport for protocol-layer tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::error::SerialError;
use crate::serial::Transport;

/// A [`Transport`] backed by byte queues.
///
/// Reads pop from `rx` and time out immediately once it is empty. Every
/// `send` records the written bytes and, if a scripted response is queued,
/// appends that response to `rx`. That is enough to fake both a chattering
/// autopilot and an AT-command modem.
#[derive(Default)]
pub struct FakeTransport {
    pub rx: VecDeque<u8>,
    /// One entry per `send` call, in order.
    pub tx: Vec<Vec<u8>>,
    /// Responses queued up front; one is consumed per `send` call.
    pub on_send: VecDeque<Vec<u8>>,
}

impl FakeTransport {
    /// Append bytes the next reads will see.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes);
    }

    /// Queue the response to the next unanswered `send` call.
    pub fn respond(&mut self, bytes: &[u8]) {
        self.on_send.push_back(bytes.to_vec());
    }

    /// Everything written so far, flattened.
    pub fn sent(&self) -> Vec<u8> {
        self.tx.iter().flatten().copied().collect()
    }
}

impl Transport for FakeTransport {
    fn read_byte(&mut self, timeout: Duration) -> Result<u8, SerialError> {
        self.rx.pop_front().ok_or(SerialError::Timeout { timeout })
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), SerialError> {
        self.tx.push(bytes.to_vec());
        if let Some(response) = self.on_send.pop_front() {
            self.rx.extend(response);
        }
        Ok(())
    }
}
