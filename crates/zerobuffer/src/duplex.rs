// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response channels built from a pair of plain zerobuffer
//! channels: one carrying requests from client to server, one carrying
//! responses back. A response frame is published with the same sequence
//! number as the request it answers, so the client correlates the two
//! without an extra header field.
//!
//! Bootstrap order: the server creates the request buffer first (it is the
//! request [`crate::reader::Reader`]); the client creates the response
//! buffer (it is the response `Reader`) and attaches as the request
//! [`crate::writer::Writer`]; the server then attaches as the response
//! `Writer`, retrying until the client's response buffer exists.

use std::time::{Duration, Instant};

use crate::error::{Result, ZeroBufferError};
use crate::reader::{BufferConfig, Reader};
use crate::writer::Writer;

fn request_name(base: &str) -> String {
    format!("{base}_request")
}

fn response_name(base: &str) -> String {
    format!("{base}_response")
}

/// How a [`DuplexServer`] dispatches incoming requests to its handler.
#[derive(Debug, Clone, Copy)]
pub enum ProcessingMode {
    /// Handle one request at a time on the calling thread, in arrival
    /// order. This is the only mode implemented today.
    SingleThread,
    /// Dispatch requests to a fixed-size worker pool, processing several
    /// concurrently. Reserved for a future revision: responses would need
    /// to be written out of order, which requires either per-worker
    /// response buffers or a response-side reordering buffer neither of
    /// which exists yet.
    Pooled { workers: usize },
}

/// The server half of a duplex channel: reads requests, calls a handler,
/// writes the response back tagged with the request's sequence number.
pub struct DuplexServer {
    base_name: String,
    requests: Reader,
    responses: Option<Writer>,
}

impl DuplexServer {
    /// Create the request buffer and start listening for a client. The
    /// response buffer does not exist yet; call [`DuplexServer::accept`]
    /// before [`DuplexServer::run`].
    pub fn create(base_name: &str, config: BufferConfig) -> Result<Self> {
        let requests = Reader::create(&request_name(base_name), config)?;
        Ok(Self {
            base_name: base_name.to_string(),
            requests,
            responses: None,
        })
    }

    /// Block up to `timeout`, retrying, until the client has created the
    /// response buffer and this server can attach to it as its writer.
    pub fn accept(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match Writer::attach(&response_name(&self.base_name)) {
                Ok(writer) => {
                    self.responses = Some(writer);
                    log::info!("[zerobuffer] duplex server '{}' accepted a client", self.base_name);
                    return Ok(());
                }
                Err(ZeroBufferError::NotFound(_)) => {
                    if Instant::now() >= deadline {
                        return Err(ZeroBufferError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Process exactly one request, blocking up to `timeout` for it to
    /// arrive. Returns `Ok(false)` on a request-side timeout with the
    /// client still connected (nothing to process right now); `Ok(true)`
    /// after a request was answered.
    pub fn process_once<F>(&mut self, timeout: Duration, mut handler: F) -> Result<bool>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        let responses = self.responses.as_mut().ok_or(ZeroBufferError::NotFound(
            "no client attached; call DuplexServer::accept first".to_string(),
        ))?;

        let frame = match self.requests.read_frame(timeout) {
            Ok(frame) => frame,
            Err(ZeroBufferError::Timeout) => return Ok(false),
            Err(e) => return Err(e),
        };
        let sequence = frame.sequence();
        let response_payload = handler(frame.payload());
        self.requests.release_frame(frame)?;
        responses.write_frame_with_sequence(&response_payload, sequence, timeout)?;
        Ok(true)
    }

    /// Run the request/response loop until the client disconnects or an
    /// unrecoverable error occurs. Only [`ProcessingMode::SingleThread`] is
    /// currently implemented.
    pub fn run<F>(&mut self, mode: ProcessingMode, poll_timeout: Duration, mut handler: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Vec<u8>,
    {
        match mode {
            ProcessingMode::SingleThread => loop {
                match self.process_once(poll_timeout, &mut handler) {
                    Ok(_) => continue,
                    Err(ZeroBufferError::WriterDead) => return Ok(()),
                    Err(e) => return Err(e),
                }
            },
            ProcessingMode::Pooled { workers } => {
                log::warn!(
                    "[zerobuffer] duplex pooled processing ({workers} workers) is not implemented yet"
                );
                Err(ZeroBufferError::Io(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "ProcessingMode::Pooled is not implemented",
                )))
            }
        }
    }
}

/// The client half of a duplex channel: sends a request and blocks for the
/// matching response.
pub struct DuplexClient {
    responses: Reader,
    requests: Writer,
    next_sequence: u64,
}

impl DuplexClient {
    /// Create the response buffer, then attach to the server's request
    /// buffer, retrying up to `timeout` if the server has not started yet.
    pub fn connect(base_name: &str, config: BufferConfig, timeout: Duration) -> Result<Self> {
        let responses = Reader::create(&response_name(base_name), config)?;
        let deadline = Instant::now() + timeout;
        let requests = loop {
            match Writer::attach(&request_name(base_name)) {
                Ok(writer) => break writer,
                Err(ZeroBufferError::NotFound(_)) => {
                    if Instant::now() >= deadline {
                        return Err(ZeroBufferError::Timeout);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(e),
            }
        };
        Ok(Self {
            responses,
            requests,
            next_sequence: 1,
        })
    }

    /// Send `request` and block up to `timeout` for the correlated
    /// response.
    pub fn send_receive(&mut self, request: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let sequence = self.next_sequence;
        self.requests.write_frame_with_sequence(request, sequence, timeout)?;
        self.next_sequence += 1;
        loop {
            let frame = self.responses.read_frame(timeout)?;
            if frame.sequence() != sequence {
                let got = frame.sequence();
                self.responses.release_frame(frame)?;
                return Err(ZeroBufferError::SequenceError {
                    expected: sequence,
                    actual: got,
                });
            }
            let payload = frame.payload().to_vec();
            self.responses.release_frame(frame)?;
            return Ok(payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        format!("zb_duplex_{prefix}_{ts}")
    }

    #[test]
    fn echo_round_trip_single_thread() {
        let base = unique_name("echo");
        let config = BufferConfig::new(0, 4096).unwrap();
        let mut server = DuplexServer::create(&base, config).unwrap();

        let server_thread = std::thread::spawn({
            let base = base.clone();
            move || {
                let mut client = DuplexClient::connect(&base, config, Duration::from_secs(2)).unwrap();
                let reply = client.send_receive(b"ping", Duration::from_secs(2)).unwrap();
                assert_eq!(reply, b"pong");
            }
        });

        server.accept(Duration::from_secs(2)).unwrap();
        server
            .process_once(Duration::from_secs(2), |req| {
                assert_eq!(req, b"ping");
                b"pong".to_vec()
            })
            .unwrap();

        server_thread.join().unwrap();
    }
}
