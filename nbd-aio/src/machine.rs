//! Per-connection protocol state machine.
//!
//! The machine interleaves two sub-machines on one nonblocking transport:
//! the issue machine (frames the head of the pending queue and transmits
//! request plus payload) and the reply machine (reads reply headers,
//! correlates them to in-flight commands by handle, and receives read
//! payloads). Transmission can be suspended mid-frame to service an
//! incoming reply; the partial transfer cursor is preserved verbatim and
//! the issue machine resumes at the exact byte it stopped at.
//!
//! Every transition is nonblocking and completes in bounded time; the
//! owning task blocks only in its readiness poll.

use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use tracing::{debug, trace, warn};

use nbd_proto::{Request, SimpleReply};

use crate::command::{Command, CommandError, CommandResult, Kind};
use crate::cursor::{Cursor, Progress};
use crate::error::Error;
use crate::transport::{Direction, Transport};

/// Payloads below this size are worth coalescing with the next request
/// frame when one is already queued.
const PAYLOAD_COALESCE_MAX: usize = 64 * 1024;

/// Issue sub-machine states.
///
/// `Start`, `PrepareWritePayload`, and `Finish` are transient: they are
/// always stepped through synchronously and never observed between
/// notifications. Only the two send states persist across a `WouldBlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IssueState {
    Start,
    SendRequest,
    PauseSendRequest,
    PrepareWritePayload,
    SendWritePayload,
    PauseWritePayload,
    Finish,
}

/// Reply sub-machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReplyState {
    Header,
    Payload { handle: u64 },
}

/// Connection state. `Dead` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum State {
    Ready,
    Issue(IssueState),
    Reply(ReplyState),
    Dead,
    Closed,
}

/// The protocol engine for one connection.
///
/// Owns the pending queue, the in-flight set, and the transfer cursors;
/// exactly one task may drive it at a time, which is what makes it safe
/// without locks.
pub struct Machine {
    state: State,
    /// Accepted commands not yet fully transmitted, FIFO. The head is the
    /// command currently being issued.
    pending: VecDeque<Command>,
    /// Fully transmitted commands awaiting replies, keyed by handle.
    in_flight: HashMap<u64, Command>,
    /// Finished commands awaiting retirement by the caller.
    completed: HashMap<u64, CommandResult>,
    next_handle: u64,

    // Outbound transfer state
    request_frame: [u8; Request::SIZE_BYTES],
    send_cursor: Cursor,
    /// Whether an interrupted transmission was in the payload rather than
    /// the request frame, so resumption picks the right send state.
    in_write_payload: bool,

    // Inbound transfer state
    reply_frame: [u8; SimpleReply::SIZE_BYTES],
    recv_cursor: Cursor,

    death_reason: Option<String>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl Machine {
    pub fn new() -> Self {
        Self {
            state: State::Ready,
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            completed: HashMap::new(),
            next_handle: 1,
            request_frame: [0u8; Request::SIZE_BYTES],
            send_cursor: Cursor::default(),
            in_write_payload: false,
            reply_frame: [0u8; SimpleReply::SIZE_BYTES],
            recv_cursor: Cursor::default(),
            death_reason: None,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Accept a command, assign its handle, and queue it for transmission.
    ///
    /// The queue is unbounded; in-flight windowing is the caller's job.
    pub fn enqueue(
        &mut self,
        kind: Kind,
        flags: u16,
        offset: u64,
        length: u32,
        payload: Option<Bytes>,
    ) -> Result<u64, Error> {
        match self.state {
            State::Dead => {
                return Err(Error::ConnectionDead {
                    reason: self.death_reason.clone().unwrap_or_default(),
                })
            }
            State::Closed => return Err(Error::ConnectionClosed),
            _ => {}
        }

        let handle = self.next_handle;
        self.next_handle += 1;

        let cmd = match payload {
            Some(payload) => Command::with_payload(kind, flags, handle, offset, payload),
            None => Command::new(kind, flags, handle, offset, length),
        };
        trace!(handle, kind = %cmd.kind, offset, length = cmd.length, "command queued");
        self.pending.push_back(cmd);
        Ok(handle)
    }

    /// Which transport readiness the machine currently needs.
    pub fn direction(&self) -> Direction {
        match self.state {
            State::Dead | State::Closed => Direction::None,
            State::Reply(_) => Direction::Read,
            State::Issue(_) => Direction::Both,
            State::Ready => {
                if self.pending.is_empty() {
                    Direction::Read
                } else {
                    Direction::Both
                }
            }
        }
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.state, State::Dead)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Idle and able to start issuing a new command.
    pub fn is_ready(&self) -> bool {
        matches!(self.state, State::Ready)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn dead_reason(&self) -> Option<&str> {
        self.death_reason.as_deref()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Retire a finished command, returning its result.
    ///
    /// Returns `None` while the command is still pending or in flight, and
    /// for handles already retired; a completion is observed at most once.
    pub fn command_completed(&mut self, handle: u64) -> Option<CommandResult> {
        self.completed.remove(&handle)
    }

    /// The transport became writable: transmit as much queued output as it
    /// will take.
    pub fn notify_writable<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        match self.state {
            State::Dead | State::Closed | State::Reply(_) => Ok(()),
            State::Ready => {
                if self.pending.is_empty() {
                    return Ok(());
                }
                self.state = State::Issue(IssueState::Start);
                self.run_issue(transport)
            }
            State::Issue(_) => self.run_issue(transport),
        }
    }

    /// The transport became readable: service incoming replies, pausing an
    /// in-progress transmission if there is one.
    pub fn notify_readable<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        match self.state {
            State::Dead | State::Closed => return Ok(()),
            State::Issue(IssueState::SendRequest) => {
                // Suspend mid-request; the send cursor is preserved
                // verbatim and Start resumes it after the reply machine
                // hands control back.
                self.state = State::Issue(IssueState::PauseSendRequest);
                self.in_write_payload = false;
                self.enter_reply();
            }
            State::Issue(IssueState::SendWritePayload) => {
                self.state = State::Issue(IssueState::PauseWritePayload);
                self.in_write_payload = true;
                self.enter_reply();
            }
            State::Issue(_) => return Ok(()),
            State::Ready => self.enter_reply(),
            State::Reply(_) => {}
        }
        self.run_reply(transport)
    }

    fn run_issue<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        loop {
            let State::Issue(issue) = self.state else {
                return Ok(());
            };
            match issue {
                IssueState::Start => {
                    // Were we interrupted by reading a reply to an earlier
                    // command? Resume instead of re-framing.
                    if self.send_cursor.in_progress() {
                        self.state = State::Issue(if self.in_write_payload {
                            IssueState::SendWritePayload
                        } else {
                            IssueState::SendRequest
                        });
                        continue;
                    }

                    let Some(cmd) = self.pending.front() else {
                        self.state = State::Ready;
                        return Ok(());
                    };
                    let req = Request {
                        flags: cmd.flags,
                        command: cmd.kind,
                        handle: cmd.handle,
                        offset: cmd.offset,
                        length: cmd.length,
                    };
                    self.request_frame = req.to_bytes();
                    self.send_cursor.begin(Request::SIZE_BYTES);
                    self.in_write_payload = false;
                    transport
                        .hint_more(cmd.kind.has_write_payload() || self.pending.len() > 1);
                    self.state = State::Issue(IssueState::SendRequest);
                }
                IssueState::SendRequest => {
                    let frame = self.request_frame;
                    match self.send_cursor.send(transport, &frame) {
                        Ok(Progress::Complete) => {
                            self.state = State::Issue(IssueState::PrepareWritePayload)
                        }
                        Ok(Progress::Blocked) => return Ok(()),
                        Err(e) => return self.die(e),
                    }
                }
                IssueState::PrepareWritePayload => {
                    let Some(cmd) = self.pending.front() else {
                        self.state = State::Ready;
                        return Ok(());
                    };
                    debug_assert_eq!(self.request_frame[8..16], cmd.handle.to_be_bytes());
                    if !cmd.payload.is_empty() {
                        let coalesce =
                            cmd.payload.len() < PAYLOAD_COALESCE_MAX && self.pending.len() > 1;
                        self.send_cursor.begin(cmd.payload.len());
                        self.in_write_payload = true;
                        transport.hint_more(coalesce);
                        self.state = State::Issue(IssueState::SendWritePayload);
                    } else {
                        self.state = State::Issue(IssueState::Finish);
                    }
                }
                IssueState::SendWritePayload => {
                    let payload = match self.pending.front() {
                        Some(cmd) => cmd.payload.clone(),
                        None => {
                            self.state = State::Ready;
                            return Ok(());
                        }
                    };
                    match self.send_cursor.send(transport, &payload) {
                        Ok(Progress::Complete) => self.state = State::Issue(IssueState::Finish),
                        Ok(Progress::Blocked) => return Ok(()),
                        Err(e) => return self.die(e),
                    }
                }
                IssueState::Finish => {
                    debug_assert!(!self.send_cursor.in_progress());
                    let Some(cmd) = self.pending.pop_front() else {
                        self.state = State::Ready;
                        return Ok(());
                    };
                    self.in_write_payload = false;
                    self.bytes_sent += (Request::SIZE_BYTES + cmd.payload.len()) as u64;
                    trace!(handle = cmd.handle, kind = %cmd.kind, "command issued");

                    if cmd.kind == Kind::Disconnect {
                        self.completed.insert(cmd.handle, Ok(Bytes::new()));
                        return self.shutdown();
                    }

                    self.in_flight.insert(cmd.handle, cmd);
                    if self.pending.is_empty() {
                        self.state = State::Ready;
                        return Ok(());
                    }
                    self.state = State::Issue(IssueState::Start);
                }
                IssueState::PauseSendRequest | IssueState::PauseWritePayload => {
                    // Only set transiently while handing control to the
                    // reply machine; never reached here.
                    return Ok(());
                }
            }
        }
    }

    fn run_reply<T: Transport>(&mut self, transport: &mut T) -> Result<(), Error> {
        loop {
            match self.state {
                State::Reply(ReplyState::Header) => {
                    let mut frame = self.reply_frame;
                    match self.recv_cursor.recv(transport, &mut frame) {
                        Ok(Progress::Blocked) => {
                            self.reply_frame = frame;
                            if self.recv_cursor.transferred() == 0 {
                                // Nothing consumed; hand control back so
                                // transmission can continue.
                                self.exit_reply();
                            }
                            return Ok(());
                        }
                        Ok(Progress::Complete) => {
                            self.reply_frame = frame;
                            if let Err(e) = self.on_reply_header() {
                                return self.die(e);
                            }
                        }
                        Err(e) => return self.die(e),
                    }
                }
                State::Reply(ReplyState::Payload { handle }) => {
                    let mut data = match self.in_flight.get_mut(&handle) {
                        Some(cmd) => std::mem::take(&mut cmd.data),
                        None => {
                            // Cannot happen: the handle was matched when the
                            // header was parsed and nothing removes it until
                            // completion.
                            self.exit_reply();
                            return Ok(());
                        }
                    };
                    match self.recv_cursor.recv(transport, &mut data) {
                        Ok(Progress::Blocked) => {
                            if let Some(cmd) = self.in_flight.get_mut(&handle) {
                                cmd.data = data;
                            }
                            return Ok(());
                        }
                        Ok(Progress::Complete) => {
                            if let Some(mut cmd) = self.in_flight.remove(&handle) {
                                cmd.data = data;
                                self.bytes_received += cmd.length as u64;
                                trace!(handle, length = cmd.length, "read payload received");
                                self.completed.insert(handle, cmd.into_result());
                            }
                            // Look for another reply already buffered.
                            self.enter_reply();
                        }
                        Err(e) => return self.die(e),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    /// Handle a fully received reply header: correlate and either complete
    /// the command or switch to payload reception.
    fn on_reply_header(&mut self) -> Result<(), Error> {
        let reply = SimpleReply::from_bytes(&self.reply_frame)?;
        self.bytes_received += SimpleReply::SIZE_BYTES as u64;

        let (kind, length) = match self.in_flight.get(&reply.handle) {
            Some(cmd) => (cmd.kind, cmd.length),
            None => return Err(Error::UnexpectedHandle {
                handle: reply.handle,
            }),
        };

        if reply.is_err() {
            // Remote-reported error: only this command fails, and an error
            // reply carries no payload even for reads.
            if let Some(cmd) = self.in_flight.remove(&reply.handle) {
                debug!(handle = cmd.handle, errno = reply.error, "command failed by server");
                self.completed
                    .insert(cmd.handle, Err(CommandError::Remote { errno: reply.error }));
            }
            self.enter_reply();
        } else if kind.has_read_payload() && length > 0 {
            self.recv_cursor.begin(length as usize);
            self.state = State::Reply(ReplyState::Payload {
                handle: reply.handle,
            });
        } else {
            if let Some(cmd) = self.in_flight.remove(&reply.handle) {
                trace!(handle = cmd.handle, kind = %cmd.kind, "command completed");
                self.completed.insert(cmd.handle, cmd.into_result());
            }
            self.enter_reply();
        }
        Ok(())
    }

    fn enter_reply(&mut self) {
        self.recv_cursor.begin(SimpleReply::SIZE_BYTES);
        self.state = State::Reply(ReplyState::Header);
    }

    /// Hand control back from the reply machine: resume an interrupted
    /// transmission at the exact byte it stopped at, or go idle.
    fn exit_reply(&mut self) {
        self.state = if self.send_cursor.in_progress() {
            State::Issue(if self.in_write_payload {
                IssueState::SendWritePayload
            } else {
                IssueState::SendRequest
            })
        } else {
            State::Ready
        };
    }

    /// Fatal transition: fail every outstanding command exactly once and
    /// refuse all further I/O.
    fn die(&mut self, error: Error) -> Result<(), Error> {
        let reason = error.to_string();
        warn!(
            %reason,
            pending = self.pending.len(),
            in_flight = self.in_flight.len(),
            "connection dead"
        );
        self.state = State::Dead;
        self.death_reason = Some(reason.clone());

        let failure = CommandError::Disconnected { reason };
        for cmd in self.pending.drain(..) {
            self.completed.insert(cmd.handle, Err(failure.clone()));
        }
        for (handle, _) in self.in_flight.drain() {
            self.completed.insert(handle, Err(failure.clone()));
        }
        Err(error)
    }

    /// Clean shutdown after a disconnect request has been transmitted.
    /// NBD_CMD_DISC has no reply; anything still outstanding fails.
    fn shutdown(&mut self) -> Result<(), Error> {
        debug!(
            pending = self.pending.len(),
            in_flight = self.in_flight.len(),
            "connection shut down"
        );
        self.state = State::Closed;
        for cmd in self.pending.drain(..) {
            self.completed.insert(cmd.handle, Err(CommandError::Closed));
        }
        for (handle, _) in self.in_flight.drain() {
            self.completed.insert(handle, Err(CommandError::Closed));
        }
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}
